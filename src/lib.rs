//! # ragcap
//!
//! Portable retrieval capsules: a single SQLite file holding source documents,
//! their chunks, embeddings and metadata, queried offline with lexical,
//! semantic, hybrid or native ANN search.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ragcap::{BuildPipeline, Capsule, Config, SearchOptions, SearchPipeline};
//! use ragcap::embedding::HashEmbedder;
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = Config::default();
//!     config.embedding.provider = "hash".to_string();
//!
//!     // Ingest a folder of text and markdown files
//!     let mut capsule = Capsule::open("docs.ragcap")?;
//!     let pipeline = BuildPipeline::new(config.clone(), Box::new(HashEmbedder::new(384)?))?;
//!     let report = pipeline.run(&mut capsule, Path::new("docs")).await?;
//!     println!("Stored {} chunks from {} sources", report.chunks, report.sources);
//!
//!     // Query it; the embedding provider is rebuilt from the capsule meta
//!     let search = SearchPipeline::new(&capsule, config);
//!     for result in search.run("memory safety", &SearchOptions::default()).await? {
//!         println!("{:.3} {} {}", result.score, result.source_path, result.text);
//!     }
//!
//!     Ok(())
//! }
//! ```

// Core modules
pub mod config;
pub mod embedding;
pub mod error;
pub mod loaders;
pub mod pipeline;
pub mod search;
pub mod storage;
pub mod text;
pub mod utils;

// Re-export main API types
pub use config::{Config, Recipe};
pub use error::{RagcapError, Result};
pub use pipeline::{BuildPipeline, BuildReport, SearchOptions, SearchPipeline, SearchStrategy};
pub use search::{SearchQuery, SearchResult, Searcher};
pub use storage::Capsule;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_imports() {
        let _config = Config::default();
        let _options = SearchOptions::default();
        assert_eq!(SearchStrategy::default(), SearchStrategy::Hybrid);
    }
}
