//! Capsule storage for ragcap
//!
//! This module provides the versioned single-file capsule store using
//! embedded SQLite.

pub mod capsule;
pub mod migrations;
pub mod models;
pub mod schema;

// Re-export main types
pub use capsule::Capsule;
pub use models::{
    CapsuleStats, Chunk, ChunkDraft, Embedding, ExportRecord, Manifest, SourceDocument,
    decode_vector, encode_vector,
};
pub use schema::{CURRENT_VERSION, meta_keys};
