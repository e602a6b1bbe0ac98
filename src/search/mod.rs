//! Retrieval strategies over a capsule
//!
//! Every strategy implements [`Searcher`]: lexical BM25 over the FTS index,
//! exact cosine scans, hybrid rank fusion, and the native ANN extensions
//! wrapped in a fallback decorator. Path filtering and MMR diversification
//! are applied to a strategy's results afterwards.

pub mod ann;
pub mod bm25;
pub mod filter;
pub mod hybrid;
pub mod mmr;
pub mod similarity;
pub mod vector;

use crate::error::Result;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

pub use ann::{AnnIndex, FallbackSearcher, VecSearcher, VssSearcher};
pub use bm25::Bm25Searcher;
pub use filter::PathFilter;
pub use hybrid::{HybridSearcher, rrf_fuse};
pub use mmr::{MmrOptions, ScoreMode, mmr_rerank};
pub use similarity::cosine_similarity;
pub use vector::VectorSearcher;

/// A query as seen by the strategies
#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    /// Raw query text, used by the lexical strategies
    pub text: String,

    /// Query embedding, required by the vector strategies
    pub embedding: Option<Vec<f32>>,
}

impl SearchQuery {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            embedding: None,
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }
}

/// A ranked chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub chunk_id: i64,
    pub source_path: String,
    pub text: String,

    /// Final ranking score
    pub score: f32,

    /// Score assigned by the retrieval strategy
    pub retrieval_score: f32,

    /// MMR score, when the results were diversified
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f32>,
}

impl SearchResult {
    pub fn new(chunk_id: i64, source_path: String, text: String, score: f32) -> Self {
        Self {
            chunk_id,
            source_path,
            text,
            score,
            retrieval_score: score,
            rerank_score: None,
        }
    }
}

/// A retrieval strategy
pub trait Searcher {
    /// Up to `top_k` results, best first
    fn search(&self, query: &SearchQuery, top_k: usize) -> Result<Vec<SearchResult>>;

    /// Strategy name for logs
    fn name(&self) -> &'static str;
}

/// Attach chunk text and source path to scored chunk ids, keeping order.
/// Ids whose chunk no longer exists are dropped.
pub(crate) fn hydrate(conn: &Connection, scored: &[(i64, f32)]) -> Result<Vec<SearchResult>> {
    let mut stmt = conn.prepare(
        "SELECT s.path, c.text FROM chunks c JOIN sources s ON s.id = c.source_id WHERE c.id = ?1",
    )?;

    let mut results = Vec::with_capacity(scored.len());
    for &(chunk_id, score) in scored {
        let row: Option<(String, String)> = stmt
            .query_row(params![chunk_id], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()?;
        if let Some((path, text)) = row {
            results.push(SearchResult::new(chunk_id, path, text, score));
        }
    }
    Ok(results)
}

/// Descending by score, ties broken by ascending chunk id
pub(crate) fn sort_scored(scored: &mut [(i64, f32)]) {
    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Capsule, ChunkDraft, SourceDocument};

    #[test]
    fn test_hydrate_keeps_order_and_drops_missing() {
        let mut capsule = Capsule::open_in_memory().unwrap();
        let source = capsule.add_source(&SourceDocument::new("docs/a.txt", "x")).unwrap();
        let first = capsule
            .add_chunk(&ChunkDraft { source_id: source, text: "first".into(), token_count: 1 })
            .unwrap();
        let second = capsule
            .add_chunk(&ChunkDraft { source_id: source, text: "second".into(), token_count: 1 })
            .unwrap();

        let results =
            hydrate(capsule.connection(), &[(second, 2.0), (999, 1.5), (first, 1.0)]).unwrap();
        let ids: Vec<i64> = results.iter().map(|r| r.chunk_id).collect();
        assert_eq!(ids, vec![second, first]);
        assert_eq!(results[0].source_path, "docs/a.txt");
        assert_eq!(results[0].retrieval_score, 2.0);
    }

    #[test]
    fn test_sort_scored_breaks_ties_by_id() {
        let mut scored = vec![(3, 0.5), (1, 0.5), (2, 0.9)];
        sort_scored(&mut scored);
        assert_eq!(scored, vec![(2, 0.9), (1, 0.5), (3, 0.5)]);
    }
}
