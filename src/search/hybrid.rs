//! Hybrid lexical + semantic search with Reciprocal Rank Fusion

use crate::error::Result;
use crate::search::bm25::Bm25Searcher;
use crate::search::vector::VectorSearcher;
use crate::search::{SearchQuery, SearchResult, Searcher, hydrate, sort_scored};
use crate::storage::Capsule;
use std::collections::HashMap;

/// Default number of BM25 candidates reranked by vector similarity
pub const DEFAULT_CANDIDATE_LIMIT: usize = 500;

/// Default RRF rank constant
pub const DEFAULT_RRF_K: f32 = 60.0;

/// Fuse ranked id lists: an id at zero-based `rank` in a list contributes
/// `1 / (k + rank + 1)`, and contributions are summed across lists.
pub fn rrf_fuse(lists: &[Vec<i64>], k: f32) -> Vec<(i64, f32)> {
    let mut scores: HashMap<i64, f32> = HashMap::new();
    for list in lists {
        for (rank, &id) in list.iter().enumerate() {
            *scores.entry(id).or_insert(0.0) += 1.0 / (k + rank as f32 + 1.0);
        }
    }

    let mut fused: Vec<(i64, f32)> = scores.into_iter().collect();
    sort_scored(&mut fused);
    fused
}

/// BM25 candidate retrieval followed by a vector rerank, fused with RRF
pub struct HybridSearcher<'a> {
    capsule: &'a Capsule,
    candidate_limit: usize,
    rrf_k: f32,
}

impl<'a> HybridSearcher<'a> {
    pub fn new(capsule: &'a Capsule) -> Self {
        Self {
            capsule,
            candidate_limit: DEFAULT_CANDIDATE_LIMIT,
            rrf_k: DEFAULT_RRF_K,
        }
    }

    pub fn with_candidate_limit(mut self, limit: usize) -> Self {
        self.candidate_limit = limit.max(1);
        self
    }

    pub fn with_rrf_k(mut self, k: f32) -> Self {
        self.rrf_k = k;
        self
    }
}

impl Searcher for HybridSearcher<'_> {
    fn search(&self, query: &SearchQuery, top_k: usize) -> Result<Vec<SearchResult>> {
        let lexical = Bm25Searcher::new(self.capsule)?.candidate_ids(&query.text, self.candidate_limit)?;

        let semantic = match &query.embedding {
            Some(embedding) => {
                // No lexical candidates: rank the whole capsule instead
                let searcher = if lexical.is_empty() {
                    VectorSearcher::new(self.capsule)
                } else {
                    VectorSearcher::with_candidates(self.capsule, lexical.clone())
                };
                searcher
                    .ranked(embedding, self.candidate_limit)?
                    .into_iter()
                    .map(|(id, _)| id)
                    .collect()
            }
            None => {
                log::debug!("Hybrid search without query embedding, using lexical ranks only");
                Vec::new()
            }
        };

        log::debug!(
            "Hybrid fusion of {} lexical and {} semantic candidates",
            lexical.len(),
            semantic.len()
        );

        let mut fused = rrf_fuse(&[lexical, semantic], self.rrf_k);
        fused.truncate(top_k);
        hydrate(self.capsule.connection(), &fused)
    }

    fn name(&self) -> &'static str {
        "hybrid"
    }
}
