//! Exact cosine-similarity search

use crate::error::{RagcapError, Result};
use crate::search::similarity::cosine_similarity;
use crate::search::{SearchQuery, SearchResult, Searcher, hydrate, sort_scored};
use crate::storage::Capsule;
use rayon::prelude::*;

/// Scores stored embeddings against the query embedding, either all of them
/// or a fixed candidate set
pub struct VectorSearcher<'a> {
    capsule: &'a Capsule,
    candidates: Option<Vec<i64>>,
}

impl<'a> VectorSearcher<'a> {
    /// Full scan over every stored embedding
    pub fn new(capsule: &'a Capsule) -> Self {
        Self {
            capsule,
            candidates: None,
        }
    }

    /// Restrict scoring to the given chunks
    pub fn with_candidates(capsule: &'a Capsule, candidates: Vec<i64>) -> Self {
        Self {
            capsule,
            candidates: Some(candidates),
        }
    }

    /// `(chunk_id, similarity)` best first, at most `limit` entries
    pub fn ranked(&self, embedding: &[f32], limit: usize) -> Result<Vec<(i64, f32)>> {
        let vectors: Vec<(i64, Vec<f32>)> = match &self.candidates {
            Some(ids) => {
                let mut found = self.capsule.embeddings_for_chunks(ids)?;
                ids.iter()
                    .filter_map(|id| found.remove(id).map(|v| (*id, v)))
                    .collect()
            }
            None => self.capsule.all_embeddings()?,
        };

        if let Some((_, stored)) = vectors.iter().find(|(_, v)| v.len() != embedding.len()) {
            return Err(RagcapError::DimensionMismatch {
                expected: stored.len(),
                actual: embedding.len(),
            });
        }

        let mut scored: Vec<(i64, f32)> = vectors
            .par_iter()
            .map(|(chunk_id, vector)| (*chunk_id, cosine_similarity(embedding, vector)))
            .collect();

        sort_scored(&mut scored);
        scored.truncate(limit);
        Ok(scored)
    }
}

impl Searcher for VectorSearcher<'_> {
    fn search(&self, query: &SearchQuery, top_k: usize) -> Result<Vec<SearchResult>> {
        let embedding = query
            .embedding
            .as_deref()
            .ok_or_else(|| RagcapError::Search("Vector search requires a query embedding".to_string()))?;

        let ranked = self.ranked(embedding, top_k)?;
        hydrate(self.capsule.connection(), &ranked)
    }

    fn name(&self) -> &'static str {
        "vector"
    }
}
