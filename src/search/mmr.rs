//! Maximal Marginal Relevance diversification

use crate::error::{RagcapError, Result};
use crate::search::SearchResult;
use crate::search::similarity::cosine_similarity;
use std::collections::HashMap;
use std::str::FromStr;

/// Which score a diversified result reports as its final `score`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ScoreMode {
    /// Keep the retrieval strategy's score
    #[default]
    Retrieval,
    /// Report the MMR score
    Mmr,
}

impl FromStr for ScoreMode {
    type Err = RagcapError;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_lowercase().as_str() {
            "retrieval" => Ok(Self::Retrieval),
            "mmr" => Ok(Self::Mmr),
            other => Err(RagcapError::Configuration(format!(
                "Unknown score mode '{}'; expected 'retrieval' or 'mmr'",
                other
            ))),
        }
    }
}

/// MMR parameters
#[derive(Debug, Clone, Copy)]
pub struct MmrOptions {
    /// 1.0 ranks by relevance only, 0.0 by novelty only
    pub lambda: f32,
    /// Number of leading results considered
    pub pool_size: usize,
    pub top_k: usize,
    pub score_mode: ScoreMode,
}

/// Greedy MMR over the first `pool_size` results.
///
/// Relevance is the cosine similarity of a result's vector to the query.
/// Each step picks the candidate maximizing
/// `lambda * relevance - (1 - lambda) * max_similarity_to_selected`;
/// the first pick is the most relevant candidate. Results without a vector
/// in `vectors` have similarity 0 to everything.
pub fn mmr_rerank(
    results: Vec<SearchResult>,
    query: &[f32],
    vectors: &HashMap<i64, Vec<f32>>,
    options: &MmrOptions,
) -> Vec<SearchResult> {
    let lambda = options.lambda.clamp(0.0, 1.0);
    let mut pool: Vec<SearchResult> = results.into_iter().take(options.pool_size).collect();

    let similarity = |a: i64, b: &[f32]| -> f32 {
        vectors
            .get(&a)
            .map(|v| cosine_similarity(v, b))
            .unwrap_or(0.0)
    };

    let mut relevance: Vec<f32> = pool.iter().map(|r| similarity(r.chunk_id, query)).collect();
    let mut selected: Vec<SearchResult> = Vec::with_capacity(options.top_k.min(pool.len()));

    while selected.len() < options.top_k && !pool.is_empty() {
        let mut best = 0;
        let mut best_score = f32::NEG_INFINITY;

        for (i, candidate) in pool.iter().enumerate() {
            let score = if selected.is_empty() {
                relevance[i]
            } else {
                let redundancy = match vectors.get(&candidate.chunk_id) {
                    Some(vector) => selected
                        .iter()
                        .map(|s| similarity(s.chunk_id, vector))
                        .fold(f32::NEG_INFINITY, f32::max),
                    None => 0.0,
                };
                lambda * relevance[i] - (1.0 - lambda) * redundancy
            };

            if score > best_score {
                best = i;
                best_score = score;
            }
        }

        let mut picked = pool.remove(best);
        let picked_relevance = relevance.remove(best);
        let mmr_score = if selected.is_empty() {
            lambda * picked_relevance
        } else {
            best_score
        };

        picked.rerank_score = Some(mmr_score);
        picked.score = match options.score_mode {
            ScoreMode::Retrieval => picked.retrieval_score,
            ScoreMode::Mmr => mmr_score,
        };
        selected.push(picked);
    }

    selected
}
