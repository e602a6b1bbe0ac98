//! Lexical search over the FTS5 chunk index

use crate::error::{RagcapError, Result};
use crate::search::{SearchQuery, SearchResult, Searcher};
use crate::storage::Capsule;
use regex::Regex;
use rusqlite::params;

/// Maximum number of query terms sent to FTS5
pub const MAX_QUERY_TERMS: usize = 32;

/// BM25 ranking through SQLite's `bm25()` function
pub struct Bm25Searcher<'a> {
    capsule: &'a Capsule,
    terms: Regex,
}

impl<'a> Bm25Searcher<'a> {
    pub fn new(capsule: &'a Capsule) -> Result<Self> {
        let terms = Regex::new(r"[\p{L}\p{N}]+")
            .map_err(|e| RagcapError::Search(format!("Failed to compile term regex: {}", e)))?;
        Ok(Self { capsule, terms })
    }

    /// FTS5 match expression for `query`: each letter/digit run quoted and
    /// OR-joined. `None` when the query has no terms.
    pub fn match_expression(&self, query: &str) -> Option<String> {
        let terms: Vec<String> = self
            .terms
            .find_iter(query)
            .take(MAX_QUERY_TERMS)
            .map(|m| format!("\"{}\"", m.as_str()))
            .collect();

        if terms.is_empty() {
            None
        } else {
            Some(terms.join(" OR "))
        }
    }

    /// Ranked `(chunk_id, score)` pairs, score = `-bm25()` (higher is better)
    pub fn ranked(&self, query: &str, limit: usize) -> Result<Vec<(i64, f32)>> {
        let Some(expression) = self.match_expression(query) else {
            return Ok(Vec::new());
        };

        let mut stmt = self.capsule.connection().prepare(
            "SELECT rowid, bm25(chunks_fts) AS rank FROM chunks_fts \
             WHERE chunks_fts MATCH ?1 ORDER BY rank LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![expression, limit as i64], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?))
        })?;

        let mut ranked = Vec::new();
        for row in rows {
            let (chunk_id, rank) = row?;
            ranked.push((chunk_id, -rank as f32));
        }
        log::debug!("BM25 matched {} chunks for {}", ranked.len(), expression);
        Ok(ranked)
    }

    /// Chunk ids in BM25 order, used as the candidate set of hybrid search
    pub fn candidate_ids(&self, query: &str, limit: usize) -> Result<Vec<i64>> {
        Ok(self.ranked(query, limit)?.into_iter().map(|(id, _)| id).collect())
    }
}

impl Searcher for Bm25Searcher<'_> {
    fn search(&self, query: &SearchQuery, top_k: usize) -> Result<Vec<SearchResult>> {
        let ranked = self.ranked(&query.text, top_k)?;
        crate::search::hydrate(self.capsule.connection(), &ranked)
    }

    fn name(&self) -> &'static str {
        "bm25"
    }
}
