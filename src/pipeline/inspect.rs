//! Capsule inspection, comparison and validation

use crate::error::Result;
use crate::storage::{Capsule, meta_keys};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// What a capsule contains
#[derive(Debug, Clone, Serialize)]
pub struct CapsuleSummary {
    pub path: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub dimension: Option<usize>,
    pub sources: usize,
    pub chunks: usize,
    pub embeddings: usize,
    pub avg_chunk_chars: f64,
    pub avg_token_count: f64,
    pub schema_version: u32,
    pub created_at: String,
    pub exports: usize,
}

pub fn inspect(capsule: &Capsule) -> Result<CapsuleSummary> {
    let stats = capsule.stats()?;
    let manifest = capsule.manifest()?;

    Ok(CapsuleSummary {
        path: capsule.path().map(|p| p.display().to_string()),
        provider: capsule.get_meta(meta_keys::EMBEDDING_PROVIDER)?,
        model: capsule.get_meta(meta_keys::EMBEDDING_MODEL)?,
        dimension: stats.dimension,
        sources: stats.sources,
        chunks: stats.chunks,
        embeddings: stats.embeddings,
        avg_chunk_chars: stats.avg_chunk_chars,
        avg_token_count: stats.avg_token_count,
        schema_version: manifest.version,
        created_at: manifest.created_at,
        exports: manifest.exports.len(),
    })
}

/// A value in the first and the second capsule
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Change<T> {
    pub before: T,
    pub after: T,
}

impl<T: PartialEq> Change<T> {
    fn new(before: T, after: T) -> Self {
        Self { before, after }
    }

    pub fn changed(&self) -> bool {
        self.before != self.after
    }
}

/// Differences between two capsules
#[derive(Debug, Clone, Serialize)]
pub struct CapsuleDiff {
    /// Meta keys whose values differ; derived ANN fingerprints and the
    /// recipe are left out
    pub meta: BTreeMap<String, Change<Option<String>>>,
    pub added_sources: Vec<String>,
    pub removed_sources: Vec<String>,
    /// Paths present in both with a different content hash
    pub modified_sources: Vec<String>,
    pub chunk_count: Change<usize>,
    pub avg_chunk_chars: Change<f64>,
    pub dimension: Change<Option<usize>>,
    pub recipe: Change<Option<String>>,
}

impl CapsuleDiff {
    pub fn is_empty(&self) -> bool {
        self.meta.is_empty()
            && self.added_sources.is_empty()
            && self.removed_sources.is_empty()
            && self.modified_sources.is_empty()
            && !self.chunk_count.changed()
            && !self.avg_chunk_chars.changed()
            && !self.dimension.changed()
            && !self.recipe.changed()
    }
}

/// Compare `before` to `after`
pub fn diff(before: &Capsule, after: &Capsule) -> Result<CapsuleDiff> {
    let meta_before = comparable_meta(before)?;
    let meta_after = comparable_meta(after)?;
    let keys: BTreeSet<&String> = meta_before.keys().chain(meta_after.keys()).collect();

    let mut meta = BTreeMap::new();
    for key in keys {
        let change = Change::new(meta_before.get(key).cloned(), meta_after.get(key).cloned());
        if change.changed() {
            meta.insert(key.clone(), change);
        }
    }

    let hashes = |capsule: &Capsule| -> Result<BTreeMap<String, String>> {
        Ok(capsule
            .list_sources()?
            .into_iter()
            .map(|s| (s.path, s.hash))
            .collect())
    };
    let sources_before = hashes(before)?;
    let sources_after = hashes(after)?;

    let added_sources = sources_after
        .keys()
        .filter(|path| !sources_before.contains_key(*path))
        .cloned()
        .collect();
    let removed_sources = sources_before
        .keys()
        .filter(|path| !sources_after.contains_key(*path))
        .cloned()
        .collect();
    let modified_sources = sources_before
        .iter()
        .filter(|(path, hash)| sources_after.get(*path).is_some_and(|h| h != *hash))
        .map(|(path, _)| path.clone())
        .collect();

    let stats_before = before.stats()?;
    let stats_after = after.stats()?;

    Ok(CapsuleDiff {
        meta,
        added_sources,
        removed_sources,
        modified_sources,
        chunk_count: Change::new(stats_before.chunks, stats_after.chunks),
        avg_chunk_chars: Change::new(stats_before.avg_chunk_chars, stats_after.avg_chunk_chars),
        dimension: Change::new(stats_before.dimension, stats_after.dimension),
        recipe: Change::new(
            before.get_meta(meta_keys::RECIPE)?,
            after.get_meta(meta_keys::RECIPE)?,
        ),
    })
}

fn comparable_meta(capsule: &Capsule) -> Result<BTreeMap<String, String>> {
    let mut meta = capsule.all_meta()?;
    meta.retain(|key, _| key != meta_keys::RECIPE && !key.starts_with("ann."));
    Ok(meta)
}

/// Integrity problems found in a capsule
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub issues: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Check the manifest, the embedding dimension, source hashes and
/// referential integrity
pub fn validate(capsule: &Capsule) -> Result<ValidationReport> {
    let conn = capsule.connection();
    let mut issues = Vec::new();

    if count(conn, "SELECT COUNT(*) FROM manifest")? == 0 {
        issues.push("manifest is missing".to_string());
    }

    let mut stmt = conn.prepare("SELECT DISTINCT dimension FROM embeddings ORDER BY dimension")?;
    let dimensions = stmt
        .query_map([], |row| row.get::<_, i64>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    if dimensions.len() > 1 {
        let listed: Vec<String> = dimensions.iter().map(i64::to_string).collect();
        issues.push(format!("embeddings have mixed dimensions: {}", listed.join(", ")));
    }

    let malformed = count(conn, "SELECT COUNT(*) FROM embeddings WHERE LENGTH(vector) != dimension * 4")?;
    if malformed > 0 {
        issues.push(format!("{} embeddings have a byte length that does not match their dimension", malformed));
    }

    let mut stmt = conn.prepare("SELECT path FROM sources WHERE hash IS NULL OR hash = '' ORDER BY path")?;
    let unhashed = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    for path in unhashed {
        issues.push(format!("source {} has no content hash", path));
    }

    let dangling_chunks = count(
        conn,
        "SELECT COUNT(*) FROM chunks WHERE source_id NOT IN (SELECT id FROM sources)",
    )?;
    if dangling_chunks > 0 {
        issues.push(format!("{} chunks reference a missing source", dangling_chunks));
    }

    let dangling_embeddings = count(
        conn,
        "SELECT COUNT(*) FROM embeddings WHERE chunk_id NOT IN (SELECT id FROM chunks)",
    )?;
    if dangling_embeddings > 0 {
        issues.push(format!("{} embeddings reference a missing chunk", dangling_embeddings));
    }

    if issues.is_empty() {
        log::debug!("Capsule passed validation");
    } else {
        log::warn!("Capsule validation found {} issues", issues.len());
    }
    Ok(ValidationReport { issues })
}

fn count(conn: &Connection, sql: &str) -> Result<usize> {
    let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
    Ok(n as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ChunkDraft, SourceDocument};

    fn add(capsule: &mut Capsule, path: &str, content: &str, vector: Vec<f32>) {
        let chunk = ChunkDraft {
            source_id: 0,
            text: content.to_string(),
            token_count: content.split_whitespace().count(),
        };
        capsule
            .add_document(&SourceDocument::new(path, content), &[(chunk, vector)])
            .unwrap();
    }

    #[test]
    fn test_inspect_summarizes() {
        let mut capsule = Capsule::open_in_memory().unwrap();
        add(&mut capsule, "a.txt", "four char", vec![1.0, 0.0]);
        capsule.set_meta(meta_keys::EMBEDDING_PROVIDER, "hash").unwrap();

        let summary = inspect(&capsule).unwrap();
        assert_eq!(summary.provider.as_deref(), Some("hash"));
        assert_eq!(summary.model, None);
        assert_eq!(summary.dimension, Some(2));
        assert_eq!(summary.sources, 1);
        assert_eq!(summary.embeddings, 1);
        assert_eq!(summary.avg_chunk_chars, 9.0);
        assert_eq!(summary.schema_version, crate::storage::CURRENT_VERSION);
        assert!(summary.path.is_none());
    }

    #[test]
    fn test_diff_reports_source_and_meta_changes() {
        let mut before = Capsule::open_in_memory().unwrap();
        add(&mut before, "kept.txt", "same", vec![1.0, 0.0]);
        add(&mut before, "edited.txt", "old text", vec![0.0, 1.0]);
        add(&mut before, "gone.txt", "bye", vec![1.0, 1.0]);
        before.set_meta(meta_keys::EMBEDDING_MODEL, "m1").unwrap();
        before.set_meta(meta_keys::ANN_VEC_FINGERPRINT, "3:24:2").unwrap();

        let mut after = Capsule::open_in_memory().unwrap();
        add(&mut after, "kept.txt", "same", vec![1.0, 0.0]);
        add(&mut after, "edited.txt", "new text", vec![0.0, 1.0]);
        add(&mut after, "new.txt", "hello", vec![1.0, 1.0]);
        add(&mut after, "extra.txt", "more", vec![1.0, 1.0]);
        after.set_meta(meta_keys::EMBEDDING_MODEL, "m2").unwrap();
        after.set_meta(meta_keys::RECIPE, "{}").unwrap();

        let diff = diff(&before, &after).unwrap();
        assert_eq!(diff.added_sources, vec!["extra.txt", "new.txt"]);
        assert_eq!(diff.removed_sources, vec!["gone.txt"]);
        assert_eq!(diff.modified_sources, vec!["edited.txt"]);
        assert_eq!(diff.chunk_count, Change::new(3, 4));
        assert!(!diff.dimension.changed());
        assert_eq!(diff.recipe.after.as_deref(), Some("{}"));

        assert_eq!(diff.meta.len(), 1);
        let model = &diff.meta[meta_keys::EMBEDDING_MODEL];
        assert_eq!(model.before.as_deref(), Some("m1"));
        assert_eq!(model.after.as_deref(), Some("m2"));
        assert!(!diff.is_empty());
    }

    #[test]
    fn test_diff_of_identical_capsules_is_empty() {
        let mut a = Capsule::open_in_memory().unwrap();
        let mut b = Capsule::open_in_memory().unwrap();
        add(&mut a, "x.txt", "same", vec![1.0]);
        add(&mut b, "x.txt", "same", vec![1.0]);

        assert!(diff(&a, &b).unwrap().is_empty());
    }

    #[test]
    fn test_validate_clean_capsule() {
        let mut capsule = Capsule::open_in_memory().unwrap();
        add(&mut capsule, "a.txt", "alpha", vec![1.0, 0.0]);

        assert!(validate(&capsule).unwrap().is_valid());
    }

    #[test]
    fn test_validate_finds_problems() {
        let mut capsule = Capsule::open_in_memory().unwrap();
        add(&mut capsule, "a.txt", "alpha", vec![1.0, 0.0]);

        capsule
            .connection()
            .execute_batch(
                "PRAGMA foreign_keys = OFF;
                 UPDATE sources SET hash = '';
                 INSERT INTO chunks (source_id, text, token_count) VALUES (999, 'orphan', 1);
                 INSERT INTO embeddings (chunk_id, vector, dimension) VALUES (998, X'0000803F', 1);
                 PRAGMA foreign_keys = ON;",
            )
            .unwrap();

        let report = validate(&capsule).unwrap();
        assert!(!report.is_valid());
        assert!(report.issues.iter().any(|i| i.contains("mixed dimensions: 1, 2")));
        assert!(report.issues.iter().any(|i| i == "source a.txt has no content hash"));
        assert!(report.issues.iter().any(|i| i == "1 chunks reference a missing source"));
        assert!(report.issues.iter().any(|i| i == "1 embeddings reference a missing chunk"));
    }
}
