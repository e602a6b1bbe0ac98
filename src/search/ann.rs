//! Native ANN search through SQLite loadable extensions
//!
//! Two extensions are supported: sqlite-vec (`vec0` virtual tables queried
//! with `MATCH`) and sqlite-vss (`vss0` tables queried through a
//! table-valued search function). Both keep a mirror table of the stored
//! embeddings keyed by chunk id. The mirror is a derived cache: it is
//! repopulated only when the fingerprint of the `embeddings` table changes.
//!
//! Every failure past configuration validation is reported as
//! [`RagcapError::ExtensionLoad`], which [`FallbackSearcher`] recovers from.

use crate::config::{AnnConfig, VecOptions, VssOptions};
use crate::error::{RagcapError, Result};
use crate::search::{SearchQuery, SearchResult, Searcher, hydrate};
use crate::storage::capsule::{read_meta, write_meta};
use crate::storage::{Capsule, decode_vector, encode_vector, meta_keys};
use rusqlite::{Connection, LoadExtensionGuard, params};
use std::path::{Path, PathBuf};

const VEC_TABLE: &str = "embeddings_vec";
const VSS_TABLE: &str = "embeddings_vss";

/// Outcome of preparing a mirror table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexStatus {
    /// The mirror was (re)populated
    Rebuilt,
    /// The stored fingerprint matched; nothing was written
    UpToDate,
}

/// Fingerprint of the `embeddings` table: `rows:total_bytes:max_dimension`
pub fn embeddings_fingerprint(conn: &Connection) -> Result<String> {
    let (count, bytes, max_dim): (i64, i64, i64) = conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(LENGTH(vector)), 0), COALESCE(MAX(dimension), 0) FROM embeddings",
        [],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;
    Ok(format!("{}:{}:{}", count, bytes, max_dim))
}

/// SQL identifiers interpolated into statements must be plain words
fn validate_identifier(what: &str, name: &str) -> Result<()> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(RagcapError::Configuration(format!(
            "Invalid {} name '{}': only letters, digits and '_' are allowed",
            what, name
        )));
    }
    Ok(())
}

fn require_path(path: &Option<PathBuf>, env: &str, extension: &str) -> Result<PathBuf> {
    path.clone().ok_or_else(|| {
        RagcapError::Configuration(format!(
            "{} extension path is not configured; set {}",
            extension, env
        ))
    })
}

fn extension_error(err: RagcapError) -> RagcapError {
    match err {
        RagcapError::ExtensionLoad(_) => err,
        other => RagcapError::ExtensionLoad(other.to_string()),
    }
}

/// Load a loadable extension, retrying with `entry_point` when the default
/// entry point cannot be resolved
fn load_extension(conn: &Connection, path: &Path, entry_point: &str) -> Result<()> {
    if !path.exists() {
        return Err(RagcapError::ExtensionLoad(format!(
            "Extension library not found: {}",
            path.display()
        )));
    }

    // SAFETY: only the configured library is loaded, and extension loading
    // is disabled again when the guard drops.
    unsafe {
        let _guard = LoadExtensionGuard::new(conn)
            .map_err(|e| RagcapError::ExtensionLoad(format!("Cannot enable extension loading: {}", e)))?;

        if let Err(first) = conn.load_extension(path, None) {
            log::debug!(
                "Loading {} with the default entry point failed ({}), retrying with {}",
                path.display(),
                first,
                entry_point
            );
            conn.load_extension(path, Some(entry_point)).map_err(|e| {
                RagcapError::ExtensionLoad(format!("Failed to load {}: {}", path.display(), e))
            })?;
        }
    }

    log::debug!("Loaded SQLite extension {}", path.display());
    Ok(())
}

/// Dimension of the stored embeddings; the mirror tables need one
fn stored_dimension(capsule: &Capsule) -> Result<usize> {
    capsule
        .embedding_dimension()?
        .ok_or_else(|| RagcapError::ExtensionLoad("Capsule has no embeddings to index".to_string()))
}

fn check_query_dimension(capsule: &Capsule, query: &SearchQuery) -> Result<Vec<f32>> {
    let embedding = query
        .embedding
        .clone()
        .ok_or_else(|| RagcapError::Search("ANN search requires a query embedding".to_string()))?;

    if let Some(expected) = capsule.embedding_dimension()? {
        if expected != embedding.len() {
            return Err(RagcapError::DimensionMismatch {
                expected,
                actual: embedding.len(),
            });
        }
    }
    Ok(embedding)
}

fn distance_score(distance: f64) -> f32 {
    (1.0 / (1e-9 + distance)) as f32
}

/// sqlite-vec searcher
pub struct VecSearcher<'a> {
    capsule: &'a Capsule,
    path: PathBuf,
    options: VecOptions,
}

impl<'a> VecSearcher<'a> {
    /// Validate the options; the library itself is loaded on first use
    pub fn new(capsule: &'a Capsule, options: VecOptions) -> Result<Self> {
        let path = require_path(&options.path, "RAGCAP_SQLITE_VEC_PATH", "sqlite-vec")?;
        validate_identifier("vec module", &options.module)?;
        Ok(Self {
            capsule,
            path,
            options,
        })
    }

    /// Load the extension and bring the mirror table up to date
    pub fn ensure_index(&self) -> Result<IndexStatus> {
        self.prepare().map_err(extension_error)
    }

    fn prepare(&self) -> Result<IndexStatus> {
        let conn = self.capsule.connection();
        load_extension(conn, &self.path, "sqlite3_vec_init")?;
        let dimension = stored_dimension(self.capsule)?;

        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(&format!(
            "CREATE VIRTUAL TABLE IF NOT EXISTS {} USING {}(embedding FLOAT[{}]);",
            VEC_TABLE, self.options.module, dimension
        ))?;

        let fingerprint = embeddings_fingerprint(&tx)?;
        if !self.options.force_reindex
            && read_meta(&tx, meta_keys::ANN_VEC_FINGERPRINT)?.as_deref() == Some(fingerprint.as_str())
        {
            tx.commit()?;
            return Ok(IndexStatus::UpToDate);
        }

        tx.execute(&format!("DELETE FROM {}", VEC_TABLE), [])?;
        let mut rows = 0usize;
        {
            let mut select = tx.prepare("SELECT chunk_id, vector FROM embeddings")?;
            let mut insert = tx.prepare(&format!(
                "INSERT INTO {}(rowid, embedding) VALUES (?1, ?2)",
                VEC_TABLE
            ))?;
            let mut cursor = select.query([])?;
            while let Some(row) = cursor.next()? {
                let chunk_id: i64 = row.get(0)?;
                let blob: Vec<u8> = row.get(1)?;
                let json = serde_json::to_string(&decode_vector(&blob)?)?;
                insert.execute(params![chunk_id, json])?;
                rows += 1;
            }
        }
        write_meta(&tx, meta_keys::ANN_VEC_FINGERPRINT, &fingerprint)?;
        tx.commit()?;

        log::info!("Populated {} with {} vectors", VEC_TABLE, rows);
        Ok(IndexStatus::Rebuilt)
    }

    fn query(&self, embedding: &[f32], top_k: usize) -> Result<Vec<(i64, f32)>> {
        self.prepare()?;

        let conn = self.capsule.connection();
        let tx = conn.unchecked_transaction()?;
        let json = serde_json::to_string(embedding)?;
        let scored = {
            let mut stmt = tx.prepare(&format!(
                "SELECT rowid, distance FROM {} WHERE embedding MATCH ?1 AND k = ?2 ORDER BY distance",
                VEC_TABLE
            ))?;
            let rows = stmt.query_map(params![json, top_k as i64], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?))
            })?;
            rows.map(|r| r.map(|(id, d)| (id, distance_score(d))))
                .collect::<rusqlite::Result<Vec<_>>>()?
        };
        tx.commit()?;
        Ok(scored)
    }
}

impl Searcher for VecSearcher<'_> {
    fn search(&self, query: &SearchQuery, top_k: usize) -> Result<Vec<SearchResult>> {
        let embedding = check_query_dimension(self.capsule, query)?;
        let scored = self.query(&embedding, top_k).map_err(extension_error)?;
        hydrate(self.capsule.connection(), &scored)
    }

    fn name(&self) -> &'static str {
        "vec"
    }
}

/// sqlite-vss searcher
pub struct VssSearcher<'a> {
    capsule: &'a Capsule,
    path: PathBuf,
    options: VssOptions,
}

impl<'a> VssSearcher<'a> {
    pub fn new(capsule: &'a Capsule, options: VssOptions) -> Result<Self> {
        let path = require_path(&options.path, "RAGCAP_SQLITE_VSS_PATH", "sqlite-vss")?;
        validate_identifier("vss module", &options.module)?;
        validate_identifier("vss search function", &options.search_function)?;
        if let Some(function) = &options.from_blob_function {
            validate_identifier("vss from-blob function", function)?;
        }
        Ok(Self {
            capsule,
            path,
            options,
        })
    }

    pub fn ensure_index(&self) -> Result<IndexStatus> {
        self.prepare().map_err(extension_error)
    }

    fn prepare(&self) -> Result<IndexStatus> {
        let conn = self.capsule.connection();
        load_extension(conn, &self.path, "sqlite3_vss_init")?;
        let dimension = stored_dimension(self.capsule)?;

        let tx = conn.unchecked_transaction()?;
        let module = &self.options.module;
        let typed = format!(
            "CREATE VIRTUAL TABLE IF NOT EXISTS {} USING {}(embedding FLOAT[{}]);",
            VSS_TABLE, module, dimension
        );
        if let Err(e) = tx.execute_batch(&typed) {
            log::debug!("{} rejected typed column syntax ({}), using embedding({})", module, e, dimension);
            tx.execute_batch(&format!(
                "CREATE VIRTUAL TABLE IF NOT EXISTS {} USING {}(embedding({}));",
                VSS_TABLE, module, dimension
            ))?;
        }

        let fingerprint = embeddings_fingerprint(&tx)?;
        if !self.options.force_reindex
            && read_meta(&tx, meta_keys::ANN_VSS_FINGERPRINT)?.as_deref() == Some(fingerprint.as_str())
        {
            tx.commit()?;
            return Ok(IndexStatus::UpToDate);
        }

        tx.execute(&format!("DELETE FROM {}", VSS_TABLE), [])?;
        let source = match &self.options.from_blob_function {
            Some(function) => format!("{}(vector)", function),
            None => "vector".to_string(),
        };
        let rows = tx.execute(
            &format!(
                "INSERT INTO {}(rowid, embedding) SELECT chunk_id, {} FROM embeddings",
                VSS_TABLE, source
            ),
            [],
        )?;
        write_meta(&tx, meta_keys::ANN_VSS_FINGERPRINT, &fingerprint)?;
        tx.commit()?;

        log::info!("Populated {} with {} vectors", VSS_TABLE, rows);
        Ok(IndexStatus::Rebuilt)
    }

    fn query(&self, embedding: &[f32], top_k: usize) -> Result<Vec<(i64, f32)>> {
        self.prepare()?;

        let conn = self.capsule.connection();
        let tx = conn.unchecked_transaction()?;
        let blob = encode_vector(embedding);
        let scored = {
            let mut stmt = tx.prepare(&format!(
                "SELECT v.rowid, v.distance FROM {}({}, embedding, ?1, ?2) AS v ORDER BY v.distance LIMIT ?2",
                self.options.search_function, VSS_TABLE
            ))?;
            let rows = stmt.query_map(params![blob, top_k as i64], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?))
            })?;
            rows.map(|r| r.map(|(id, d)| (id, distance_score(d))))
                .collect::<rusqlite::Result<Vec<_>>>()?
        };
        tx.commit()?;
        Ok(scored)
    }
}

impl Searcher for VssSearcher<'_> {
    fn search(&self, query: &SearchQuery, top_k: usize) -> Result<Vec<SearchResult>> {
        let embedding = check_query_dimension(self.capsule, query)?;
        let scored = self.query(&embedding, top_k).map_err(extension_error)?;
        hydrate(self.capsule.connection(), &scored)
    }

    fn name(&self) -> &'static str {
        "vss"
    }
}

/// Which native extension backs an index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnKind {
    Vec,
    Vss,
}

/// Explicit mirror-table builds, outside of a search
pub struct AnnIndex;

impl AnnIndex {
    /// Load the extension for `kind` and populate its mirror table when the
    /// embeddings changed (or always, with `force_reindex`).
    ///
    /// Searchers refresh the same mirror lazily through a shared borrow;
    /// the mirror is derived from `embeddings` and never holds source data.
    pub fn build(capsule: &mut Capsule, kind: AnnKind, config: &AnnConfig) -> Result<IndexStatus> {
        let capsule: &Capsule = capsule;
        match kind {
            AnnKind::Vec => VecSearcher::new(capsule, config.vec.clone())?.ensure_index(),
            AnnKind::Vss => VssSearcher::new(capsule, config.vss.clone())?.ensure_index(),
        }
    }
}

/// Runs `primary` and answers from `fallback` when the primary fails with
/// an extension error. Every other error is returned unchanged.
pub struct FallbackSearcher<'a> {
    primary: Box<dyn Searcher + 'a>,
    fallback: Box<dyn Searcher + 'a>,
}

impl<'a> FallbackSearcher<'a> {
    pub fn new(primary: Box<dyn Searcher + 'a>, fallback: Box<dyn Searcher + 'a>) -> Self {
        Self { primary, fallback }
    }
}

impl Searcher for FallbackSearcher<'_> {
    fn search(&self, query: &SearchQuery, top_k: usize) -> Result<Vec<SearchResult>> {
        match self.primary.search(query, top_k) {
            Err(e) if e.is_extension_failure() => {
                log::warn!(
                    "{} search unavailable ({}), falling back to {}",
                    self.primary.name(),
                    e,
                    self.fallback.name()
                );
                self.fallback.search(query, top_k)
            }
            other => other,
        }
    }

    fn name(&self) -> &'static str {
        self.primary.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::HybridSearcher;
    use crate::storage::{ChunkDraft, SourceDocument};

    fn capsule_with_embeddings() -> Capsule {
        let mut capsule = Capsule::open_in_memory().unwrap();
        let source = capsule.add_source(&SourceDocument::new("docs/a.txt", "")).unwrap();
        for (text, vector) in [("alpha text", [1.0f32, 0.0]), ("beta text", [0.0, 1.0])] {
            let id = capsule
                .add_chunk(&ChunkDraft { source_id: source, text: text.into(), token_count: 2 })
                .unwrap();
            capsule.add_embedding(id, &vector).unwrap();
        }
        capsule
    }

    fn missing_vec(capsule: &Capsule) -> VecSearcher<'_> {
        let options = VecOptions {
            path: Some(PathBuf::from("/nonexistent/vec0.so")),
            ..VecOptions::default()
        };
        VecSearcher::new(capsule, options).unwrap()
    }

    #[test]
    fn test_fingerprint_tracks_embeddings() {
        let mut capsule = capsule_with_embeddings();
        assert_eq!(embeddings_fingerprint(capsule.connection()).unwrap(), "2:16:2");

        // Embeddings are write-once, so only new rows change the fingerprint
        let chunk = capsule.list_chunks().unwrap()[0].id;
        assert!(capsule.add_embedding(chunk, &[0.5, 0.5]).is_err());
        assert_eq!(embeddings_fingerprint(capsule.connection()).unwrap(), "2:16:2");

        let source = capsule.list_sources().unwrap()[0].id;
        let extra = capsule
            .add_chunk(&ChunkDraft { source_id: source, text: "gamma".into(), token_count: 1 })
            .unwrap();
        capsule.add_embedding(extra, &[0.3, 0.7]).unwrap();
        assert_eq!(embeddings_fingerprint(capsule.connection()).unwrap(), "3:24:2");

        let empty = Capsule::open_in_memory().unwrap();
        assert_eq!(embeddings_fingerprint(empty.connection()).unwrap(), "0:0:0");
    }

    #[test]
    fn test_missing_path_is_configuration_error() {
        let capsule = capsule_with_embeddings();
        let result = VecSearcher::new(&capsule, VecOptions::default());
        assert!(matches!(result, Err(RagcapError::Configuration(_))));
        let result = VssSearcher::new(&capsule, VssOptions::default());
        assert!(matches!(result, Err(RagcapError::Configuration(_))));
    }

    #[test]
    fn test_identifiers_are_validated() {
        let capsule = capsule_with_embeddings();
        let options = VssOptions {
            path: Some(PathBuf::from("vss0.so")),
            search_function: "vss_search; DROP TABLE chunks".to_string(),
            ..VssOptions::default()
        };
        assert!(matches!(
            VssSearcher::new(&capsule, options),
            Err(RagcapError::Configuration(_))
        ));
        assert!(validate_identifier("module", "vec0").is_ok());
        assert!(validate_identifier("module", "").is_err());
    }

    #[test]
    fn test_unloadable_extension_is_extension_error() {
        let mut capsule = capsule_with_embeddings();
        let searcher = missing_vec(&capsule);

        let query = SearchQuery::text("alpha").with_embedding(vec![1.0, 0.0]);
        let err = searcher.search(&query, 1).unwrap_err();
        assert!(err.is_extension_failure());

        let err = AnnIndex::build(
            &mut capsule,
            AnnKind::Vec,
            &AnnConfig {
                vec: VecOptions {
                    path: Some(PathBuf::from("/nonexistent/vec0.so")),
                    ..VecOptions::default()
                },
                ..AnnConfig::default()
            },
        )
        .unwrap_err();
        assert!(err.is_extension_failure());
    }

    #[test]
    fn test_dimension_mismatch_is_not_recovered() {
        let capsule = capsule_with_embeddings();
        let searcher = missing_vec(&capsule);

        let query = SearchQuery::text("alpha").with_embedding(vec![1.0, 0.0, 0.0]);
        assert!(matches!(
            searcher.search(&query, 1),
            Err(RagcapError::DimensionMismatch { expected: 2, actual: 3 })
        ));
    }

    #[test]
    fn test_fallback_on_extension_failure() {
        let capsule = capsule_with_embeddings();
        let searcher = FallbackSearcher::new(
            Box::new(missing_vec(&capsule)),
            Box::new(HybridSearcher::new(&capsule)),
        );

        let query = SearchQuery::text("alpha").with_embedding(vec![1.0, 0.0]);
        let results = searcher.search(&query, 1).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].text, "alpha text");
        assert_eq!(searcher.name(), "vec");
    }

    struct Failing;

    impl Searcher for Failing {
        fn search(&self, _query: &SearchQuery, _top_k: usize) -> Result<Vec<SearchResult>> {
            Err(RagcapError::Search("boom".to_string()))
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    #[test]
    fn test_fallback_rethrows_other_errors() {
        let capsule = capsule_with_embeddings();
        let searcher = FallbackSearcher::new(Box::new(Failing), Box::new(HybridSearcher::new(&capsule)));
        let result = searcher.search(&SearchQuery::text("alpha"), 1);
        assert!(matches!(result, Err(RagcapError::Search(_))));
    }
}
