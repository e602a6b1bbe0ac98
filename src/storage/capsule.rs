//! SQLite-backed capsule store
//!
//! A capsule is a single SQLite file holding sources, chunks, embeddings,
//! metadata and export history, plus an FTS5 index mirroring chunk text.

use crate::error::{RagcapError, Result};
use crate::storage::migrations;
use crate::storage::models::*;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

/// An open capsule
pub struct Capsule {
    conn: Connection,
    path: Option<PathBuf>,
    version: u32,
}

impl Capsule {
    /// Open a capsule file, creating and initializing it when it does not exist
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .map_err(|e| RagcapError::Storage(format!("Failed to open capsule {}: {}", path.display(), e)))?;

        Self::initialize(conn, Some(path.to_path_buf()))
    }

    /// Open a capsule that must already exist
    pub fn open_existing<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(RagcapError::not_found("capsule", path.display().to_string()));
        }
        Self::open(path)
    }

    /// Create an in-memory capsule (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| RagcapError::Storage(format!("Failed to create in-memory capsule: {}", e)))?;

        Self::initialize(conn, None)
    }

    fn initialize(mut conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|e| RagcapError::Storage(format!("Failed to enable foreign keys: {}", e)))?;

        let version = migrations::initialize(&mut conn)?;
        log::debug!("Capsule opened at schema version {}", version);

        Ok(Self { conn, path, version })
    }

    /// Underlying connection, used by the search strategies
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// File path, `None` for in-memory capsules
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Schema version after migrations
    pub fn schema_version(&self) -> u32 {
        self.version
    }

    /// Store a source document and return its id
    pub fn add_source(&mut self, source: &SourceDocument) -> Result<i64> {
        let metadata = serde_json::to_string(&source.metadata)?;
        self.conn
            .execute(
                "INSERT INTO sources (path, hash, document_type, metadata) VALUES (?1, ?2, ?3, ?4)",
                params![source.path, source.hash, source.document_type, metadata],
            )
            .map_err(|e| RagcapError::Storage(format!("Failed to insert source {}: {}", source.path, e)))?;

        Ok(self.conn.last_insert_rowid())
    }

    /// Store a chunk and return its id. The source must exist.
    pub fn add_chunk(&mut self, chunk: &ChunkDraft) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO chunks (source_id, text, token_count) VALUES (?1, ?2, ?3)",
                params![chunk.source_id, chunk.text, chunk.token_count as i64],
            )
            .map_err(|e| {
                if constraint_violation(&e) {
                    RagcapError::not_found("source", chunk.source_id.to_string())
                } else {
                    RagcapError::Storage(format!("Failed to insert chunk: {}", e))
                }
            })?;

        Ok(self.conn.last_insert_rowid())
    }

    /// Store the embedding of a chunk. A chunk has at most one embedding; a
    /// second one is rejected with [`RagcapError::Storage`].
    ///
    /// All embeddings in a capsule share one dimension; a vector of a
    /// different length is rejected with [`RagcapError::DimensionMismatch`].
    pub fn add_embedding(&mut self, chunk_id: i64, vector: &[f32]) -> Result<i64> {
        if vector.is_empty() {
            return Err(RagcapError::Embedding("Refusing to store an empty vector".to_string()));
        }
        if let Some(expected) = self.embedding_dimension()? {
            if expected != vector.len() {
                return Err(RagcapError::DimensionMismatch {
                    expected,
                    actual: vector.len(),
                });
            }
        }

        let tx = self
            .conn
            .transaction()
            .map_err(|e| RagcapError::Storage(format!("Failed to start transaction: {}", e)))?;

        let existing: Option<i64> = tx
            .query_row("SELECT id FROM embeddings WHERE chunk_id = ?1", params![chunk_id], |row| row.get(0))
            .optional()?;
        if existing.is_some() {
            return Err(RagcapError::Storage(format!("Chunk {} already has an embedding", chunk_id)));
        }
        tx.execute(
            "INSERT INTO embeddings (chunk_id, vector, dimension) VALUES (?1, ?2, ?3)",
            params![chunk_id, encode_vector(vector), vector.len() as i64],
        )
        .map_err(|e| {
            if constraint_violation(&e) {
                RagcapError::not_found("chunk", chunk_id.to_string())
            } else {
                RagcapError::Storage(format!("Failed to insert embedding: {}", e))
            }
        })?;
        let id = tx.last_insert_rowid();

        tx.commit()
            .map_err(|e| RagcapError::Storage(format!("Failed to commit embedding: {}", e)))?;

        Ok(id)
    }

    /// Store a source with its chunks and their embeddings in one
    /// transaction, so a failed document leaves nothing behind. The
    /// `source_id` of each draft is ignored.
    ///
    /// Returns the source id and the chunk ids in input order.
    pub fn add_document(
        &mut self,
        source: &SourceDocument,
        chunks: &[(ChunkDraft, Vec<f32>)],
    ) -> Result<(i64, Vec<i64>)> {
        self.add_document_with_meta(source, chunks, &[])
    }

    /// Like [`Capsule::add_document`], also writing `meta` entries in the
    /// same transaction; nothing is written when the document is rejected.
    pub fn add_document_with_meta(
        &mut self,
        source: &SourceDocument,
        chunks: &[(ChunkDraft, Vec<f32>)],
        meta: &[(&str, String)],
    ) -> Result<(i64, Vec<i64>)> {
        let mut expected = self.embedding_dimension()?;
        for (_, vector) in chunks {
            if vector.is_empty() {
                return Err(RagcapError::Embedding("Refusing to store an empty vector".to_string()));
            }
            match expected {
                Some(dimension) if dimension != vector.len() => {
                    return Err(RagcapError::DimensionMismatch {
                        expected: dimension,
                        actual: vector.len(),
                    });
                }
                Some(_) => {}
                None => expected = Some(vector.len()),
            }
        }

        let metadata = serde_json::to_string(&source.metadata)?;
        let tx = self
            .conn
            .transaction()
            .map_err(|e| RagcapError::Storage(format!("Failed to start transaction: {}", e)))?;

        tx.execute(
            "INSERT INTO sources (path, hash, document_type, metadata) VALUES (?1, ?2, ?3, ?4)",
            params![source.path, source.hash, source.document_type, metadata],
        )
        .map_err(|e| RagcapError::Storage(format!("Failed to insert source {}: {}", source.path, e)))?;
        let source_id = tx.last_insert_rowid();

        let mut chunk_ids = Vec::with_capacity(chunks.len());
        {
            let mut insert_chunk = tx
                .prepare("INSERT INTO chunks (source_id, text, token_count) VALUES (?1, ?2, ?3)")?;
            let mut insert_embedding = tx
                .prepare("INSERT INTO embeddings (chunk_id, vector, dimension) VALUES (?1, ?2, ?3)")?;

            for (draft, vector) in chunks {
                let chunk_id =
                    insert_chunk.insert(params![source_id, draft.text, draft.token_count as i64])?;
                insert_embedding.execute(params![chunk_id, encode_vector(vector), vector.len() as i64])?;
                chunk_ids.push(chunk_id);
            }
        }

        for (key, value) in meta {
            write_meta(&tx, key, value)?;
        }

        tx.commit()
            .map_err(|e| RagcapError::Storage(format!("Failed to commit document {}: {}", source.path, e)))?;

        Ok((source_id, chunk_ids))
    }

    /// Get a source by id
    pub fn get_source(&self, id: i64) -> Result<SourceDocument> {
        self.conn
            .query_row(
                "SELECT id, path, hash, document_type, metadata FROM sources WHERE id = ?1",
                params![id],
                row_to_source,
            )
            .optional()?
            .ok_or_else(|| RagcapError::not_found("source", id.to_string()))
    }

    /// All sources, ordered by id
    pub fn list_sources(&self) -> Result<Vec<SourceDocument>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, path, hash, document_type, metadata FROM sources ORDER BY id")?;
        let rows = stmt.query_map([], row_to_source)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Get a chunk by id
    pub fn get_chunk(&self, id: i64) -> Result<Chunk> {
        self.conn
            .query_row(
                "SELECT id, source_id, text, token_count FROM chunks WHERE id = ?1",
                params![id],
                row_to_chunk,
            )
            .optional()?
            .ok_or_else(|| RagcapError::not_found("chunk", id.to_string()))
    }

    /// All chunks, ordered by id
    pub fn list_chunks(&self) -> Result<Vec<Chunk>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, source_id, text, token_count FROM chunks ORDER BY id")?;
        let rows = stmt.query_map([], row_to_chunk)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Chunks of one source, in insertion order
    pub fn chunks_for_source(&self, source_id: i64) -> Result<Vec<Chunk>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, source_id, text, token_count FROM chunks WHERE source_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![source_id], row_to_chunk)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Embedding of a chunk, if one is stored
    pub fn get_embedding(&self, chunk_id: i64) -> Result<Option<Embedding>> {
        let row: Option<(i64, Vec<u8>, i64)> = self
            .conn
            .query_row(
                "SELECT id, vector, dimension FROM embeddings WHERE chunk_id = ?1 ORDER BY id DESC LIMIT 1",
                params![chunk_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        match row {
            Some((id, blob, dimension)) => Ok(Some(Embedding {
                id,
                chunk_id,
                vector: decode_vector(&blob)?,
                dimension: dimension as usize,
            })),
            None => Ok(None),
        }
    }

    /// Vectors keyed by chunk id for the given chunks; chunks without an
    /// embedding are absent from the map
    pub fn embeddings_for_chunks(&self, chunk_ids: &[i64]) -> Result<HashMap<i64, Vec<f32>>> {
        let mut vectors = HashMap::with_capacity(chunk_ids.len());
        let mut stmt = self
            .conn
            .prepare("SELECT vector FROM embeddings WHERE chunk_id = ?1 ORDER BY id DESC LIMIT 1")?;

        for &chunk_id in chunk_ids {
            if vectors.contains_key(&chunk_id) {
                continue;
            }
            let blob: Option<Vec<u8>> = stmt
                .query_row(params![chunk_id], |row| row.get(0))
                .optional()?;
            if let Some(blob) = blob {
                vectors.insert(chunk_id, decode_vector(&blob)?);
            }
        }

        Ok(vectors)
    }

    /// Every stored embedding as `(chunk_id, vector)`
    pub fn all_embeddings(&self) -> Result<Vec<(i64, Vec<f32>)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT chunk_id, vector FROM embeddings ORDER BY chunk_id")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?)))?;

        let mut embeddings = Vec::new();
        for row in rows {
            let (chunk_id, blob) = row?;
            embeddings.push((chunk_id, decode_vector(&blob)?));
        }
        Ok(embeddings)
    }

    /// Dimension shared by all stored embeddings, `None` when there are none
    pub fn embedding_dimension(&self) -> Result<Option<usize>> {
        let dimension: Option<i64> = self
            .conn
            .query_row("SELECT dimension FROM embeddings LIMIT 1", [], |row| row.get(0))
            .optional()?;
        Ok(dimension.map(|d| d as usize))
    }

    /// Read a meta value
    pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
        read_meta(&self.conn, key)
    }

    /// Insert or replace a meta value
    pub fn set_meta(&mut self, key: &str, value: &str) -> Result<()> {
        write_meta(&self.conn, key, value)
    }

    /// All meta entries
    pub fn all_meta(&self) -> Result<BTreeMap<String, String>> {
        let mut stmt = self.conn.prepare("SELECT key, value FROM meta ORDER BY key")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<rusqlite::Result<BTreeMap<_, _>>>()?)
    }

    /// Manifest with export history
    pub fn manifest(&self) -> Result<Manifest> {
        let (version, created_at): (i64, String) = self
            .conn
            .query_row("SELECT version, created_at FROM manifest WHERE id = 1", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()?
            .ok_or_else(|| RagcapError::Schema("Manifest row is missing".to_string()))?;

        let mut stmt = self
            .conn
            .prepare("SELECT format, path, created_at FROM exports ORDER BY id")?;
        let exports = stmt
            .query_map([], |row| {
                Ok(ExportRecord {
                    format: row.get(0)?,
                    path: row.get(1)?,
                    created_at: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(Manifest {
            version: version as u32,
            created_at,
            exports,
        })
    }

    /// Append an entry to the export history
    pub fn record_export(&mut self, format: &str, path: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO exports (format, path, created_at) VALUES (?1, ?2, ?3)",
                params![format, path, chrono::Utc::now().to_rfc3339()],
            )
            .map_err(|e| RagcapError::Storage(format!("Failed to record export: {}", e)))?;
        Ok(())
    }

    /// Aggregate counts and averages
    pub fn stats(&self) -> Result<CapsuleStats> {
        let count = |sql: &str| -> Result<usize> {
            let n: i64 = self.conn.query_row(sql, [], |row| row.get(0))?;
            Ok(n as usize)
        };

        let (avg_chunk_chars, avg_token_count): (Option<f64>, Option<f64>) = self.conn.query_row(
            "SELECT AVG(LENGTH(text)), AVG(token_count) FROM chunks",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        Ok(CapsuleStats {
            sources: count("SELECT COUNT(*) FROM sources")?,
            chunks: count("SELECT COUNT(*) FROM chunks")?,
            embeddings: count("SELECT COUNT(*) FROM embeddings")?,
            dimension: self.embedding_dimension()?,
            avg_chunk_chars: avg_chunk_chars.unwrap_or(0.0),
            avg_token_count: avg_token_count.unwrap_or(0.0),
        })
    }
}

pub(crate) fn read_meta(conn: &Connection, key: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row("SELECT value FROM meta WHERE key = ?1", params![key], |row| row.get(0))
        .optional()?)
}

pub(crate) fn write_meta(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
        params![key, value],
    )
    .map_err(|e| RagcapError::Storage(format!("Failed to write meta {}: {}", key, e)))?;
    Ok(())
}

fn constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

fn row_to_source(row: &Row) -> rusqlite::Result<SourceDocument> {
    let metadata: String = row.get(4)?;
    Ok(SourceDocument {
        id: row.get(0)?,
        path: row.get(1)?,
        hash: row.get(2)?,
        content: String::new(),
        document_type: row.get(3)?,
        // Unparseable metadata is treated as empty rather than failing the row
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
    })
}

fn row_to_chunk(row: &Row) -> rusqlite::Result<Chunk> {
    Ok(Chunk {
        id: row.get(0)?,
        source_id: row.get(1)?,
        text: row.get(2)?,
        token_count: row.get::<_, Option<i64>>(3)?.unwrap_or(0) as usize,
    })
}
