//! Capsule schema definitions

/// Schema version written by this build
pub const CURRENT_VERSION: u32 = 3;

/// Base tables of a version 1 capsule.
///
/// Later columns and tables are added by the migration steps, so a fresh
/// capsule and a migrated one end up with the same layout.
pub const CREATE_BASE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS manifest (
    id INTEGER PRIMARY KEY,
    version INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sources (
    id INTEGER PRIMARY KEY,
    path TEXT NOT NULL,
    hash TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS chunks (
    id INTEGER PRIMARY KEY,
    source_id INTEGER NOT NULL,
    text TEXT NOT NULL,
    FOREIGN KEY (source_id) REFERENCES sources(id)
);

CREATE TABLE IF NOT EXISTS embeddings (
    id INTEGER PRIMARY KEY,
    chunk_id INTEGER NOT NULL,
    vector BLOB NOT NULL,
    dimension INTEGER NOT NULL,
    FOREIGN KEY (chunk_id) REFERENCES chunks(id)
);

CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// FTS5 external-content index over `chunks.text`, kept in sync by triggers
pub const CREATE_CHUNKS_FTS: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(text, content='chunks', content_rowid='id');

CREATE TRIGGER IF NOT EXISTS chunks_after_insert AFTER INSERT ON chunks BEGIN
    INSERT INTO chunks_fts(rowid, text) VALUES (new.id, new.text);
END;

CREATE TRIGGER IF NOT EXISTS chunks_after_delete AFTER DELETE ON chunks BEGIN
    INSERT INTO chunks_fts(chunks_fts, rowid, text) VALUES ('delete', old.id, old.text);
END;

CREATE TRIGGER IF NOT EXISTS chunks_after_update AFTER UPDATE ON chunks BEGIN
    INSERT INTO chunks_fts(chunks_fts, rowid, text) VALUES ('delete', old.id, old.text);
    INSERT INTO chunks_fts(rowid, text) VALUES (new.id, new.text);
END;
"#;

/// Export history table (version 3)
pub const CREATE_EXPORTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS exports (
    id INTEGER PRIMARY KEY,
    format TEXT NOT NULL,
    path TEXT NOT NULL,
    created_at TEXT NOT NULL
);
"#;

/// Lookup indexes (version 3)
pub const CREATE_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_chunks_source_id ON chunks(source_id);
CREATE INDEX IF NOT EXISTS idx_embeddings_chunk_id ON embeddings(chunk_id);
CREATE INDEX IF NOT EXISTS idx_sources_path ON sources(path);
"#;

/// Meta keys understood by the capsule
pub mod meta_keys {
    pub const EMBEDDING_PROVIDER: &str = "embedding_provider";
    pub const EMBEDDING_MODEL: &str = "embedding_model";
    pub const EMBEDDING_DIMENSION: &str = "embedding_dimension";
    pub const EMBEDDING_API_VERSION: &str = "embedding_api_version";
    pub const EMBEDDING_ENDPOINT: &str = "embedding_endpoint";
    pub const RECIPE: &str = "recipe";
    pub const ANN_VEC_FINGERPRINT: &str = "ann.vec.fingerprint";
    pub const ANN_VSS_FINGERPRINT: &str = "ann.vss.fingerprint";
}
