//! Capsule schema creation and forward migrations
//!
//! Every step is idempotent and runs in its own transaction together with the
//! manifest version bump, so a failed step leaves the capsule at the previous
//! version.

use crate::error::{RagcapError, Result};
use crate::storage::schema::*;
use crate::text::WordTokenizer;
use rusqlite::{Connection, OptionalExtension, params};

/// One forward migration step
pub struct Migration {
    /// Version the capsule is at after this step
    pub version: u32,
    pub description: &'static str,
    apply: fn(&Connection) -> Result<()>,
}

/// Ordered migration steps, oldest first
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 2,
        description: "Add chunks.token_count and backfill it",
        apply: add_chunk_token_count,
    },
    Migration {
        version: 3,
        description: "Add source metadata, export history and lookup indexes",
        apply: add_source_metadata_and_exports,
    },
];

/// Create the schema for an empty capsule, or bring an existing one up to
/// [`CURRENT_VERSION`]. Returns the resulting version.
pub fn initialize(conn: &mut Connection) -> Result<u32> {
    if !table_exists(conn, "manifest")? {
        create_schema(conn)?;
        return Ok(CURRENT_VERSION);
    }

    migrate_to(conn, CURRENT_VERSION)
}

/// Apply every pending step up to and including `target`. Returns the
/// version the capsule is at afterwards.
pub fn migrate_to(conn: &mut Connection, target: u32) -> Result<u32> {
    let version = read_version(conn)?;
    if version > CURRENT_VERSION {
        return Err(RagcapError::Schema(format!(
            "Capsule schema version {} is newer than supported version {}",
            version, CURRENT_VERSION
        )));
    }

    let mut reached = version;
    for migration in MIGRATIONS
        .iter()
        .filter(|m| m.version > version && m.version <= target)
    {
        log::info!(
            "Applying migration v{}: {}",
            migration.version,
            migration.description
        );
        apply_migration(conn, migration).map_err(|e| {
            RagcapError::Schema(format!(
                "Migration to v{} failed: {}",
                migration.version, e
            ))
        })?;
        reached = migration.version;
    }

    Ok(reached)
}

/// Read the schema version stored in the manifest
pub fn read_version(conn: &Connection) -> Result<u32> {
    let version: Option<i64> = conn
        .query_row("SELECT version FROM manifest WHERE id = 1", [], |row| row.get(0))
        .optional()
        .map_err(|e| RagcapError::Schema(format!("Failed to read manifest: {}", e)))?;

    match version {
        Some(v) if v >= 1 => Ok(v as u32),
        Some(v) => Err(RagcapError::Schema(format!("Invalid schema version {}", v))),
        None => Err(RagcapError::Schema("Manifest row is missing".to_string())),
    }
}

fn create_schema(conn: &mut Connection) -> Result<()> {
    log::info!("Creating capsule schema v{}", CURRENT_VERSION);

    let tx = conn
        .transaction()
        .map_err(|e| RagcapError::Schema(format!("Failed to start transaction: {}", e)))?;

    tx.execute_batch(CREATE_BASE_TABLES)
        .map_err(|e| RagcapError::Schema(format!("Failed to create base tables: {}", e)))?;
    tx.execute_batch(CREATE_CHUNKS_FTS)
        .map_err(|e| RagcapError::Schema(format!("Failed to create full-text index: {}", e)))?;

    for migration in MIGRATIONS {
        (migration.apply)(&tx).map_err(|e| {
            RagcapError::Schema(format!(
                "Failed to create v{} layout: {}",
                migration.version, e
            ))
        })?;
    }

    tx.execute(
        "INSERT OR IGNORE INTO manifest (id, version, created_at) VALUES (1, ?1, ?2)",
        params![CURRENT_VERSION, chrono::Utc::now().to_rfc3339()],
    )
    .map_err(|e| RagcapError::Schema(format!("Failed to write manifest: {}", e)))?;

    tx.commit()
        .map_err(|e| RagcapError::Schema(format!("Failed to commit schema: {}", e)))?;

    Ok(())
}

fn apply_migration(conn: &mut Connection, migration: &Migration) -> Result<()> {
    let tx = conn.transaction()?;
    (migration.apply)(&tx)?;
    tx.execute(
        "UPDATE manifest SET version = ?1 WHERE id = 1",
        params![migration.version],
    )?;
    tx.commit()?;
    Ok(())
}

fn add_chunk_token_count(conn: &Connection) -> Result<()> {
    if !column_exists(conn, "chunks", "token_count")? {
        conn.execute("ALTER TABLE chunks ADD COLUMN token_count INTEGER", [])?;
    }

    let pending: Vec<(i64, String)> = {
        let mut stmt = conn.prepare("SELECT id, text FROM chunks WHERE token_count IS NULL")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<rusqlite::Result<_>>()?
    };

    if pending.is_empty() {
        return Ok(());
    }

    let tokenizer = WordTokenizer::new()?;
    let mut update = conn.prepare("UPDATE chunks SET token_count = ?1 WHERE id = ?2")?;
    for (id, text) in &pending {
        update.execute(params![tokenizer.count(text) as i64, id])?;
    }

    log::info!("Backfilled token counts for {} chunks", pending.len());
    Ok(())
}

fn add_source_metadata_and_exports(conn: &Connection) -> Result<()> {
    if !column_exists(conn, "sources", "document_type")? {
        conn.execute(
            "ALTER TABLE sources ADD COLUMN document_type TEXT NOT NULL DEFAULT ''",
            [],
        )?;
    }
    if !column_exists(conn, "sources", "metadata")? {
        conn.execute(
            "ALTER TABLE sources ADD COLUMN metadata TEXT NOT NULL DEFAULT '{}'",
            [],
        )?;
    }

    conn.execute_batch(CREATE_EXPORTS_TABLE)?;
    conn.execute_batch(CREATE_INDEXES)?;
    Ok(())
}

/// Whether a table (or virtual table) exists
pub fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Whether `table` has a column named `column`
pub fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for name in names {
        if name?.eq_ignore_ascii_case(column) {
            return Ok(true);
        }
    }
    Ok(false)
}
