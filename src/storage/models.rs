//! Records persisted in a capsule

use crate::error::{RagcapError, Result};
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A source document ingested into a capsule
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceDocument {
    /// Row id (0 until stored)
    pub id: i64,

    /// Source path, `/`-separated
    pub path: String,

    /// SHA-256 hex digest of the raw content
    pub hash: String,

    /// Raw content, only held in memory during ingestion
    #[serde(skip)]
    pub content: String,

    /// Lowercase extension without the dot, e.g. `md`
    pub document_type: String,

    /// Arbitrary string metadata
    pub metadata: BTreeMap<String, String>,
}

impl SourceDocument {
    /// Create an unsaved document, hashing `content`
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        let path = crate::utils::normalize_separators(&path.into());
        let content = content.into();
        let document_type = crate::utils::get_file_extension(&path).unwrap_or_default();

        Self {
            id: 0,
            hash: crate::utils::sha256_hex(content.as_bytes()),
            path,
            content,
            document_type,
            metadata: BTreeMap::new(),
        }
    }
}

/// A chunk produced by a chunker, not yet stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDraft {
    pub source_id: i64,
    pub text: String,
    pub token_count: usize,
}

/// A stored chunk
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chunk {
    pub id: i64,
    pub source_id: i64,
    pub text: String,
    pub token_count: usize,
}

/// A stored embedding vector
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub id: i64,
    pub chunk_id: i64,
    pub vector: Vec<f32>,
    pub dimension: usize,
}

/// An export recorded in the capsule history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportRecord {
    pub format: String,
    pub path: String,
    pub created_at: String,
}

/// Capsule manifest
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Manifest {
    /// Schema version of the capsule file
    pub version: u32,

    /// RFC 3339 creation timestamp
    pub created_at: String,

    /// Export history, oldest first
    pub exports: Vec<ExportRecord>,
}

/// Aggregate counts used by inspect and diff
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CapsuleStats {
    pub sources: usize,
    pub chunks: usize,
    pub embeddings: usize,
    pub dimension: Option<usize>,
    /// Average chunk length in characters
    pub avg_chunk_chars: f64,
    pub avg_token_count: f64,
}

/// Encode a vector as little-endian f32 bytes
pub fn encode_vector(vector: &[f32]) -> Vec<u8> {
    let mut bytes = vec![0u8; vector.len() * 4];
    LittleEndian::write_f32_into(vector, &mut bytes);
    bytes
}

/// Decode little-endian f32 bytes into a vector
pub fn decode_vector(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(RagcapError::Storage(format!(
            "Vector blob length {} is not a multiple of 4",
            bytes.len()
        )));
    }

    let mut vector = vec![0f32; bytes.len() / 4];
    LittleEndian::read_f32_into(bytes, &mut vector);
    Ok(vector)
}
