//! Error types for ragcap
//!
//! This module provides the error type shared by the capsule store, chunkers,
//! search strategies and pipelines.

use thiserror::Error;

/// Main error type for ragcap operations
#[derive(Error, Debug)]
pub enum RagcapError {
    /// Missing extension path, missing credentials, invalid patterns or recipes
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A capsule, source, chunk or file that does not exist
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    /// No loader is registered for the file extension
    #[error("Unsupported file type: {0}")]
    UnsupportedFileType(String),

    /// Schema creation or migration failure
    #[error("Schema error: {0}")]
    Schema(String),

    /// Native ANN extension unavailable or failing at runtime
    #[error("Extension error: {0}")]
    ExtensionLoad(String),

    /// Query or inserted vector does not match the capsule dimension
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Storage-level invariant violations
    #[error("Storage error: {0}")]
    Storage(String),

    /// Text processing errors
    #[error("Text processing error: {0}")]
    TextProcessing(String),

    /// Subword tokenizer errors
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    /// Embedding provider errors
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Search errors
    #[error("Search error: {0}")]
    Search(String),

    /// A provider call exceeded its deadline
    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The operation was cancelled by the caller
    #[error("Operation cancelled")]
    Cancelled,

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML recipe parsing errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// SQLite database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// HTTP errors from remote providers
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl RagcapError {
    /// Shorthand for [`RagcapError::NotFound`]
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        RagcapError::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Whether a searcher wrapping an ANN extension may recover from this
    /// error by delegating to its fallback strategy.
    pub fn is_extension_failure(&self) -> bool {
        matches!(self, RagcapError::ExtensionLoad(_))
    }
}

/// Result type alias for ragcap operations
pub type Result<T> = std::result::Result<T, RagcapError>;

impl From<globset::Error> for RagcapError {
    fn from(err: globset::Error) -> Self {
        RagcapError::Configuration(format!("invalid glob pattern: {}", err))
    }
}

impl From<tokenizers::Error> for RagcapError {
    fn from(err: tokenizers::Error) -> Self {
        RagcapError::Tokenizer(err.to_string())
    }
}
