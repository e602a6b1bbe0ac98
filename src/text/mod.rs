//! Text processing and chunking functionality for ragcap
//!
//! This module provides tokenization, preprocessing and the chunking
//! strategies that turn documents into retrieval units.

pub mod chunking;
pub mod preprocess;
pub mod tokenizer;
pub mod wordpiece;

// Re-export main types and functions
pub use chunking::{Chunker, TokenChunker, create_chunker};
pub use preprocess::Preprocessor;
pub use tokenizer::{Token, WordTokenizer};
pub use wordpiece::{WordpieceChunker, WordpieceCounter};
