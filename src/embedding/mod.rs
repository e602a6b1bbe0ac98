//! Embedding providers
//!
//! Providers turn text into dense vectors. Calls to a provider are the only
//! suspension points of the build and search pipelines, and every call runs
//! under a deadline.

pub mod api;

use crate::config::EmbeddingConfig;
use crate::error::{RagcapError, Result};
use crate::text::WordTokenizer;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::time::Duration;

pub use api::{ApiEmbeddingProvider, ApiFlavor};

/// Default dimension of the [`HashEmbedder`]
pub const HASH_EMBEDDING_DIMENSION: usize = 384;

/// Produces embedding vectors for text
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Provider name recorded in capsule meta
    fn name(&self) -> &str;

    /// Model identifier recorded in capsule meta
    fn model(&self) -> &str;

    /// Expected output dimension, when known up front
    fn dimension(&self) -> Option<usize> {
        None
    }
}

/// Run `provider.embed(text)` with a deadline. The pending request is dropped
/// when the deadline fires.
pub async fn embed_with_timeout(
    provider: &dyn EmbeddingProvider,
    text: &str,
    timeout: Duration,
) -> Result<Vec<f32>> {
    match tokio::time::timeout(timeout, provider.embed(text)).await {
        Ok(result) => result,
        Err(_) => Err(RagcapError::Timeout(timeout)),
    }
}

/// Deterministic feature-hashing embedder.
///
/// Each lowercased word token is hashed into a few dimensions with signed
/// weights and the result is L2-normalized. Texts sharing words get similar
/// vectors, which is enough for offline builds and tests.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimension: usize,
    tokenizer: WordTokenizer,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Result<Self> {
        if dimension == 0 {
            return Err(RagcapError::Configuration(
                "Hash embedding dimension must be positive".to_string(),
            ));
        }
        Ok(Self {
            dimension,
            tokenizer: WordTokenizer::new()?,
        })
    }

    /// Embed synchronously; the async trait method delegates here
    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];

        for token in self.tokenizer.tokenize(text) {
            let word = token.text.to_lowercase();
            let digest = Sha256::digest(word.as_bytes());

            // Three (index, sign) pairs per word, 8 digest bytes each
            for slot in digest.chunks_exact(8).take(3) {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(slot);
                let hash = u64::from_le_bytes(bytes);
                let index = (hash % self.dimension as u64) as usize;
                let sign = if (hash >> 63) == 1 { -1.0 } else { 1.0 };
                vector[index] += sign;
            }
        }

        normalize(&mut vector);
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }

    fn name(&self) -> &str {
        "hash"
    }

    fn model(&self) -> &str {
        "feature-hash"
    }

    fn dimension(&self) -> Option<usize> {
        Some(self.dimension)
    }
}

fn normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
}

/// Build the provider named by `config.provider`.
///
/// `hash` selects the offline [`HashEmbedder`]; `azure` an Azure OpenAI
/// deployment; anything else an OpenAI-compatible endpoint.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Box<dyn EmbeddingProvider>> {
    match config.provider.to_lowercase().as_str() {
        "hash" => {
            let dimension = if config.dimension == 0 {
                HASH_EMBEDDING_DIMENSION
            } else {
                config.dimension
            };
            log::info!("Using hash embedder with {} dimensions", dimension);
            Ok(Box::new(HashEmbedder::new(dimension)?))
        }
        "azure" => Ok(Box::new(ApiEmbeddingProvider::new(config, ApiFlavor::Azure)?)),
        _ => Ok(Box::new(ApiEmbeddingProvider::new(config, ApiFlavor::OpenAi)?)),
    }
}
