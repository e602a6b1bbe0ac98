//! OpenAI-compatible HTTP embedding provider

use crate::config::EmbeddingConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::{RagcapError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

const DEFAULT_AZURE_API_VERSION: &str = "2023-05-15";

/// Request and authentication shape of the remote API
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiFlavor {
    /// `POST {endpoint}/embeddings` with a bearer token
    OpenAi,
    /// `POST {endpoint}/openai/deployments/{model}/embeddings?api-version=...`
    /// with an `api-key` header; the model names the deployment
    Azure,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    input: &'a str,
    model: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// Embedding provider calling a remote HTTP API
pub struct ApiEmbeddingProvider {
    client: Client,
    flavor: ApiFlavor,
    provider: String,
    url: String,
    api_key: String,
    model: String,
    dimension: Option<usize>,
}

impl ApiEmbeddingProvider {
    /// Create a provider. The API key is read from the environment variable
    /// named by `config.api_key_env`; a missing key is a configuration error.
    pub fn new(config: &EmbeddingConfig, flavor: ApiFlavor) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| {
                RagcapError::Configuration(format!(
                    "Embedding API key is not set; export {}",
                    config.api_key_env
                ))
            })?;

        Self::with_api_key(config, flavor, api_key)
    }

    /// Create a provider with an explicit API key
    pub fn with_api_key(
        config: &EmbeddingConfig,
        flavor: ApiFlavor,
        api_key: impl Into<String>,
    ) -> Result<Self> {
        if config.endpoint.trim().is_empty() {
            return Err(RagcapError::Configuration(
                "Embedding endpoint is empty".to_string(),
            ));
        }
        if config.model.trim().is_empty() {
            return Err(RagcapError::Configuration(
                "Embedding model is empty".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| RagcapError::Configuration(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            flavor,
            provider: config.provider.clone(),
            url: request_url(config, flavor),
            api_key: api_key.into(),
            model: config.model.clone(),
            dimension: (config.dimension > 0).then_some(config.dimension),
        })
    }

    /// Fully-resolved request URL
    pub fn url(&self) -> &str {
        &self.url
    }
}

fn request_url(config: &EmbeddingConfig, flavor: ApiFlavor) -> String {
    let endpoint = config.endpoint.trim_end_matches('/');
    match flavor {
        ApiFlavor::OpenAi => format!("{}/embeddings", endpoint),
        ApiFlavor::Azure => format!(
            "{}/openai/deployments/{}/embeddings?api-version={}",
            endpoint,
            config.model,
            config
                .api_version
                .as_deref()
                .unwrap_or(DEFAULT_AZURE_API_VERSION)
        ),
    }
}

#[async_trait]
impl EmbeddingProvider for ApiEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let body = EmbeddingRequest {
            input: text,
            model: &self.model,
        };

        let request = self.client.post(&self.url).json(&body);
        let request = match self.flavor {
            ApiFlavor::OpenAi => request.bearer_auth(&self.api_key),
            ApiFlavor::Azure => request.header("api-key", &self.api_key),
        };

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(RagcapError::Embedding(format!(
                "Embedding request failed with {}: {}",
                status,
                crate::utils::truncate_chars(&detail, 200)
            )));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| RagcapError::Embedding(format!("Malformed embedding response: {}", e)))?;

        let vector = parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| RagcapError::Embedding("Embedding response has no data".to_string()))?;

        if let Some(expected) = self.dimension {
            if vector.len() != expected {
                return Err(RagcapError::DimensionMismatch {
                    expected,
                    actual: vector.len(),
                });
            }
        }

        log::debug!("Embedded {} chars into {} dimensions", text.len(), vector.len());
        Ok(vector)
    }

    fn name(&self) -> &str {
        &self.provider
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> Option<usize> {
        self.dimension
    }
}
