//! Configuration for ragcap
//!
//! Library components take their settings from these structs. The build
//! recipe is read from TOML, snapshotted into capsule meta as JSON, and the
//! native ANN extension settings come from the environment.

use crate::error::{RagcapError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub chunking: ChunkingConfig,

    #[serde(default)]
    pub preprocess: PreprocessConfig,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub search: SearchConfig,

    #[serde(default)]
    pub ann: AnnConfig,
}

/// Chunking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Maximum tokens (or WordPiece pieces, including `[CLS]`/`[SEP]`) per chunk
    #[serde(default = "default_chunk_size")]
    pub size: usize,

    /// Tokens shared between consecutive windows
    #[serde(default = "default_chunk_overlap")]
    pub overlap: usize,

    /// Measure budgets in WordPiece pieces
    #[serde(default = "default_true")]
    pub bert_aware: bool,

    /// Split on blank lines before windowing
    #[serde(default = "default_true")]
    pub preserve_paragraphs: bool,

    /// `vocab.txt` or `tokenizer.json` for the WordPiece chunker
    #[serde(default = "default_vocab_path")]
    pub vocab_path: PathBuf,
}

/// Preprocessing switches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreprocessConfig {
    /// Drop HTML header/footer/nav blocks
    #[serde(default = "default_true", alias = "boilerplate")]
    pub remove_boilerplate: bool,

    /// Keep fenced code verbatim
    #[serde(default = "default_true")]
    pub preserve_code: bool,

    /// Linearize HTML and markdown tables
    #[serde(default = "default_true")]
    pub flatten_tables: bool,
}

/// Remote embedding provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Provider name recorded in capsule meta
    #[serde(default = "default_provider")]
    pub provider: String,

    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Expected dimension; 0 accepts whatever the provider returns
    #[serde(default)]
    pub dimension: usize,

    #[serde(default)]
    pub api_version: Option<String>,

    /// Base URL of an OpenAI-compatible embeddings API
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// Query-time configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// BM25 candidates reranked by the hybrid searcher
    #[serde(default = "default_candidate_limit")]
    pub candidate_limit: usize,

    /// RRF rank constant
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f32,

    /// MMR trade-off between relevance (1.0) and diversity (0.0)
    #[serde(default = "default_mmr_lambda")]
    pub mmr_lambda: f32,

    /// Results considered by MMR; `None` means `max(top_k, search_pool)`
    #[serde(default)]
    pub mmr_pool: Option<usize>,

    /// Results fetched before path filtering; `None` means `max(4 * top_k, 50)`
    #[serde(default)]
    pub search_pool: Option<usize>,
}

/// Native ANN extension configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnnConfig {
    #[serde(default)]
    pub vec: VecOptions,

    #[serde(default)]
    pub vss: VssOptions,
}

/// sqlite-vec settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VecOptions {
    /// Path to the loadable extension
    pub path: Option<PathBuf>,

    /// Virtual table module name
    #[serde(default = "default_vec_module")]
    pub module: String,

    /// Repopulate the mirror table even when the fingerprint matches
    #[serde(default)]
    pub force_reindex: bool,
}

/// sqlite-vss settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VssOptions {
    pub path: Option<PathBuf>,

    #[serde(default = "default_vss_module")]
    pub module: String,

    /// Table-valued search function
    #[serde(default = "default_vss_search")]
    pub search_function: String,

    /// Optional SQL function converting stored blobs to the module's format
    pub from_blob_function: Option<String>,

    #[serde(default)]
    pub force_reindex: bool,
}

fn default_true() -> bool {
    true
}
fn default_chunk_size() -> usize {
    200
}
fn default_chunk_overlap() -> usize {
    50
}
fn default_vocab_path() -> PathBuf {
    PathBuf::from("models/all-MiniLM-L6-v2/vocab.txt")
}
fn default_provider() -> String {
    "api".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_endpoint() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_api_key_env() -> String {
    "RAGCAP_API_KEY".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_top_k() -> usize {
    5
}
fn default_candidate_limit() -> usize {
    500
}
fn default_rrf_k() -> f32 {
    60.0
}
fn default_mmr_lambda() -> f32 {
    0.5
}
fn default_vec_module() -> String {
    "vec0".to_string()
}
fn default_vss_module() -> String {
    "vss0".to_string()
}
fn default_vss_search() -> String {
    "vss_search".to_string()
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            size: default_chunk_size(),
            overlap: default_chunk_overlap(),
            bert_aware: true,
            preserve_paragraphs: true,
            vocab_path: default_vocab_path(),
        }
    }
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            remove_boilerplate: true,
            preserve_code: true,
            flatten_tables: true,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_embedding_model(),
            dimension: 0,
            api_version: None,
            endpoint: default_endpoint(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            candidate_limit: default_candidate_limit(),
            rrf_k: default_rrf_k(),
            mmr_lambda: default_mmr_lambda(),
            mmr_pool: None,
            search_pool: None,
        }
    }
}

impl SearchConfig {
    /// Number of results fetched before path filtering
    pub fn effective_search_pool(&self, top_k: usize) -> usize {
        self.search_pool
            .unwrap_or_else(|| (top_k * 4).max(50))
            .max(top_k)
    }
}

impl Default for VecOptions {
    fn default() -> Self {
        Self {
            path: None,
            module: default_vec_module(),
            force_reindex: false,
        }
    }
}

impl Default for VssOptions {
    fn default() -> Self {
        Self {
            path: None,
            module: default_vss_module(),
            search_function: default_vss_search(),
            from_blob_function: None,
            force_reindex: false,
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl VecOptions {
    /// Read `RAGCAP_SQLITE_VEC_PATH` and `RAGCAP_SQLITE_VEC_MODULE`
    pub fn from_env() -> Self {
        Self {
            path: env_var("RAGCAP_SQLITE_VEC_PATH").map(PathBuf::from),
            module: env_var("RAGCAP_SQLITE_VEC_MODULE").unwrap_or_else(default_vec_module),
            force_reindex: false,
        }
    }
}

impl VssOptions {
    /// Read the `RAGCAP_SQLITE_VSS_*` variables
    pub fn from_env() -> Self {
        Self {
            path: env_var("RAGCAP_SQLITE_VSS_PATH").map(PathBuf::from),
            module: env_var("RAGCAP_SQLITE_VSS_MODULE").unwrap_or_else(default_vss_module),
            search_function: env_var("RAGCAP_SQLITE_VSS_SEARCH").unwrap_or_else(default_vss_search),
            from_blob_function: env_var("RAGCAP_SQLITE_VSS_FROMBLOB"),
            force_reindex: env_var("RAGCAP_SQLITE_VSS_REINDEX").as_deref() == Some("1"),
        }
    }
}

impl AnnConfig {
    pub fn from_env() -> Self {
        Self {
            vec: VecOptions::from_env(),
            vss: VssOptions::from_env(),
        }
    }
}

/// A declarative build recipe
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    #[serde(default)]
    pub sources: Vec<RecipeSource>,

    #[serde(default)]
    pub chunking: RecipeChunking,

    #[serde(default)]
    pub embeddings: RecipeEmbeddings,

    #[serde(default)]
    pub preprocess: RecipePreprocess,

    #[serde(default)]
    pub output: RecipeOutput,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecipeSource {
    pub path: String,
    #[serde(default, rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecipeChunking {
    pub size: Option<usize>,
    pub overlap: Option<usize>,
    pub bert_aware: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecipeEmbeddings {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub dimension: Option<usize>,
    pub api_version: Option<String>,
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecipePreprocess {
    pub boilerplate: Option<bool>,
    pub preserve_code: Option<bool>,
    pub flatten_tables: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecipeOutput {
    #[serde(default)]
    pub path: String,
}

impl Recipe {
    /// Load a recipe from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(RagcapError::not_found("recipe", path.display().to_string()));
        }

        let content = std::fs::read_to_string(path)?;
        let recipe = Self::from_toml(&content)?;
        log::debug!("Loaded recipe from {}", path.display());
        Ok(recipe)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let recipe: Recipe = toml::from_str(content)?;
        recipe.validate()?;
        Ok(recipe)
    }

    pub fn validate(&self) -> Result<()> {
        if let (Some(size), Some(overlap)) = (self.chunking.size, self.chunking.overlap) {
            if size == 0 {
                return Err(RagcapError::Configuration("recipe chunking.size must be positive".to_string()));
            }
            if overlap >= size {
                return Err(RagcapError::Configuration(format!(
                    "recipe chunking.overlap ({}) must be smaller than chunking.size ({})",
                    overlap, size
                )));
            }
        }
        if self.sources.iter().any(|s| s.path.trim().is_empty()) {
            return Err(RagcapError::Configuration("recipe source with empty path".to_string()));
        }
        Ok(())
    }

    /// Overlay the recipe on top of `config`
    pub fn apply_to(&self, config: &mut Config) {
        if let Some(size) = self.chunking.size {
            config.chunking.size = size;
        }
        if let Some(overlap) = self.chunking.overlap {
            config.chunking.overlap = overlap;
        }
        if let Some(bert_aware) = self.chunking.bert_aware {
            config.chunking.bert_aware = bert_aware;
        }

        if let Some(provider) = &self.embeddings.provider {
            config.embedding.provider = provider.clone();
        }
        if let Some(model) = &self.embeddings.model {
            config.embedding.model = model.clone();
        }
        if let Some(dimension) = self.embeddings.dimension {
            config.embedding.dimension = dimension;
        }
        if self.embeddings.api_version.is_some() {
            config.embedding.api_version = self.embeddings.api_version.clone();
        }
        if let Some(endpoint) = &self.embeddings.endpoint {
            config.embedding.endpoint = endpoint.clone();
        }

        if let Some(boilerplate) = self.preprocess.boilerplate {
            config.preprocess.remove_boilerplate = boilerplate;
        }
        if let Some(preserve_code) = self.preprocess.preserve_code {
            config.preprocess.preserve_code = preserve_code;
        }
        if let Some(flatten_tables) = self.preprocess.flatten_tables {
            config.preprocess.flatten_tables = flatten_tables;
        }
    }

    /// JSON snapshot stored under the `recipe` meta key
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.chunking.size, 200);
        assert_eq!(config.chunking.overlap, 50);
        assert!(config.chunking.bert_aware);
        assert_eq!(config.search.candidate_limit, 500);
        assert_eq!(config.ann.vec.module, "vec0");
        assert_eq!(config.ann.vss.search_function, "vss_search");
    }

    #[test]
    fn test_search_pool_default() {
        let search = SearchConfig::default();
        assert_eq!(search.effective_search_pool(5), 50);
        assert_eq!(search.effective_search_pool(20), 80);

        let search = SearchConfig {
            search_pool: Some(3),
            ..SearchConfig::default()
        };
        assert_eq!(search.effective_search_pool(10), 10);
    }

    #[test]
    fn test_recipe_from_toml() {
        let recipe = Recipe::from_toml(
            r#"
            [[sources]]
            path = "docs"
            type = "folder"

            [chunking]
            size = 128
            overlap = 16
            bert_aware = false

            [embeddings]
            provider = "api"
            model = "nomic-embed-text"
            dimension = 768

            [preprocess]
            boilerplate = false

            [output]
            path = "docs.ragcap"
            "#,
        )
        .unwrap();

        assert_eq!(recipe.sources[0].kind, "folder");

        let mut config = Config::default();
        recipe.apply_to(&mut config);
        assert_eq!(config.chunking.size, 128);
        assert_eq!(config.chunking.overlap, 16);
        assert!(!config.chunking.bert_aware);
        assert_eq!(config.embedding.model, "nomic-embed-text");
        assert_eq!(config.embedding.dimension, 768);
        assert!(!config.preprocess.remove_boilerplate);
        assert!(config.preprocess.preserve_code);

        let snapshot: Recipe = serde_json::from_str(&recipe.to_json().unwrap()).unwrap();
        assert_eq!(snapshot, recipe);
    }

    #[test]
    fn test_recipe_validation() {
        let result = Recipe::from_toml("[chunking]\nsize = 10\noverlap = 10\n");
        assert!(matches!(result, Err(RagcapError::Configuration(_))));

        let result = Recipe::from_toml("[chunking]\nsize = \"big\"\n");
        assert!(matches!(result, Err(RagcapError::Toml(_))));
    }

    #[test]
    fn test_config_from_partial_toml() {
        let config: Config = toml::from_str("[search]\ntop_k = 9\n").unwrap();
        assert_eq!(config.search.top_k, 9);
        assert_eq!(config.search.candidate_limit, 500);
        assert_eq!(config.chunking.size, 200);
    }
}
