//! Query pipeline: strategy selection, path filtering and MMR

use crate::config::{Config, SearchConfig};
use crate::embedding::{EmbeddingProvider, create_provider, embed_with_timeout};
use crate::error::{RagcapError, Result};
use crate::pipeline::inspect::validate;
use crate::search::{
    Bm25Searcher, FallbackSearcher, HybridSearcher, MmrOptions, PathFilter, ScoreMode, SearchQuery,
    SearchResult, Searcher, VecSearcher, VectorSearcher, VssSearcher, mmr_rerank,
};
use crate::storage::{Capsule, meta_keys};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

/// Retrieval strategy selected for a query
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SearchStrategy {
    Bm25,
    Vector,
    #[default]
    Hybrid,
    /// sqlite-vec, falling back to hybrid
    Vec,
    /// sqlite-vss, falling back to hybrid
    Vss,
}

impl SearchStrategy {
    /// Whether the strategy ranks by query embedding
    pub fn needs_embedding(&self) -> bool {
        !matches!(self, SearchStrategy::Bm25)
    }
}

impl FromStr for SearchStrategy {
    type Err = RagcapError;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_lowercase().as_str() {
            "bm25" | "lexical" => Ok(Self::Bm25),
            "vector" | "semantic" => Ok(Self::Vector),
            "hybrid" => Ok(Self::Hybrid),
            "vec" | "sqlite-vec" => Ok(Self::Vec),
            "vss" | "sqlite-vss" => Ok(Self::Vss),
            other => Err(RagcapError::Configuration(format!(
                "Unknown search strategy '{}'; expected bm25, vector, hybrid, vec or vss",
                other
            ))),
        }
    }
}

/// Per-query options
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub strategy: SearchStrategy,
    pub top_k: usize,
    /// `;`/`,`-separated include globs
    pub include: Option<String>,
    /// `;`/`,`-separated exclude globs
    pub exclude: Option<String>,
    pub mmr: bool,
    pub mmr_lambda: f32,
    /// Results considered by MMR; `None` means `max(top_k, search_pool)`
    pub mmr_pool: Option<usize>,
    /// Results fetched before path filtering
    pub search_pool: usize,
    pub score_mode: ScoreMode,
}

impl SearchOptions {
    pub fn from_config(config: &SearchConfig) -> Self {
        Self {
            strategy: SearchStrategy::default(),
            top_k: config.top_k,
            include: None,
            exclude: None,
            mmr: false,
            mmr_lambda: config.mmr_lambda,
            mmr_pool: config.mmr_pool,
            search_pool: config.effective_search_pool(config.top_k),
            score_mode: ScoreMode::default(),
        }
    }

    fn mmr_pool_size(&self) -> usize {
        self.mmr_pool
            .unwrap_or_else(|| self.top_k.max(self.search_pool))
            .max(1)
    }
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self::from_config(&SearchConfig::default())
    }
}

/// Runs queries against one capsule.
///
/// The capsule is validated before the first query; the shared borrow keeps
/// it unchanged for the lifetime of the pipeline.
pub struct SearchPipeline<'a> {
    capsule: &'a Capsule,
    config: Config,
    provider: Option<Box<dyn EmbeddingProvider>>,
    validated: AtomicBool,
}

impl<'a> SearchPipeline<'a> {
    /// Query embeddings come from the provider recorded in the capsule meta
    /// unless one is set with [`SearchPipeline::with_provider`]
    pub fn new(capsule: &'a Capsule, config: Config) -> Self {
        Self {
            capsule,
            config,
            provider: None,
            validated: AtomicBool::new(false),
        }
    }

    pub fn with_provider(mut self, provider: Box<dyn EmbeddingProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Rebuild the provider that embedded the capsule from its meta, on top
    /// of the configured embedding settings
    pub fn provider_from_meta(&self) -> Result<Box<dyn EmbeddingProvider>> {
        let mut embedding = self.config.embedding.clone();
        if let Some(provider) = self.capsule.get_meta(meta_keys::EMBEDDING_PROVIDER)? {
            embedding.provider = provider;
        }
        if let Some(model) = self.capsule.get_meta(meta_keys::EMBEDDING_MODEL)? {
            embedding.model = model;
        }
        if let Some(endpoint) = self.capsule.get_meta(meta_keys::EMBEDDING_ENDPOINT)? {
            if !endpoint.is_empty() {
                embedding.endpoint = endpoint;
            }
        }
        if let Some(version) = self.capsule.get_meta(meta_keys::EMBEDDING_API_VERSION)? {
            embedding.api_version = Some(version);
        }
        if let Some(dimension) = self.capsule.embedding_dimension()? {
            embedding.dimension = dimension;
        }

        log::debug!("Query provider from capsule meta: {} / {}", embedding.provider, embedding.model);
        create_provider(&embedding)
    }

    fn ensure_valid(&self) -> Result<()> {
        if self.validated.load(Ordering::Acquire) {
            return Ok(());
        }
        let report = validate(self.capsule)?;
        if !report.is_valid() {
            return Err(RagcapError::Storage(format!(
                "Capsule failed validation: {}",
                report.issues.join("; ")
            )));
        }
        self.validated.store(true, Ordering::Release);
        Ok(())
    }

    /// Run `query` and return up to `options.top_k` results, best first
    pub async fn run(&self, query: &str, options: &SearchOptions) -> Result<Vec<SearchResult>> {
        let filter = PathFilter::from_lists(options.include.as_deref(), options.exclude.as_deref())?;
        if options.top_k == 0 {
            return Ok(Vec::new());
        }

        self.ensure_valid()?;

        let mut search_query = SearchQuery::text(query);
        if options.strategy.needs_embedding() || options.mmr {
            search_query = search_query.with_embedding(self.embed_query(query).await?);
        }

        let mut fetch = options.top_k;
        if filter.is_active() {
            fetch = fetch.max(options.search_pool);
        }
        let mmr_pool = options.mmr_pool_size();
        if options.mmr {
            fetch = fetch.max(mmr_pool);
        }

        let searcher = self.searcher(options.strategy)?;
        log::debug!(
            "Searching with {} for {} results (top_k {})",
            searcher.name(),
            fetch,
            options.top_k
        );
        let mut results = filter.apply(searcher.search(&search_query, fetch)?);

        if options.mmr {
            if let Some(embedding) = &search_query.embedding {
                let ids: Vec<i64> = results.iter().take(mmr_pool).map(|r| r.chunk_id).collect();
                let vectors = self.capsule.embeddings_for_chunks(&ids)?;
                let mmr = MmrOptions {
                    lambda: options.mmr_lambda,
                    pool_size: mmr_pool,
                    top_k: options.top_k,
                    score_mode: options.score_mode,
                };
                results = mmr_rerank(results, embedding, &vectors, &mmr);
            }
        }

        results.truncate(options.top_k);
        log::info!("Query returned {} results", results.len());
        Ok(results)
    }

    async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        let timeout = self.config.embedding.timeout();
        match &self.provider {
            Some(provider) => embed_with_timeout(provider.as_ref(), query, timeout).await,
            None => {
                let provider = self.provider_from_meta()?;
                embed_with_timeout(provider.as_ref(), query, timeout).await
            }
        }
    }

    fn hybrid(&self) -> HybridSearcher<'a> {
        HybridSearcher::new(self.capsule)
            .with_candidate_limit(self.config.search.candidate_limit)
            .with_rrf_k(self.config.search.rrf_k)
    }

    fn searcher(&self, strategy: SearchStrategy) -> Result<Box<dyn Searcher + 'a>> {
        Ok(match strategy {
            SearchStrategy::Bm25 => Box::new(Bm25Searcher::new(self.capsule)?),
            SearchStrategy::Vector => Box::new(VectorSearcher::new(self.capsule)),
            SearchStrategy::Hybrid => Box::new(self.hybrid()),
            SearchStrategy::Vec => Box::new(FallbackSearcher::new(
                Box::new(VecSearcher::new(self.capsule, self.config.ann.vec.clone())?),
                Box::new(self.hybrid()),
            )),
            SearchStrategy::Vss => Box::new(FallbackSearcher::new(
                Box::new(VssSearcher::new(self.capsule, self.config.ann.vss.clone())?),
                Box::new(self.hybrid()),
            )),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use crate::storage::{ChunkDraft, SourceDocument};
    use std::path::PathBuf;

    const DIM: usize = 32;

    fn capsule_with(docs: &[(&str, &str)]) -> Capsule {
        let embedder = HashEmbedder::new(DIM).unwrap();
        let mut capsule = Capsule::open_in_memory().unwrap();
        for (path, text) in docs {
            let chunk = ChunkDraft {
                source_id: 0,
                text: text.to_string(),
                token_count: text.split_whitespace().count(),
            };
            capsule
                .add_document(&SourceDocument::new(*path, *text), &[(chunk, embedder.embed_sync(text))])
                .unwrap();
        }
        capsule.set_meta(meta_keys::EMBEDDING_PROVIDER, "hash").unwrap();
        capsule.set_meta(meta_keys::EMBEDDING_MODEL, "feature-hash").unwrap();
        capsule
    }

    fn pipeline(capsule: &Capsule) -> SearchPipeline<'_> {
        SearchPipeline::new(capsule, Config::default()).with_provider(Box::new(HashEmbedder::new(DIM).unwrap()))
    }

    fn options(strategy: SearchStrategy, top_k: usize) -> SearchOptions {
        SearchOptions {
            strategy,
            top_k,
            ..SearchOptions::default()
        }
    }

    fn paths(results: &[SearchResult]) -> Vec<&str> {
        results.iter().map(|r| r.source_path.as_str()).collect()
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("BM25".parse::<SearchStrategy>().unwrap(), SearchStrategy::Bm25);
        assert_eq!("sqlite-vss".parse::<SearchStrategy>().unwrap(), SearchStrategy::Vss);
        assert!("annoy".parse::<SearchStrategy>().is_err());
        assert!(!SearchStrategy::Bm25.needs_embedding());
        assert!(SearchStrategy::Vec.needs_embedding());
    }

    #[test]
    fn test_mmr_pool_defaults_to_search_pool() {
        let options = options(SearchStrategy::Hybrid, 3);
        assert_eq!(options.search_pool, 50);
        assert_eq!(options.mmr_pool_size(), 50);

        let options = SearchOptions { mmr_pool: Some(7), ..options };
        assert_eq!(options.mmr_pool_size(), 7);
    }

    #[tokio::test]
    async fn test_bm25_single_match() {
        let capsule = capsule_with(&[
            ("docs/a.txt", "the zebra crossing"),
            ("docs/b.txt", "a quiet meadow"),
        ]);

        let results = pipeline(&capsule)
            .run("zebra", &options(SearchStrategy::Bm25, 5))
            .await
            .unwrap();
        assert_eq!(paths(&results), vec!["docs/a.txt"]);
        assert!(results[0].score > 0.0);
    }

    #[tokio::test]
    async fn test_include_and_exclude_filters() {
        let capsule = capsule_with(&[
            ("docs/guide.txt", "rust guide"),
            ("docs/secret/keys.txt", "rust secret"),
            ("lib/main.txt", "rust code"),
        ]);
        let pipeline = pipeline(&capsule);

        let mut opts = options(SearchStrategy::Hybrid, 5);
        opts.include = Some("docs/**".to_string());
        let results = pipeline.run("rust", &opts).await.unwrap();
        let mut found = paths(&results);
        found.sort();
        assert_eq!(found, vec!["docs/guide.txt", "docs/secret/keys.txt"]);

        opts.exclude = Some("docs/secret/**".to_string());
        let results = pipeline.run("rust", &opts).await.unwrap();
        assert_eq!(paths(&results), vec!["docs/guide.txt"]);
    }

    #[tokio::test]
    async fn test_filter_fills_top_k_from_pool() {
        let mut docs: Vec<(String, String)> = (0..20)
            .map(|i| (format!("lib/{}.txt", i), "alpha alpha alpha".to_string()))
            .collect();
        docs.push(("docs/a.txt".to_string(), "alpha beta gamma delta".to_string()));
        let borrowed: Vec<(&str, &str)> = docs.iter().map(|(p, t)| (p.as_str(), t.as_str())).collect();
        let capsule = capsule_with(&borrowed);

        let mut opts = options(SearchStrategy::Bm25, 1);
        opts.include = Some("docs/*".to_string());
        let results = pipeline(&capsule).run("alpha", &opts).await.unwrap();
        assert_eq!(paths(&results), vec!["docs/a.txt"]);
    }

    #[tokio::test]
    async fn test_mmr_keeps_both_scores() {
        let capsule = capsule_with(&[
            ("a.txt", "memory safety in rust"),
            ("b.txt", "memory safety in rust programs"),
            ("c.txt", "garbage collection in java"),
        ]);

        let mut opts = options(SearchStrategy::Vector, 2);
        opts.mmr = true;
        opts.mmr_lambda = 0.7;
        let results = pipeline(&capsule).run("memory safety", &opts).await.unwrap();

        assert_eq!(results.len(), 2);
        for result in &results {
            assert!(result.rerank_score.is_some());
            assert_eq!(result.score, result.retrieval_score);
        }
        let json = serde_json::to_string(&results[0]).unwrap();
        assert!(json.contains("retrieval_score"));
        assert!(json.contains("rerank_score"));
    }

    #[tokio::test]
    async fn test_ann_strategy_falls_back_to_hybrid() {
        let capsule = capsule_with(&[("docs/a.txt", "vector search"), ("docs/b.txt", "other")]);
        let mut config = Config::default();
        config.ann.vec.path = Some(PathBuf::from("/nonexistent/vec0.so"));

        let pipeline = SearchPipeline::new(&capsule, config).with_provider(Box::new(HashEmbedder::new(DIM).unwrap()));
        let results = pipeline.run("vector", &options(SearchStrategy::Vec, 1)).await.unwrap();
        assert_eq!(paths(&results), vec!["docs/a.txt"]);
    }

    #[tokio::test]
    async fn test_ann_strategy_without_path_is_configuration_error() {
        let capsule = capsule_with(&[("docs/a.txt", "vector search")]);
        let result = pipeline(&capsule).run("vector", &options(SearchStrategy::Vss, 1)).await;
        assert!(matches!(result, Err(RagcapError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_query_dimension_mismatch_is_fatal() {
        let capsule = capsule_with(&[("docs/a.txt", "vector search")]);
        let pipeline =
            SearchPipeline::new(&capsule, Config::default()).with_provider(Box::new(HashEmbedder::new(8).unwrap()));

        let result = pipeline.run("vector", &options(SearchStrategy::Vector, 1)).await;
        assert!(matches!(result, Err(RagcapError::DimensionMismatch { expected: 32, actual: 8 })));
    }

    #[tokio::test]
    async fn test_provider_rebuilt_from_meta() {
        let capsule = capsule_with(&[("docs/a.txt", "vector search")]);
        let pipeline = SearchPipeline::new(&capsule, Config::default());

        let provider = pipeline.provider_from_meta().unwrap();
        assert_eq!(provider.name(), "hash");
        assert_eq!(provider.dimension(), Some(DIM));

        let results = pipeline.run("vector", &options(SearchStrategy::Vector, 1)).await.unwrap();
        assert_eq!(paths(&results), vec!["docs/a.txt"]);
    }

    #[tokio::test]
    async fn test_invalid_capsule_is_rejected() {
        let capsule = capsule_with(&[("docs/a.txt", "vector search")]);
        capsule.connection().execute_batch("UPDATE sources SET hash = ''").unwrap();

        let result = pipeline(&capsule).run("vector", &options(SearchStrategy::Bm25, 1)).await;
        assert!(matches!(result, Err(RagcapError::Storage(_))));
    }

    #[tokio::test]
    async fn test_capsule_validated_once_per_pipeline() {
        let capsule = capsule_with(&[("docs/a.txt", "vector search")]);
        let search = pipeline(&capsule);
        let bm25 = options(SearchStrategy::Bm25, 1);
        assert_eq!(search.run("vector", &bm25).await.unwrap().len(), 1);

        // Out-of-band damage is only noticed by a new pipeline
        capsule.connection().execute_batch("UPDATE sources SET hash = ''").unwrap();
        assert_eq!(search.run("vector", &bm25).await.unwrap().len(), 1);
        assert!(pipeline(&capsule).run("vector", &bm25).await.is_err());
    }
}
