//! Batch ingestion into a capsule
//!
//! Discovers input files, then for every document: load, hash, preprocess,
//! chunk, embed, and store source, chunks and embeddings in one transaction.
//! A document that fails is recorded as a warning and the batch goes on.

use crate::config::{Config, Recipe};
use crate::embedding::{EmbeddingProvider, embed_with_timeout};
use crate::error::{RagcapError, Result};
use crate::loaders::LoaderRegistry;
use crate::storage::{Capsule, ChunkDraft, SourceDocument, meta_keys};
use crate::text::{Chunker, Preprocessor, create_chunker};
use crate::utils::{is_hidden, relative_path};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use walkdir::WalkDir;

/// A document that was skipped or failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildWarning {
    pub path: String,
    pub message: String,
}

/// Summary of a build
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildReport {
    pub sources: usize,
    pub chunks: usize,
    pub embeddings: usize,
    pub warnings: Vec<BuildWarning>,
    pub chunker: String,
    pub elapsed_secs: f64,
}

/// A discovered input file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputFile {
    /// Location on disk
    pub path: PathBuf,
    /// Path stored in the capsule, relative to the build base, `/`-separated
    pub stored_path: String,
}

/// Input files plus the entries skipped during discovery
#[derive(Debug, Clone, Default)]
pub struct Discovery {
    pub files: Vec<InputFile>,
    pub skipped: Vec<BuildWarning>,
}

/// Ingestion pipeline
pub struct BuildPipeline {
    config: Config,
    recipe: Option<Recipe>,
    chunker: Box<dyn Chunker>,
    preprocessor: Preprocessor,
    provider: Box<dyn EmbeddingProvider>,
    loaders: LoaderRegistry,
    cancel: Arc<AtomicBool>,
    show_progress: bool,
}

impl BuildPipeline {
    pub fn new(config: Config, provider: Box<dyn EmbeddingProvider>) -> Result<Self> {
        let chunker = create_chunker(&config.chunking)?;
        let preprocessor = Preprocessor::new(config.preprocess.clone())?;

        Ok(Self {
            config,
            recipe: None,
            chunker,
            preprocessor,
            provider,
            loaders: LoaderRegistry::default(),
            cancel: Arc::new(AtomicBool::new(false)),
            show_progress: false,
        })
    }

    /// Pipeline configured by `recipe` on top of `config`; the recipe is
    /// snapshotted into the capsule meta and its sources are ingested
    pub fn from_recipe(recipe: Recipe, mut config: Config, provider: Box<dyn EmbeddingProvider>) -> Result<Self> {
        recipe.validate()?;
        recipe.apply_to(&mut config);
        let mut pipeline = Self::new(config, provider)?;
        pipeline.recipe = Some(recipe);
        Ok(pipeline)
    }

    pub fn with_loaders(mut self, loaders: LoaderRegistry) -> Self {
        self.loaders = loaders;
        self
    }

    /// Share a cancellation flag; setting it stops the build before the next
    /// document
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn chunker_name(&self) -> &'static str {
        self.chunker.name()
    }

    /// Find the files to ingest under `base`.
    ///
    /// With a recipe, its sources are resolved against `base`; otherwise
    /// `base` itself (a directory or a single file) is the only source.
    /// Hidden entries are pruned and unsupported extensions are reported in
    /// [`Discovery::skipped`].
    pub fn discover(&self, base: &Path) -> Discovery {
        let base_dir = if base.is_file() {
            base.parent().map(Path::to_path_buf).unwrap_or_default()
        } else {
            base.to_path_buf()
        };

        let sources: Vec<PathBuf> = match &self.recipe {
            Some(recipe) if !recipe.sources.is_empty() => recipe
                .sources
                .iter()
                .map(|s| {
                    let path = PathBuf::from(&s.path);
                    if path.is_absolute() { path } else { base_dir.join(path) }
                })
                .collect(),
            _ => vec![base.to_path_buf()],
        };

        let mut files: BTreeMap<String, PathBuf> = BTreeMap::new();
        let mut skipped = Vec::new();

        for source in sources {
            if source.is_file() {
                self.consider(&source, &base_dir, &mut files, &mut skipped);
                continue;
            }
            if !source.is_dir() {
                skipped.push(BuildWarning {
                    path: source.display().to_string(),
                    message: "source not found".to_string(),
                });
                continue;
            }

            let walker = WalkDir::new(&source)
                .follow_links(false)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry.file_name()));

            for entry in walker {
                match entry {
                    Ok(entry) if entry.file_type().is_file() => {
                        self.consider(entry.path(), &base_dir, &mut files, &mut skipped);
                    }
                    Ok(_) => {}
                    Err(e) => skipped.push(BuildWarning {
                        path: e.path().map(|p| p.display().to_string()).unwrap_or_default(),
                        message: e.to_string(),
                    }),
                }
            }
        }

        log::debug!("Discovered {} input files, skipped {}", files.len(), skipped.len());
        Discovery {
            files: files
                .into_iter()
                .map(|(stored_path, path)| InputFile { path, stored_path })
                .collect(),
            skipped,
        }
    }

    fn consider(
        &self,
        path: &Path,
        base_dir: &Path,
        files: &mut BTreeMap<String, PathBuf>,
        skipped: &mut Vec<BuildWarning>,
    ) {
        let stored_path = relative_path(path, base_dir);
        if !self.loaders.supports(path) {
            log::debug!("Skipping unsupported file {}", stored_path);
            skipped.push(BuildWarning {
                path: stored_path,
                message: RagcapError::UnsupportedFileType(path.display().to_string()).to_string(),
            });
            return;
        }
        files.entry(stored_path).or_insert_with(|| path.to_path_buf());
    }

    /// Ingest everything under `base` into `capsule`.
    ///
    /// Returns [`RagcapError::Cancelled`] when the cancel flag is set;
    /// documents stored before that stay in the capsule.
    pub async fn run(&self, capsule: &mut Capsule, base: &Path) -> Result<BuildReport> {
        let started = Instant::now();

        if let (Some(expected), Some(existing)) = (self.provider.dimension(), capsule.embedding_dimension()?) {
            if expected != existing {
                return Err(RagcapError::DimensionMismatch {
                    expected: existing,
                    actual: expected,
                });
            }
        }

        let discovery = self.discover(base);
        // Provider meta commits with the first accepted document
        let meta = self.meta_entries()?;
        let mut meta_pending = true;

        let mut report = BuildReport {
            chunker: self.chunker.name().to_string(),
            warnings: discovery.skipped,
            ..BuildReport::default()
        };

        let progress = self.progress_bar(discovery.files.len());
        log::info!(
            "Building capsule from {} files with the {} chunker and {} embeddings",
            discovery.files.len(),
            self.chunker.name(),
            self.provider.name()
        );

        for input in &discovery.files {
            if self.cancel.load(Ordering::SeqCst) {
                progress.abandon_with_message("cancelled");
                log::warn!("Build cancelled after {} documents", report.sources);
                return Err(RagcapError::Cancelled);
            }

            progress.set_message(input.stored_path.clone());
            let pending: &[(&str, String)] = if meta_pending { &meta } else { &[] };
            match self.ingest(capsule, input, pending).await {
                Ok(chunk_count) => {
                    meta_pending = false;
                    report.sources += 1;
                    report.chunks += chunk_count;
                    report.embeddings += chunk_count;
                    log::debug!("Stored {} with {} chunks", input.stored_path, chunk_count);
                }
                Err(e) => {
                    log::warn!("Skipping {}: {}", input.stored_path, e);
                    report.warnings.push(BuildWarning {
                        path: input.stored_path.clone(),
                        message: e.to_string(),
                    });
                }
            }
            progress.inc(1);
        }
        progress.finish_and_clear();

        if meta_pending && capsule.embedding_dimension()?.is_none() {
            for (key, value) in &meta {
                capsule.set_meta(key, value)?;
            }
        }
        if let Some(dimension) = capsule.embedding_dimension()? {
            capsule.set_meta(meta_keys::EMBEDDING_DIMENSION, &dimension.to_string())?;
        }

        report.elapsed_secs = started.elapsed().as_secs_f64();
        log::info!(
            "Build finished: {} sources, {} chunks, {} warnings in {:.2}s",
            report.sources,
            report.chunks,
            report.warnings.len(),
            report.elapsed_secs
        );
        Ok(report)
    }

    async fn ingest(&self, capsule: &mut Capsule, input: &InputFile, meta: &[(&str, String)]) -> Result<usize> {
        let content = self.loaders.load(&input.path)?;
        let document = SourceDocument::new(input.stored_path.clone(), content);
        let text = self.preprocessor.process(&document);
        let drafts = self.chunker.chunk(0, &text)?;

        let timeout = self.config.embedding.timeout();
        let mut rows: Vec<(ChunkDraft, Vec<f32>)> = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let vector = embed_with_timeout(self.provider.as_ref(), &draft.text, timeout).await?;
            rows.push((draft, vector));
        }

        let (_, chunk_ids) = capsule.add_document_with_meta(&document, &rows, meta)?;
        Ok(chunk_ids.len())
    }

    fn meta_entries(&self) -> Result<Vec<(&'static str, String)>> {
        let mut meta = vec![
            (meta_keys::EMBEDDING_PROVIDER, self.provider.name().to_string()),
            (meta_keys::EMBEDDING_MODEL, self.provider.model().to_string()),
            (meta_keys::EMBEDDING_ENDPOINT, self.config.embedding.endpoint.clone()),
        ];
        if let Some(version) = &self.config.embedding.api_version {
            meta.push((meta_keys::EMBEDDING_API_VERSION, version.clone()));
        }
        if let Some(recipe) = &self.recipe {
            meta.push((meta_keys::RECIPE, recipe.to_json()?));
        }
        Ok(meta)
    }

    fn progress_bar(&self, len: usize) -> ProgressBar {
        let progress = ProgressBar::new(len as u64);
        if self.show_progress {
            let style = ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar());
            progress.set_style(style);
        } else {
            progress.set_draw_target(ProgressDrawTarget::hidden());
        }
        progress
    }
}

/// Preprocess and chunk a single file without touching a capsule
pub fn chunk_file(config: &Config, path: &Path) -> Result<Vec<ChunkDraft>> {
    let loaders = LoaderRegistry::default();
    let content = loaders.load(path)?;
    let document = SourceDocument::new(path.to_string_lossy(), content);
    let text = Preprocessor::new(config.preprocess.clone())?.process(&document);
    create_chunker(&config.chunking)?.chunk(0, &text)
}
