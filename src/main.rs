//! ragcap CLI application
//!
//! Command-line interface for building, querying and checking capsules.

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use ragcap::config::AnnConfig;
use ragcap::embedding::create_provider;
use ragcap::pipeline::{self, chunk_file};
use ragcap::search::ScoreMode;
use ragcap::search::ann::{AnnIndex, AnnKind, IndexStatus};
use ragcap::utils::{format_file_size, truncate_chars};
use ragcap::{BuildPipeline, Capsule, Config, Recipe, SearchOptions, SearchPipeline, SearchStrategy};
use std::path::PathBuf;
use std::sync::atomic::Ordering;

#[derive(Parser)]
#[command(name = "ragcap")]
#[command(about = "Build and query portable retrieval capsules")]
#[command(version)]
struct Cli {
    /// Log debug output (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest a file or folder into a capsule
    Build {
        /// Input file or folder; recipe sources resolve against it
        input: PathBuf,

        /// Capsule file to create or extend
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// TOML build recipe
        #[arg(short, long)]
        recipe: Option<PathBuf>,

        /// Embedding provider: hash, openai or azure
        #[arg(long)]
        provider: Option<String>,

        /// Embedding model or Azure deployment
        #[arg(long)]
        model: Option<String>,

        /// Expected embedding dimension
        #[arg(long)]
        dimension: Option<usize>,

        /// Embeddings API base URL
        #[arg(long)]
        endpoint: Option<String>,

        /// Maximum tokens per chunk
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Tokens shared between consecutive chunks
        #[arg(long)]
        overlap: Option<usize>,

        /// WordPiece vocabulary (vocab.txt or tokenizer.json)
        #[arg(long)]
        vocab: Option<PathBuf>,

        /// Count plain word tokens instead of WordPiece pieces
        #[arg(long)]
        no_bert: bool,

        /// Hide the progress bar
        #[arg(long)]
        quiet: bool,
    },

    /// Show how a file would be chunked
    Chunk {
        file: PathBuf,

        #[arg(long, default_value = "200")]
        chunk_size: usize,

        #[arg(long, default_value = "50")]
        overlap: usize,

        #[arg(long)]
        vocab: Option<PathBuf>,

        #[arg(long)]
        no_bert: bool,
    },

    /// Search a capsule
    Search {
        capsule: PathBuf,

        /// Search query
        query: String,

        /// Number of results to return
        #[arg(short = 'k', long, default_value = "5")]
        top_k: usize,

        /// bm25, vector, hybrid, vec or vss
        #[arg(short, long, default_value = "hybrid")]
        strategy: String,

        /// Include globs, separated by ';' or ','
        #[arg(long)]
        include: Option<String>,

        /// Exclude globs, separated by ';' or ','
        #[arg(long)]
        exclude: Option<String>,

        /// Diversify results with MMR
        #[arg(long)]
        mmr: bool,

        #[arg(long, default_value = "0.5")]
        mmr_lambda: f32,

        #[arg(long)]
        mmr_pool: Option<usize>,

        /// Results fetched before path filtering
        #[arg(long)]
        search_pool: Option<usize>,

        /// Score reported after MMR: retrieval or mmr
        #[arg(long, default_value = "retrieval")]
        score_mode: String,

        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Summarize a capsule
    Inspect {
        capsule: PathBuf,

        #[arg(long)]
        json: bool,
    },

    /// Compare two capsules
    Diff {
        first: PathBuf,
        second: PathBuf,

        #[arg(long)]
        json: bool,
    },

    /// Check a capsule for integrity problems
    Validate { capsule: PathBuf },

    /// Build or refresh a native ANN index
    Index {
        capsule: PathBuf,

        /// vec or vss
        #[arg(long, default_value = "vec")]
        kind: String,

        /// Rebuild even when the embeddings are unchanged
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match cli.command {
        Commands::Build {
            input,
            output,
            recipe,
            provider,
            model,
            dimension,
            endpoint,
            chunk_size,
            overlap,
            vocab,
            no_bert,
            quiet,
        } => {
            let mut config = Config::default();
            if let Some(provider) = provider {
                config.embedding.provider = provider;
            }
            if let Some(model) = model {
                config.embedding.model = model;
            }
            if let Some(dimension) = dimension {
                config.embedding.dimension = dimension;
            }
            if let Some(endpoint) = endpoint {
                config.embedding.endpoint = endpoint;
            }
            if let Some(size) = chunk_size {
                config.chunking.size = size;
            }
            if let Some(overlap) = overlap {
                config.chunking.overlap = overlap;
            }
            if let Some(vocab) = vocab {
                config.chunking.vocab_path = vocab;
            }
            if no_bert {
                config.chunking.bert_aware = false;
            }
            build_command(input, output, recipe, config, !quiet).await?;
        }
        Commands::Chunk {
            file,
            chunk_size,
            overlap,
            vocab,
            no_bert,
        } => {
            let mut config = Config::default();
            config.chunking.size = chunk_size;
            config.chunking.overlap = overlap;
            config.chunking.bert_aware = !no_bert;
            if let Some(vocab) = vocab {
                config.chunking.vocab_path = vocab;
            }

            let chunks = chunk_file(&config, &file)?;
            println!("📄 {} -> {} chunks", file.display(), chunks.len());
            for (i, chunk) in chunks.iter().enumerate() {
                println!("--- chunk {} ({} tokens)", i + 1, chunk.token_count);
                println!("{}", chunk.text);
            }
        }
        Commands::Search {
            capsule,
            query,
            top_k,
            strategy,
            include,
            exclude,
            mmr,
            mmr_lambda,
            mmr_pool,
            search_pool,
            score_mode,
            json,
        } => {
            let mut config = Config::default();
            config.ann = AnnConfig::from_env();
            if let Some(pool) = search_pool {
                config.search.search_pool = Some(pool);
            }

            let options = SearchOptions {
                strategy: strategy.parse::<SearchStrategy>()?,
                top_k,
                include,
                exclude,
                mmr,
                mmr_lambda,
                mmr_pool,
                search_pool: config.search.effective_search_pool(top_k),
                score_mode: score_mode.parse::<ScoreMode>()?,
            };
            search_command(capsule, query, config, options, json).await?;
        }
        Commands::Inspect { capsule, json } => {
            let size = std::fs::metadata(&capsule).map(|m| m.len()).unwrap_or(0);
            let capsule = Capsule::open_existing(&capsule)?;
            let summary = pipeline::inspect(&capsule)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("📦 Capsule: {}", summary.path.as_deref().unwrap_or("(memory)"));
                println!("   Size: {}", format_file_size(size));
                println!("   Schema version: {}", summary.schema_version);
                println!("   Created: {}", summary.created_at);
                println!(
                    "   Embeddings: {} / {} ({} dimensions)",
                    summary.provider.as_deref().unwrap_or("-"),
                    summary.model.as_deref().unwrap_or("-"),
                    summary.dimension.map(|d| d.to_string()).unwrap_or_else(|| "-".to_string())
                );
                println!("   Sources: {}", summary.sources);
                println!("   Chunks: {}", summary.chunks);
                println!("   Vectors: {}", summary.embeddings);
                println!("   Avg chunk: {:.1} chars, {:.1} tokens", summary.avg_chunk_chars, summary.avg_token_count);
                println!("   Exports: {}", summary.exports);
            }
        }
        Commands::Diff { first, second, json } => {
            let before = Capsule::open_existing(&first)?;
            let after = Capsule::open_existing(&second)?;
            let diff = pipeline::diff(&before, &after)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&diff)?);
            } else if diff.is_empty() {
                println!("✅ Capsules are equivalent");
            } else {
                for (key, change) in &diff.meta {
                    println!(
                        "~ meta {}: {} -> {}",
                        key,
                        change.before.as_deref().unwrap_or("-"),
                        change.after.as_deref().unwrap_or("-")
                    );
                }
                for path in &diff.added_sources {
                    println!("+ {}", path);
                }
                for path in &diff.removed_sources {
                    println!("- {}", path);
                }
                for path in &diff.modified_sources {
                    println!("~ {}", path);
                }
                println!("   Chunks: {} -> {}", diff.chunk_count.before, diff.chunk_count.after);
                println!(
                    "   Avg chunk chars: {:.1} -> {:.1}",
                    diff.avg_chunk_chars.before, diff.avg_chunk_chars.after
                );
                if diff.dimension.changed() {
                    println!("   Dimension: {:?} -> {:?}", diff.dimension.before, diff.dimension.after);
                }
                if diff.recipe.changed() {
                    println!("   Recipe changed");
                }
            }
        }
        Commands::Validate { capsule } => {
            let path = capsule;
            let capsule = Capsule::open_existing(&path)?;
            let report = pipeline::validate(&capsule)?;

            if report.is_valid() {
                println!("✅ {} is valid", path.display());
            } else {
                for issue in &report.issues {
                    eprintln!("❌ {}", issue);
                }
                bail!("{} failed validation with {} issues", path.display(), report.issues.len());
            }
        }
        Commands::Index { capsule, kind, force } => {
            let kind = match kind.to_lowercase().as_str() {
                "vec" => AnnKind::Vec,
                "vss" => AnnKind::Vss,
                other => bail!("Unknown index kind '{}'; expected vec or vss", other),
            };
            let mut ann = AnnConfig::from_env();
            ann.vec.force_reindex |= force;
            ann.vss.force_reindex |= force;

            let mut capsule = Capsule::open_existing(&capsule)?;
            match AnnIndex::build(&mut capsule, kind, &ann)? {
                IndexStatus::Rebuilt => println!("✅ Index rebuilt"),
                IndexStatus::UpToDate => println!("✅ Index is up to date"),
            }
        }
    }

    Ok(())
}

async fn build_command(
    input: PathBuf,
    output: Option<PathBuf>,
    recipe: Option<PathBuf>,
    config: Config,
    show_progress: bool,
) -> anyhow::Result<()> {
    let recipe = recipe.map(|path| Recipe::load(&path)).transpose()?;

    let mut effective = config.clone();
    if let Some(recipe) = &recipe {
        recipe.apply_to(&mut effective);
    }
    let provider = create_provider(&effective.embedding).context("Failed to create embedding provider")?;

    let output = output
        .or_else(|| {
            recipe
                .as_ref()
                .map(|r| r.output.path.clone())
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
        })
        .unwrap_or_else(|| PathBuf::from("capsule.ragcap"));

    let pipeline = match recipe {
        Some(recipe) => BuildPipeline::from_recipe(recipe, config, provider)?,
        None => BuildPipeline::new(config, provider)?,
    }
    .with_progress(show_progress);

    let cancel = pipeline.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupt received, stopping after the current document");
            cancel.store(true, Ordering::SeqCst);
        }
    });

    println!("📦 Building {} from {}", output.display(), input.display());
    let mut capsule = Capsule::open(&output)?;
    let report = pipeline.run(&mut capsule, &input).await?;

    for warning in &report.warnings {
        eprintln!("⚠️  {}: {}", warning.path, warning.message);
    }
    println!("✅ Build complete!");
    println!("   📄 Sources: {}", report.sources);
    println!("   🧩 Chunks: {} ({} chunker)", report.chunks, report.chunker);
    println!("   🔢 Embeddings: {}", report.embeddings);
    println!("   ⏱️  Time: {:.2}s", report.elapsed_secs);

    Ok(())
}

async fn search_command(
    capsule: PathBuf,
    query: String,
    config: Config,
    options: SearchOptions,
    json: bool,
) -> anyhow::Result<()> {
    let capsule = Capsule::open_existing(&capsule)?;
    let results = SearchPipeline::new(&capsule, config).run(&query, &options).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
        return Ok(());
    }

    if results.is_empty() {
        println!("❌ No results found");
        return Ok(());
    }

    println!("📋 Found {} results:", results.len());
    println!();
    for (i, result) in results.iter().enumerate() {
        match result.rerank_score {
            Some(rerank) => println!(
                "{}. Score: {:.3} (retrieval {:.3}, mmr {:.3}) {}",
                i + 1,
                result.score,
                result.retrieval_score,
                rerank,
                result.source_path
            ),
            None => println!("{}. Score: {:.3} {}", i + 1, result.score, result.source_path),
        }
        println!("   {}", truncate_chars(&result.text, 200));
        println!();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["ragcap", "build", "docs", "-o", "docs.ragcap", "--provider", "hash"]);
        assert!(cli.is_ok());

        let cli = Cli::try_parse_from([
            "ragcap", "search", "docs.ragcap", "memory safety", "-k", "3", "--strategy", "vec", "--mmr",
            "--include", "docs/**;notes/*",
        ])
        .unwrap();
        match cli.command {
            Commands::Search { top_k, mmr, include, .. } => {
                assert_eq!(top_k, 3);
                assert!(mmr);
                assert_eq!(include.as_deref(), Some("docs/**;notes/*"));
            }
            _ => panic!("expected search command"),
        }
    }

    #[test]
    fn test_verbose_is_global() {
        let cli = Cli::try_parse_from(["ragcap", "validate", "a.ragcap", "--verbose"]).unwrap();
        assert!(cli.verbose);
    }
}
