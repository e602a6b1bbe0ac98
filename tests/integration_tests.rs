//! End-to-end tests: build capsules from folders on disk, then query,
//! inspect and compare them.

use ragcap::embedding::{EmbeddingProvider, HashEmbedder, create_provider};
use ragcap::pipeline::{self, SearchStrategy};
use ragcap::storage::meta_keys;
use ragcap::{BuildPipeline, Capsule, Config, RagcapError, Recipe, SearchOptions, SearchPipeline};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

fn offline_config() -> Config {
    let mut config = Config::default();
    config.chunking.bert_aware = false;
    config.chunking.size = 32;
    config.chunking.overlap = 4;
    config.embedding.provider = "hash".to_string();
    config
}

fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

fn corpus(root: &Path) {
    write(root, "docs/intro.md", "Capsules bundle documents for offline retrieval.");
    write(root, "docs/guide/search.md", "Hybrid search fuses BM25 and vector rankings.");
    write(root, "lib/notes.txt", "Search internals: BM25 scoring details.");
    write(root, "docs/logo.png", "not text");
    write(root, ".cache/skip.txt", "hidden search text");
}

async fn build(root: &Path, capsule_path: &Path, dimension: usize) -> ragcap::BuildReport {
    let pipeline = BuildPipeline::new(offline_config(), Box::new(HashEmbedder::new(dimension).unwrap())).unwrap();
    let mut capsule = Capsule::open(capsule_path).unwrap();
    pipeline.run(&mut capsule, root).await.unwrap()
}

fn options(strategy: SearchStrategy, top_k: usize) -> SearchOptions {
    SearchOptions {
        strategy,
        top_k,
        ..SearchOptions::default()
    }
}

#[tokio::test]
async fn test_build_then_search_with_path_filters() -> Result<(), Box<dyn std::error::Error>> {
    let temp_dir = tempfile::tempdir()?;
    let root = temp_dir.path().join("corpus");
    corpus(&root);
    let capsule_path = temp_dir.path().join("corpus.ragcap");

    let report = build(&root, &capsule_path, 16).await;
    assert_eq!(report.sources, 3);
    assert_eq!(report.chunks, 3);
    assert_eq!(report.warnings.len(), 1);
    assert_eq!(report.warnings[0].path, "docs/logo.png");

    // Reopen from disk; the query provider comes from the capsule meta
    let capsule = Capsule::open_existing(&capsule_path)?;
    let search = SearchPipeline::new(&capsule, offline_config());

    let all = search.run("search", &options(SearchStrategy::Hybrid, 5)).await?;
    let mut paths: Vec<&str> = all.iter().map(|r| r.source_path.as_str()).collect();
    paths.sort();
    assert_eq!(paths, vec!["docs/guide/search.md", "lib/notes.txt"]);

    let mut filtered = options(SearchStrategy::Hybrid, 5);
    filtered.include = Some("docs/**".to_string());
    let results = search.run("search", &filtered).await?;
    let paths: Vec<&str> = results.iter().map(|r| r.source_path.as_str()).collect();
    assert_eq!(paths, vec!["docs/guide/search.md"]);

    filtered.exclude = Some("**/guide/**".to_string());
    assert!(search.run("search", &filtered).await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_every_strategy_answers() -> Result<(), Box<dyn std::error::Error>> {
    let temp_dir = tempfile::tempdir()?;
    let root = temp_dir.path().join("corpus");
    corpus(&root);
    let capsule_path = temp_dir.path().join("corpus.ragcap");
    build(&root, &capsule_path, 16).await;

    let capsule = Capsule::open_existing(&capsule_path)?;
    let mut config = offline_config();
    config.ann.vec.path = Some(temp_dir.path().join("missing-vec0.so"));
    config.ann.vss.path = Some(temp_dir.path().join("missing-vss0.so"));
    let search = SearchPipeline::new(&capsule, config);

    for strategy in [
        SearchStrategy::Bm25,
        SearchStrategy::Vector,
        SearchStrategy::Hybrid,
        SearchStrategy::Vec,
        SearchStrategy::Vss,
    ] {
        let results = search.run("BM25 rankings", &options(strategy, 2)).await?;
        assert!(!results.is_empty(), "{:?} returned nothing", strategy);
        assert!(results.len() <= 2);
    }

    Ok(())
}

#[tokio::test]
async fn test_rebuild_with_other_dimension_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let temp_dir = tempfile::tempdir()?;
    let root = temp_dir.path().join("corpus");
    corpus(&root);
    let capsule_path = temp_dir.path().join("corpus.ragcap");
    build(&root, &capsule_path, 16).await;

    let pipeline = BuildPipeline::new(offline_config(), Box::new(HashEmbedder::new(24)?))?;
    let mut capsule = Capsule::open(&capsule_path)?;
    let result = pipeline.run(&mut capsule, &root).await;
    assert!(matches!(
        result,
        Err(RagcapError::DimensionMismatch {
            expected: 16,
            actual: 24
        })
    ));
    assert_eq!(capsule.stats()?.sources, 3);

    Ok(())
}

#[tokio::test]
async fn test_cancelled_build_keeps_capsule_consistent() -> Result<(), Box<dyn std::error::Error>> {
    let temp_dir = tempfile::tempdir()?;
    let root = temp_dir.path().join("corpus");
    corpus(&root);

    let cancel = Arc::new(AtomicBool::new(false));
    let builder = BuildPipeline::new(offline_config(), Box::new(HashEmbedder::new(16)?))?
        .with_cancel_flag(Arc::clone(&cancel));
    cancel.store(true, Ordering::SeqCst);

    let mut capsule = Capsule::open(temp_dir.path().join("cancelled.ragcap"))?;
    let result = builder.run(&mut capsule, &root).await;
    assert!(matches!(result, Err(RagcapError::Cancelled)));
    assert!(pipeline::validate(&capsule)?.is_valid());

    Ok(())
}

#[tokio::test]
async fn test_recipe_build_and_diff() -> Result<(), Box<dyn std::error::Error>> {
    let temp_dir = tempfile::tempdir()?;
    let root = temp_dir.path().join("corpus");
    corpus(&root);

    let recipe = Recipe::from_toml(
        r#"
[[sources]]
path = "docs"
type = "folder"

[chunking]
size = 64
overlap = 8
bert_aware = false

[embeddings]
provider = "hash"
dimension = 24
"#,
    )?;

    let mut effective = offline_config();
    recipe.apply_to(&mut effective);
    let provider = create_provider(&effective.embedding)?;
    assert_eq!(provider.dimension(), Some(24));

    let recipe_path = temp_dir.path().join("recipe.ragcap");
    let builder = BuildPipeline::from_recipe(recipe.clone(), offline_config(), provider)?;
    let mut recipe_capsule = Capsule::open(&recipe_path)?;
    let report = builder.run(&mut recipe_capsule, &root).await?;
    assert_eq!(report.sources, 2);

    let snapshot = recipe_capsule.get_meta(meta_keys::RECIPE)?.unwrap();
    let restored: Recipe = serde_json::from_str(&snapshot)?;
    assert_eq!(restored, recipe);

    let summary = pipeline::inspect(&recipe_capsule)?;
    assert_eq!(summary.dimension, Some(24));
    assert_eq!(summary.provider.as_deref(), Some("hash"));

    let full_path = temp_dir.path().join("full.ragcap");
    build(&root, &full_path, 16).await;
    let full_capsule = Capsule::open_existing(&full_path)?;

    let diff = pipeline::diff(&full_capsule, &recipe_capsule)?;
    assert_eq!(diff.removed_sources, vec!["lib/notes.txt"]);
    assert!(diff.added_sources.is_empty());
    assert!(diff.modified_sources.is_empty());
    assert_eq!(diff.dimension.before, Some(16));
    assert_eq!(diff.dimension.after, Some(24));
    assert!(diff.recipe.changed());

    Ok(())
}

#[tokio::test]
async fn test_lexical_query_limited_to_docs_folder() -> Result<(), Box<dyn std::error::Error>> {
    let temp_dir = tempfile::tempdir()?;
    let root = temp_dir.path().join("corpus");
    write(&root, "docs/a.txt", "alpha text");
    write(&root, "lib/b.txt", "beta text");

    let capsule_path = temp_dir.path().join("small.ragcap");
    let report = build(&root, &capsule_path, 16).await;
    assert_eq!(report.sources, 2);

    let capsule = Capsule::open_existing(&capsule_path)?;
    let search = SearchPipeline::new(&capsule, offline_config());

    let mut lexical = options(SearchStrategy::Bm25, 5);
    assert_eq!(search.run("text", &lexical).await?.len(), 2);

    lexical.include = Some("docs/**".to_string());
    let results = search.run("text", &lexical).await?;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].source_path, "docs/a.txt");
    assert_eq!(results[0].text, "alpha text");

    Ok(())
}
