//! End-to-end operations over capsules
//!
//! Building ingests documents, searching selects a strategy and applies path
//! filtering and MMR, and inspection covers summaries, diffs and validation.

pub mod build;
pub mod inspect;
pub mod search;

pub use build::{BuildPipeline, BuildReport, BuildWarning, Discovery, InputFile, chunk_file};
pub use inspect::{CapsuleDiff, CapsuleSummary, Change, ValidationReport, diff, inspect, validate};
pub use search::{SearchOptions, SearchPipeline, SearchStrategy};
