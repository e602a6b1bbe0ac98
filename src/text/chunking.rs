//! Text chunking algorithms
//!
//! This module splits normalized document text into token-bounded,
//! optionally overlapping chunks. Chunk text is always the exact slice of the
//! source between the first and last token of a window, so whitespace and
//! punctuation spacing survive chunking.

use crate::config::ChunkingConfig;
use crate::error::{RagcapError, Result};
use crate::storage::ChunkDraft;
use crate::text::tokenizer::WordTokenizer;
use crate::text::wordpiece::WordpieceChunker;
use regex::Regex;

/// Splits text into chunks
pub trait Chunker: Send + Sync {
    /// Chunk `text` for the source `source_id`, in document order
    fn chunk(&self, source_id: i64, text: &str) -> Result<Vec<ChunkDraft>>;

    /// Short strategy name for logs and reports
    fn name(&self) -> &'static str;
}

/// A token's byte span and its weight in budget units
#[derive(Debug, Clone, Copy)]
pub(crate) struct WeightedSpan {
    pub start: usize,
    pub end: usize,
    pub weight: usize,
}

/// Blank-line paragraph splitter shared by both chunkers
#[derive(Debug, Clone)]
pub(crate) struct ParagraphSplitter {
    regex: Regex,
}

impl ParagraphSplitter {
    pub fn new() -> Result<Self> {
        let regex = Regex::new(r"(\r\n|\n|\r){2,}")
            .map_err(|e| RagcapError::TextProcessing(format!("Failed to compile paragraph regex: {}", e)))?;
        Ok(Self { regex })
    }

    /// Non-blank paragraphs, trimmed
    pub fn split<'a>(&self, text: &'a str) -> Vec<&'a str> {
        self.regex
            .split(text)
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect()
    }
}

/// Clamp the overlap so every window advances
pub(crate) fn clamp_overlap(budget: usize, overlap: usize) -> usize {
    overlap.min(budget / 2)
}

/// Sliding-window chunking over weighted spans.
///
/// Each window takes spans while their summed weight stays within `budget`
/// (a single span heavier than the budget forms a window on its own), then
/// the next window starts after `budget - overlap` units of weight.
pub(crate) fn window_chunks(
    source_id: i64,
    text: &str,
    spans: &[WeightedSpan],
    budget: usize,
    overlap: usize,
) -> Vec<ChunkDraft> {
    let mut chunks = Vec::new();
    let step = budget.saturating_sub(overlap).max(1);
    let mut start = 0;

    while start < spans.len() {
        let mut end = start;
        let mut weight = 0;
        while end < spans.len() && (end == start || weight + spans[end].weight <= budget) {
            weight += spans[end].weight;
            end += 1;
        }

        chunks.push(ChunkDraft {
            source_id,
            text: text[spans[start].start..spans[end - 1].end].to_string(),
            token_count: weight,
        });

        if end == spans.len() {
            break;
        }

        let mut advanced = 0;
        let mut next = start;
        while next < end && advanced < step {
            advanced += spans[next].weight;
            next += 1;
        }
        start = next.max(start + 1);
    }

    chunks
}

/// Regex word/punctuation token chunker
#[derive(Debug, Clone)]
pub struct TokenChunker {
    max_tokens: usize,
    overlap: usize,
    preserve_paragraphs: bool,
    tokenizer: WordTokenizer,
    paragraphs: ParagraphSplitter,
}

impl TokenChunker {
    /// Create a chunker with a budget of `max_tokens` and the given overlap.
    /// The overlap is clamped to half the budget.
    pub fn new(max_tokens: usize, overlap: usize) -> Result<Self> {
        if max_tokens == 0 {
            return Err(RagcapError::Configuration(
                "Chunk size must be at least one token".to_string(),
            ));
        }

        Ok(Self {
            max_tokens,
            overlap: clamp_overlap(max_tokens, overlap),
            preserve_paragraphs: true,
            tokenizer: WordTokenizer::new()?,
            paragraphs: ParagraphSplitter::new()?,
        })
    }

    /// Enable or disable paragraph preservation (enabled by default)
    pub fn with_paragraphs(mut self, preserve: bool) -> Self {
        self.preserve_paragraphs = preserve;
        self
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    fn window(&self, source_id: i64, text: &str) -> Vec<ChunkDraft> {
        let spans: Vec<WeightedSpan> = self
            .tokenizer
            .tokenize(text)
            .into_iter()
            .map(|t| WeightedSpan {
                start: t.start,
                end: t.end,
                weight: 1,
            })
            .collect();

        window_chunks(source_id, text, &spans, self.max_tokens, self.overlap)
    }
}

impl Chunker for TokenChunker {
    fn chunk(&self, source_id: i64, text: &str) -> Result<Vec<ChunkDraft>> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        if !self.preserve_paragraphs {
            return Ok(self.window(source_id, text));
        }

        let mut chunks = Vec::new();
        for paragraph in self.paragraphs.split(text) {
            let token_count = self.tokenizer.count(paragraph);
            if token_count <= self.max_tokens {
                chunks.push(ChunkDraft {
                    source_id,
                    text: paragraph.to_string(),
                    token_count,
                });
            } else {
                chunks.extend(self.window(source_id, paragraph));
            }
        }

        Ok(chunks)
    }

    fn name(&self) -> &'static str {
        "token"
    }
}

/// Build the chunker described by `config`.
///
/// A WordPiece-aware chunker is preferred when enabled; if its vocabulary
/// cannot be loaded the regex token chunker is used instead.
pub fn create_chunker(config: &ChunkingConfig) -> Result<Box<dyn Chunker>> {
    if config.bert_aware {
        match WordpieceChunker::from_path(&config.vocab_path, config.size, config.overlap) {
            Ok(chunker) => {
                log::info!("Using WordPiece chunker with vocabulary {}", config.vocab_path.display());
                return Ok(Box::new(chunker.with_paragraphs(config.preserve_paragraphs)));
            }
            Err(e) => {
                log::warn!(
                    "WordPiece vocabulary unavailable ({}), falling back to token chunker",
                    e
                );
            }
        }
    }

    let chunker = TokenChunker::new(config.size, config.overlap)?
        .with_paragraphs(config.preserve_paragraphs);
    Ok(Box::new(chunker))
}
