//! WordPiece-aware chunking
//!
//! Chunk budgets are measured in subword pieces as a BERT-style embedding
//! model would see them, so a chunk never silently overflows the model's
//! input window.

use crate::error::{RagcapError, Result};
use crate::storage::ChunkDraft;
use crate::text::chunking::{
    Chunker, ParagraphSplitter, WeightedSpan, clamp_overlap, window_chunks,
};
use std::collections::HashMap;
use std::path::Path;
use tokenizers::Tokenizer;
use tokenizers::models::wordpiece::WordPiece;
use tokenizers::normalizers::BertNormalizer;
use tokenizers::pre_tokenizers::bert::BertPreTokenizer;

/// Pieces reserved for `[CLS]` and `[SEP]`
pub const SPECIAL_TOKEN_RESERVE: usize = 2;

/// Counts WordPiece pieces of single words
pub struct WordpieceCounter {
    tokenizer: Tokenizer,
}

impl WordpieceCounter {
    /// Load from a BERT `vocab.txt` (one piece per line)
    pub fn from_vocab_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let path_str = path
            .to_str()
            .ok_or_else(|| RagcapError::Tokenizer(format!("Invalid vocabulary path: {}", path.display())))?;

        let model = WordPiece::from_file(path_str)
            .unk_token("[UNK]".to_string())
            .build()?;
        Ok(Self::bert_pipeline(model))
    }

    /// Load a serialized `tokenizer.json`
    pub fn from_tokenizer_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(path)?;
        Ok(Self { tokenizer })
    }

    /// Build from an in-memory vocabulary; it must contain `[UNK]`
    pub fn from_vocab(vocab: HashMap<String, u32>) -> Result<Self> {
        if !vocab.contains_key("[UNK]") {
            return Err(RagcapError::Tokenizer("Vocabulary has no [UNK] token".to_string()));
        }
        let model = WordPiece::builder()
            .vocab(vocab)
            .unk_token("[UNK]".to_string())
            .build()?;
        Ok(Self::bert_pipeline(model))
    }

    fn bert_pipeline(model: WordPiece) -> Self {
        let mut tokenizer = Tokenizer::new(model);
        tokenizer
            .with_normalizer(Some(BertNormalizer::default()))
            .with_pre_tokenizer(Some(BertPreTokenizer));
        Self { tokenizer }
    }

    /// Number of pieces `word` encodes to, without special tokens
    pub fn count(&self, word: &str) -> Result<usize> {
        let encoding = self.tokenizer.encode(word, false)?;
        Ok(encoding.get_ids().len())
    }
}

/// Whitespace-token chunker with budgets measured in WordPiece pieces
pub struct WordpieceChunker {
    counter: WordpieceCounter,
    budget: usize,
    overlap: usize,
    preserve_paragraphs: bool,
    paragraphs: ParagraphSplitter,
}

impl WordpieceChunker {
    /// `max_tokens` includes the two special tokens the model adds
    pub fn new(counter: WordpieceCounter, max_tokens: usize, overlap: usize) -> Result<Self> {
        if max_tokens <= SPECIAL_TOKEN_RESERVE {
            return Err(RagcapError::Configuration(format!(
                "WordPiece chunk size must exceed {} tokens",
                SPECIAL_TOKEN_RESERVE
            )));
        }

        let budget = max_tokens - SPECIAL_TOKEN_RESERVE;
        Ok(Self {
            counter,
            budget,
            overlap: clamp_overlap(budget, overlap),
            preserve_paragraphs: true,
            paragraphs: ParagraphSplitter::new()?,
        })
    }

    /// Load the vocabulary from `path`: `*.json` is read as a serialized
    /// tokenizer, anything else as a `vocab.txt`
    pub fn from_path<P: AsRef<Path>>(path: P, max_tokens: usize, overlap: usize) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(RagcapError::not_found("vocabulary", path.display().to_string()));
        }

        let counter = match crate::utils::get_file_extension(path).as_deref() {
            Some("json") => WordpieceCounter::from_tokenizer_file(path)?,
            _ => WordpieceCounter::from_vocab_file(path)?,
        };
        Self::new(counter, max_tokens, overlap)
    }

    pub fn with_paragraphs(mut self, preserve: bool) -> Self {
        self.preserve_paragraphs = preserve;
        self
    }

    /// Piece budget per chunk after reserving special tokens
    pub fn budget(&self) -> usize {
        self.budget
    }

    fn window(
        &self,
        source_id: i64,
        text: &str,
        cache: &mut HashMap<String, usize>,
    ) -> Result<Vec<ChunkDraft>> {
        let mut spans = Vec::new();
        let mut offset = 0;
        for word in text.split_whitespace() {
            // split_whitespace yields subslices, so the offset search always succeeds
            let start = offset + text[offset..].find(word).unwrap_or(0);
            let end = start + word.len();
            offset = end;

            let weight = match cache.get(word) {
                Some(&n) => n,
                None => {
                    let n = self.counter.count(word)?;
                    cache.insert(word.to_string(), n);
                    n
                }
            };
            spans.push(WeightedSpan { start, end, weight });
        }

        Ok(window_chunks(source_id, text, &spans, self.budget, self.overlap))
    }
}

impl Chunker for WordpieceChunker {
    fn chunk(&self, source_id: i64, text: &str) -> Result<Vec<ChunkDraft>> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let mut cache = HashMap::new();
        if !self.preserve_paragraphs {
            return self.window(source_id, text, &mut cache);
        }

        let mut chunks = Vec::new();
        for paragraph in self.paragraphs.split(text) {
            chunks.extend(self.window(source_id, paragraph, &mut cache)?);
        }
        Ok(chunks)
    }

    fn name(&self) -> &'static str {
        "wordpiece"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_counter() -> WordpieceCounter {
        let pieces = ["[UNK]", "[CLS]", "[SEP]", "hello", "world", "play", "##ing", "##s", "the"];
        let vocab = pieces
            .iter()
            .enumerate()
            .map(|(i, p)| (p.to_string(), i as u32))
            .collect();
        WordpieceCounter::from_vocab(vocab).unwrap()
    }

    #[test]
    fn test_piece_counts() {
        let counter = test_counter();
        assert_eq!(counter.count("hello").unwrap(), 1);
        assert_eq!(counter.count("Playing").unwrap(), 2);
        assert_eq!(counter.count("worlds").unwrap(), 2);
        assert_eq!(counter.count("xyzzy").unwrap(), 1);
        // Punctuation is split off by the pre-tokenizer
        assert_eq!(counter.count("hello,").unwrap(), 2);
    }

    #[test]
    fn test_vocab_without_unk_is_rejected() {
        let vocab = HashMap::from([("hello".to_string(), 0u32)]);
        assert!(WordpieceCounter::from_vocab(vocab).is_err());
    }

    #[test]
    fn test_budget_reserves_special_tokens() {
        let chunker = WordpieceChunker::new(test_counter(), 6, 10).unwrap();
        assert_eq!(chunker.budget(), 4);
        assert!(WordpieceChunker::new(test_counter(), 2, 0).is_err());
    }

    #[test]
    fn test_chunks_fit_piece_budget() {
        let chunker = WordpieceChunker::new(test_counter(), 6, 1)
            .unwrap()
            .with_paragraphs(false);
        // playing = 2 pieces, hello = 1, worlds = 2
        let chunks = chunker
            .chunk(3, "playing hello worlds the playing hello")
            .unwrap();

        assert!(chunks.iter().all(|c| c.token_count <= 4));
        assert_eq!(chunks[0].text, "playing hello");
        assert_eq!(chunks[0].token_count, 3);
        assert!(chunks.last().unwrap().text.ends_with("hello"));
    }

    #[test]
    fn test_advance_resums_pieces() {
        // budget 4, overlap 1: step is 3 pieces, so the window after
        // "playing hello" starts after both words (2 + 1 pieces)
        let chunker = WordpieceChunker::new(test_counter(), 6, 1)
            .unwrap()
            .with_paragraphs(false);
        let chunks = chunker.chunk(1, "playing hello worlds the").unwrap();

        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["playing hello", "worlds the"]);
    }

    #[test]
    fn test_missing_vocab_file() {
        let result = WordpieceChunker::from_path("/nonexistent/vocab.txt", 200, 50);
        assert!(matches!(result, Err(RagcapError::NotFound { .. })));
    }

    #[test]
    fn test_vocab_file_loading() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vocab.txt");
        std::fs::write(&path, "[UNK]\n[CLS]\n[SEP]\nhello\n##s\n").unwrap();

        let chunker = WordpieceChunker::from_path(&path, 10, 2).unwrap();
        let chunks = chunker.chunk(1, "hellos hello").unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].token_count, 3);
    }
}
