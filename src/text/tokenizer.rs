//! Word/punctuation tokenizer used for token budgets and backfills

use crate::error::{RagcapError, Result};
use regex::Regex;

/// A token and its byte span in the source text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token<'a> {
    pub text: &'a str,
    pub start: usize,
    pub end: usize,
}

/// Splits text into runs of word characters and single punctuation marks
#[derive(Debug, Clone)]
pub struct WordTokenizer {
    regex: Regex,
}

impl WordTokenizer {
    pub fn new() -> Result<Self> {
        let regex = Regex::new(r"\w+|[^\w\s]")
            .map_err(|e| RagcapError::TextProcessing(format!("Failed to compile token regex: {}", e)))?;
        Ok(Self { regex })
    }

    pub fn tokenize<'a>(&self, text: &'a str) -> Vec<Token<'a>> {
        self.regex
            .find_iter(text)
            .map(|m| Token {
                text: m.as_str(),
                start: m.start(),
                end: m.end(),
            })
            .collect()
    }

    pub fn count(&self, text: &str) -> usize {
        self.regex.find_iter(text).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_words_and_punctuation() {
        let tokenizer = WordTokenizer::new().unwrap();
        let tokens: Vec<&str> = tokenizer
            .tokenize("Hello, world! It's 42.")
            .iter()
            .map(|t| t.text)
            .collect();
        assert_eq!(tokens, vec!["Hello", ",", "world", "!", "It", "'", "s", "42", "."]);
    }

    #[test]
    fn test_spans_point_into_source() {
        let tokenizer = WordTokenizer::new().unwrap();
        let text = "  naïve   café ";
        for token in tokenizer.tokenize(text) {
            assert_eq!(&text[token.start..token.end], token.text);
        }
        assert_eq!(tokenizer.count(text), 2);
        assert_eq!(tokenizer.count("   \n\t"), 0);
    }
}
