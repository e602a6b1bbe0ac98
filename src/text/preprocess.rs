//! Deterministic text normalization applied before chunking
//!
//! Line endings become `\n`, runs of horizontal whitespace collapse to one
//! space, trailing spaces are dropped and three or more newlines collapse to a
//! paragraph break. Fenced code is protected from all of that, HTML chrome is
//! stripped and tables are flattened to `header: value` rows.

use crate::config::PreprocessConfig;
use crate::error::{RagcapError, Result};
use crate::storage::SourceDocument;
use regex::{Captures, Regex};
use unicode_normalization::UnicodeNormalization;

const PLACEHOLDER_OPEN: char = '\u{E000}';
const PLACEHOLDER_CLOSE: char = '\u{E001}';

/// Text preprocessor
#[derive(Debug, Clone)]
pub struct Preprocessor {
    config: PreprocessConfig,
    markdown_code: Regex,
    html_code: Regex,
    placeholder: Regex,
    boilerplate: Vec<Regex>,
    html_table: Regex,
    html_header_cell: Regex,
    html_row: Regex,
    html_data_cell: Regex,
    markdown_separator: Regex,
    horizontal_space: Regex,
    trailing_space: Regex,
    blank_lines: Regex,
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern)
        .map_err(|e| RagcapError::TextProcessing(format!("Failed to compile regex {}: {}", pattern, e)))
}

impl Preprocessor {
    pub fn new(config: PreprocessConfig) -> Result<Self> {
        Ok(Self {
            config,
            markdown_code: compile(r"(?s)```.*?```")?,
            html_code: compile(r"(?is)<pre><code.*?>.*?</code></pre>")?,
            placeholder: compile("\u{E000}(\\d+)\u{E001}")?,
            boilerplate: vec![
                compile(r"(?is)<header.*?>.*?</header>")?,
                compile(r"(?is)<footer.*?>.*?</footer>")?,
                compile(r"(?is)<nav.*?>.*?</nav>")?,
            ],
            html_table: compile(r"(?is)<table.*?>(.*?)</table>")?,
            html_header_cell: compile(r"(?is)<th.*?>(.*?)</th>")?,
            html_row: compile(r"(?is)<tr.*?>(.*?)</tr>")?,
            html_data_cell: compile(r"(?is)<td.*?>(.*?)</td>")?,
            markdown_separator: compile(r"^\s*\|?\s*:?-{3,}:?\s*(\|\s*:?-{3,}:?\s*)*\|?\s*$")?,
            horizontal_space: compile(r"[ \t\x0C\x0B]+")?,
            trailing_space: compile(r"[ \t]+\n")?,
            blank_lines: compile(r"\n{3,}")?,
        })
    }

    /// Preprocessor with every step enabled
    pub fn with_default_config() -> Result<Self> {
        Self::new(PreprocessConfig::default())
    }

    /// Normalize the content of `document` according to its document type
    pub fn process(&self, document: &SourceDocument) -> String {
        let text: String = document.content.nfc().collect();
        if text.trim().is_empty() {
            return String::new();
        }

        let doc_type = document.document_type.as_str();
        let is_html = matches!(doc_type, "html" | "htm");
        let is_markdown = matches!(doc_type, "md" | "markdown");

        let mut code_blocks = Vec::new();
        let mut text = text;

        if self.config.preserve_code {
            if is_markdown {
                text = self.stash(&self.markdown_code, &text, &mut code_blocks);
            } else if is_html {
                text = self.stash(&self.html_code, &text, &mut code_blocks);
            }
        }

        if self.config.remove_boilerplate && is_html {
            for pattern in &self.boilerplate {
                text = pattern.replace_all(&text, "").into_owned();
            }
        }

        if self.config.flatten_tables {
            if is_html {
                text = self.flatten_html_tables(&text);
            } else if is_markdown {
                text = self.flatten_markdown_tables(&text);
            }
        }

        let text = text.replace("\r\n", "\n").replace('\r', "\n");
        let text = self.horizontal_space.replace_all(&text, " ");
        let text = self.trailing_space.replace_all(&text, "\n");
        let text = self.blank_lines.replace_all(&text, "\n\n");
        let text = text.trim();

        if code_blocks.is_empty() {
            return text.to_string();
        }

        self.placeholder
            .replace_all(text, |caps: &Captures| {
                caps[1]
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| code_blocks.get(i))
                    .cloned()
                    .unwrap_or_default()
            })
            .into_owned()
    }

    fn stash(&self, pattern: &Regex, text: &str, blocks: &mut Vec<String>) -> String {
        pattern
            .replace_all(text, |caps: &Captures| {
                blocks.push(caps[0].to_string());
                format!("{}{}{}", PLACEHOLDER_OPEN, blocks.len() - 1, PLACEHOLDER_CLOSE)
            })
            .into_owned()
    }

    fn flatten_html_tables(&self, text: &str) -> String {
        self.html_table
            .replace_all(text, |caps: &Captures| {
                let table = &caps[1];
                let headers: Vec<&str> = self
                    .html_header_cell
                    .captures_iter(table)
                    .filter_map(|c| c.get(1).map(|m| m.as_str().trim()))
                    .collect();

                let rows: Vec<String> = self
                    .html_row
                    .captures_iter(table)
                    .filter_map(|row| {
                        let cells: Vec<&str> = self
                            .html_data_cell
                            .captures_iter(row.get(1)?.as_str())
                            .filter_map(|c| c.get(1).map(|m| m.as_str().trim()))
                            .collect();
                        if cells.is_empty() {
                            None
                        } else {
                            Some(linearize_row(&headers, &cells))
                        }
                    })
                    .collect();

                rows.join("\n")
            })
            .into_owned()
    }

    fn flatten_markdown_tables(&self, text: &str) -> String {
        let mut lines: Vec<String> = Vec::new();
        let mut headers: Option<Vec<String>> = None;

        for line in text.split('\n') {
            let line_body = line.trim_end_matches('\r');

            if self.markdown_separator.is_match(line_body)
                && line_body.contains('|')
                && lines.last().is_some_and(|prev| prev.contains('|'))
            {
                let header_line = lines.pop().unwrap_or_default();
                headers = Some(split_pipe_row(&header_line));
                continue;
            }

            match &headers {
                Some(h) if line_body.contains('|') => {
                    let cells = split_pipe_row(line_body);
                    if cells.len() == h.len() {
                        let h: Vec<&str> = h.iter().map(String::as_str).collect();
                        let c: Vec<&str> = cells.iter().map(String::as_str).collect();
                        lines.push(linearize_row(&h, &c));
                    }
                }
                _ => {
                    headers = None;
                    lines.push(line.to_string());
                }
            }
        }

        lines.join("\n")
    }
}

fn split_pipe_row(line: &str) -> Vec<String> {
    line.split('|')
        .map(str::trim)
        .filter(|cell| !cell.is_empty())
        .map(str::to_string)
        .collect()
}

fn linearize_row(headers: &[&str], cells: &[&str]) -> String {
    headers
        .iter()
        .zip(cells)
        .map(|(h, c)| format!("{}: {}", h, c))
        .collect::<Vec<_>>()
        .join(", ")
}
