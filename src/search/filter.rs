//! Include/exclude path filtering of search results

use crate::error::Result;
use crate::search::SearchResult;
use crate::utils::normalize_separators;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

/// Glob-based source path filter.
///
/// Patterns support `*`, `?` and `**` and match the whole `/`-separated
/// path, case-insensitively; `*` also crosses directory separators. Every
/// other character, brackets and braces included, matches itself. A path
/// is kept when it matches some include pattern (or there are none) and no
/// exclude pattern.
#[derive(Debug, Clone)]
pub struct PathFilter {
    include: Option<GlobSet>,
    exclude: Option<GlobSet>,
}

impl PathFilter {
    pub fn new<S: AsRef<str>>(include: &[S], exclude: &[S]) -> Result<Self> {
        Ok(Self {
            include: build_set(include)?,
            exclude: build_set(exclude)?,
        })
    }

    /// Build from `;`- or `,`-separated pattern lists, as given on the
    /// command line
    pub fn from_lists(include: Option<&str>, exclude: Option<&str>) -> Result<Self> {
        let include = split_patterns(include.unwrap_or_default());
        let exclude = split_patterns(exclude.unwrap_or_default());
        Self::new(include.as_slice(), exclude.as_slice())
    }

    /// Filter that keeps everything
    pub fn allow_all() -> Self {
        Self {
            include: None,
            exclude: None,
        }
    }

    /// Whether any pattern is configured
    pub fn is_active(&self) -> bool {
        self.include.is_some() || self.exclude.is_some()
    }

    pub fn matches(&self, path: &str) -> bool {
        let path = normalize_separators(path);
        if let Some(exclude) = &self.exclude {
            if exclude.is_match(&path) {
                return false;
            }
        }
        match &self.include {
            Some(include) => include.is_match(&path),
            None => true,
        }
    }

    /// Keep the results whose source path passes the filter, in order
    pub fn apply(&self, results: Vec<SearchResult>) -> Vec<SearchResult> {
        if !self.is_active() {
            return results;
        }
        results
            .into_iter()
            .filter(|r| self.matches(&r.source_path))
            .collect()
    }
}

/// Split a pattern list on `;` and `,`, trimming and dropping empty entries
pub fn split_patterns(patterns: &str) -> Vec<String> {
    patterns
        .split([';', ','])
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

/// Escape everything in `pattern` except the `*` and `?` wildcards
fn literal_glob(pattern: &str) -> String {
    let mut glob = String::with_capacity(pattern.len());
    let mut literal = String::new();
    for c in pattern.chars() {
        if c == '*' || c == '?' {
            glob.push_str(&globset::escape(&literal));
            literal.clear();
            glob.push(c);
        } else {
            literal.push(c);
        }
    }
    glob.push_str(&globset::escape(&literal));
    glob
}

fn build_set<S: AsRef<str>>(patterns: &[S]) -> Result<Option<GlobSet>> {
    let mut builder = GlobSetBuilder::new();
    let mut count = 0;
    for pattern in patterns {
        let pattern = normalize_separators(pattern.as_ref().trim());
        if pattern.is_empty() {
            continue;
        }
        let glob = GlobBuilder::new(&literal_glob(&pattern))
            .case_insensitive(true)
            .literal_separator(false)
            .backslash_escape(false)
            .build()?;
        builder.add(glob);
        count += 1;
    }

    if count == 0 {
        return Ok(None);
    }
    Ok(Some(builder.build()?))
}
