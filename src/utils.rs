//! Utility functions for ragcap
//!
//! This module provides common utility functions used throughout the project.

use sha2::{Digest, Sha256};
use std::path::Path;

/// Get file extension from path, lowercased and without the dot
pub fn get_file_extension<P: AsRef<Path>>(path: P) -> Option<String> {
    path.as_ref()
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_lowercase())
}

/// Whether any component of the path starts with a dot
pub fn is_hidden<P: AsRef<Path>>(path: P) -> bool {
    path.as_ref().components().any(|component| {
        component
            .as_os_str()
            .to_str()
            .is_some_and(|name| name.starts_with('.') && name != "." && name != "..")
    })
}

/// SHA-256 digest as lowercase hex
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Replace backslashes with forward slashes
pub fn normalize_separators(path: &str) -> String {
    path.replace('\\', "/")
}

/// Path of `path` relative to `root`, `/`-separated. Falls back to the full
/// path when `path` is not under `root`.
pub fn relative_path<P: AsRef<Path>, R: AsRef<Path>>(path: P, root: R) -> String {
    let path = path.as_ref();
    let relative = path.strip_prefix(root.as_ref()).unwrap_or(path);
    normalize_separators(&relative.to_string_lossy())
}

/// Format file size in human readable format
pub fn format_file_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    const THRESHOLD: f64 = 1024.0;

    if bytes == 0 {
        return "0 B".to_string();
    }

    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= THRESHOLD && unit_index < UNITS.len() - 1 {
        size /= THRESHOLD;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}

/// Shorten text for display, appending an ellipsis when cut
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_extension() {
        assert_eq!(get_file_extension("test.MD"), Some("md".to_string()));
        assert_eq!(get_file_extension("test"), None);
        assert_eq!(get_file_extension("test.tar.gz"), Some("gz".to_string()));
    }

    #[test]
    fn test_hidden_paths() {
        assert!(is_hidden(".git/config"));
        assert!(is_hidden("docs/.draft.md"));
        assert!(!is_hidden("docs/guide.md"));
        assert!(!is_hidden("./docs/guide.md"));
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_relative_path() {
        assert_eq!(relative_path("/data/docs/a.txt", "/data"), "docs/a.txt");
        assert_eq!(relative_path("/other/a.txt", "/data"), "/other/a.txt");
        assert_eq!(normalize_separators("docs\\a.txt"), "docs/a.txt");
    }

    #[test]
    fn test_file_size_formatting() {
        assert_eq!(format_file_size(0), "0 B");
        assert_eq!(format_file_size(512), "512 B");
        assert_eq!(format_file_size(1536), "1.5 KB");
        assert_eq!(format_file_size(1048576), "1.0 MB");
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("short", 10), "short");
        assert_eq!(truncate_chars("héllo world", 5), "héllo...");
    }
}
