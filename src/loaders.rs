//! File loaders
//!
//! A loader turns a file on disk into raw text. The registry picks a loader
//! by file extension.

use crate::error::{RagcapError, Result};
use crate::utils::get_file_extension;
use std::path::Path;

/// Reads a file into text
pub trait FileLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<String>;

    /// Lowercase extensions handled by this loader, without the dot
    fn extensions(&self) -> &[&'static str];
}

/// Plain text and markdown files, read as UTF-8 (invalid sequences replaced)
#[derive(Debug, Default, Clone, Copy)]
pub struct TextFileLoader;

impl FileLoader for TextFileLoader {
    fn load(&self, path: &Path) -> Result<String> {
        let bytes = std::fs::read(path)?;
        let text = match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(e) => {
                log::warn!("{} is not valid UTF-8, replacing invalid bytes", path.display());
                String::from_utf8_lossy(e.as_bytes()).into_owned()
            }
        };
        Ok(text.strip_prefix('\u{feff}').map(str::to_string).unwrap_or(text))
    }

    fn extensions(&self) -> &[&'static str] {
        &["txt", "md", "markdown"]
    }
}

/// Loaders keyed by extension
pub struct LoaderRegistry {
    loaders: Vec<Box<dyn FileLoader>>,
}

impl Default for LoaderRegistry {
    fn default() -> Self {
        Self {
            loaders: vec![Box::new(TextFileLoader)],
        }
    }
}

impl LoaderRegistry {
    /// Registry without any loader
    pub fn empty() -> Self {
        Self { loaders: Vec::new() }
    }

    /// Register a loader; later registrations win for shared extensions
    pub fn register(&mut self, loader: Box<dyn FileLoader>) {
        self.loaders.insert(0, loader);
    }

    /// Loader for `path`, or `UnsupportedFileType`
    pub fn loader_for(&self, path: &Path) -> Result<&dyn FileLoader> {
        let extension = get_file_extension(path).unwrap_or_default();
        self.loaders
            .iter()
            .find(|loader| loader.extensions().contains(&extension.as_str()))
            .map(|loader| loader.as_ref())
            .ok_or_else(|| RagcapError::UnsupportedFileType(path.display().to_string()))
    }

    pub fn supports(&self, path: &Path) -> bool {
        self.loader_for(path).is_ok()
    }

    /// Load `path` with the matching loader
    pub fn load(&self, path: &Path) -> Result<String> {
        self.loader_for(path)?.load(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_loader_reads_markdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Notes.MD");
        std::fs::write(&path, "\u{feff}# Title\nbody").unwrap();

        let registry = LoaderRegistry::default();
        assert_eq!(registry.load(&path).unwrap(), "# Title\nbody");
    }

    #[test]
    fn test_unknown_extension_is_unsupported() {
        let registry = LoaderRegistry::default();
        let result = registry.loader_for(Path::new("slides.pptx"));
        assert!(matches!(result, Err(RagcapError::UnsupportedFileType(_))));
        assert!(!registry.supports(Path::new("README")));
    }

    struct CsvLoader;

    impl FileLoader for CsvLoader {
        fn load(&self, _path: &Path) -> Result<String> {
            Ok("csv".to_string())
        }

        fn extensions(&self) -> &[&'static str] {
            &["csv"]
        }
    }

    #[test]
    fn test_register_custom_loader() {
        let mut registry = LoaderRegistry::empty();
        assert!(!registry.supports(Path::new("a.txt")));
        registry.register(Box::new(CsvLoader));
        assert_eq!(registry.load(Path::new("table.csv")).unwrap(), "csv");
    }
}
