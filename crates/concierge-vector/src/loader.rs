//! Document loading from disk.
//!
//! `.pdf` files are extracted page by page, one section per page, so their
//! chunks carry `page N` references. `.txt` and `.md` files are read as
//! text; form feeds in them separate pages the same way.

use std::path::{Path, PathBuf};

use tracing::debug;

use concierge_core::types::Document;

use crate::error::VectorError;
use crate::index::is_reserved_id_char;

const SUPPORTED_EXTENSIONS: &[&str] = &["pdf", "txt", "md"];
const PAGE_BREAK: char = '\u{000C}';

/// Load one file.
///
/// The document id is the file name with whitespace, brackets and commas
/// replaced by `-`.
pub fn load_document(path: &Path) -> Result<Document, VectorError> {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            VectorError::InvalidDocument(format!("unusable file name: {}", path.display()))
        })?;
    let id = document_id(name);

    let document = if extension(path).as_deref() == Some("pdf") {
        Document::from_pages(id, extract_pdf_pages(path)?)
    } else {
        let text = std::fs::read_to_string(path).map_err(|e| {
            VectorError::InvalidDocument(format!("failed to read {}: {}", path.display(), e))
        })?;
        if text.contains(PAGE_BREAK) {
            Document::from_pages(id, text.split(PAGE_BREAK))
        } else {
            Document::new(id, text)
        }
    };
    Ok(document.with_source(path.display().to_string()))
}

/// Text of every page of a PDF, in page order.
fn extract_pdf_pages(path: &Path) -> Result<Vec<String>, VectorError> {
    let bytes = std::fs::read(path).map_err(|e| {
        VectorError::InvalidDocument(format!("failed to read {}: {}", path.display(), e))
    })?;
    let pages = pdf_extract::extract_text_from_mem_by_pages(&bytes).map_err(|e| {
        VectorError::InvalidDocument(format!(
            "PDF extraction failed for {}: {}",
            path.display(),
            e
        ))
    })?;
    debug!(path = %path.display(), pages = pages.len(), "Extracted PDF");
    Ok(pages)
}

/// Map a file name to a usable document id.
pub fn document_id(file_name: &str) -> String {
    file_name
        .trim()
        .chars()
        .map(|c| if is_reserved_id_char(c) { '-' } else { c })
        .collect()
}

/// Load a file, or every supported file directly inside a directory.
///
/// Fails on the first file that cannot be loaded.
pub fn load_path(path: &Path) -> Result<Vec<Document>, VectorError> {
    list_documents(path)?
        .iter()
        .map(|file| load_document(file))
        .collect()
}

/// The files [`load_path`] would load: `path` itself, or the supported
/// files directly inside it sorted by path. Subdirectories are skipped.
pub fn list_documents(path: &Path) -> Result<Vec<PathBuf>, VectorError> {
    if !path.is_dir() {
        return Ok(vec![path.to_path_buf()]);
    }

    let entries = std::fs::read_dir(path).map_err(|e| {
        VectorError::InvalidDocument(format!("failed to list {}: {}", path.display(), e))
    })?;

    let mut files: Vec<PathBuf> = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| {
            VectorError::InvalidDocument(format!("failed to list {}: {}", path.display(), e))
        })?;
        let file = entry.path();
        if file.is_file() && is_supported(&file) {
            files.push(file);
        }
    }
    files.sort();

    debug!(dir = %path.display(), files = files.len(), "Listed documents");
    Ok(files)
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
}

fn is_supported(path: &Path) -> bool {
    extension(path).is_some_and(|ext| SUPPORTED_EXTENSIONS.contains(&ext.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("geo.txt");
        std::fs::write(&path, "The capital of France is Paris.").unwrap();

        let doc = load_document(&path).unwrap();
        assert_eq!(doc.id, "geo.txt");
        assert_eq!(doc.sections.len(), 1);
        assert!(doc.source.unwrap().ends_with("geo.txt"));
    }

    #[test]
    fn test_file_name_becomes_usable_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("my notes [draft], v2.txt");
        std::fs::write(&path, "The capital of France is Paris.").unwrap();

        let doc = load_document(&path).unwrap();
        assert_eq!(doc.id, "my-notes--draft---v2.txt");
        assert_eq!(document_id("  plain.md "), "plain.md");
    }

    #[test]
    fn test_unreadable_pdf_is_invalid_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.pdf");
        std::fs::write(&path, b"not a pdf at all").unwrap();

        let err = load_document(&path).unwrap_err();
        assert!(matches!(err, VectorError::InvalidDocument(ref msg) if msg.contains("PDF")));
    }

    #[test]
    fn test_form_feed_splits_pages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.txt");
        std::fs::write(&path, "first page\u{000C}second page").unwrap();

        let doc = load_document(&path).unwrap();
        assert_eq!(doc.sections.len(), 2);
        assert_eq!(doc.sections[1].reference.as_deref(), Some("page 2"));
        assert_eq!(doc.sections[1].text, "second page");
    }

    #[test]
    fn test_load_directory_one_level() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.md"), "# B").unwrap();
        std::fs::write(dir.path().join("a.txt"), "A").unwrap();
        std::fs::write(dir.path().join("image.png"), [0u8, 1, 2]).unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested").join("c.txt"), "C").unwrap();

        let docs = load_path(dir.path()).unwrap();
        let ids: Vec<&str> = docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["a.txt", "b.md"]);
    }

    #[test]
    fn test_missing_file() {
        let result = load_path(Path::new("/nonexistent/notes.txt"));
        assert!(matches!(result, Err(VectorError::InvalidDocument(_))));
    }
}
