//! Source validation and page splitting.
//!
//! A [`UnitSource`] turns a source document into an ordered list of unit
//! files that workers can read independently. [`PdfPageSource`] writes one
//! plain-text file per PDF page using lopdf's text extraction.

use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::ExtractError;

/// Splits a source document into independently processable units.
pub trait UnitSource: Send + Sync {
    /// Check that the source can be processed. Must not write anything.
    fn validate(&self, path: &Path) -> Result<(), ExtractError>;

    /// Write one file per unit and return their paths in unit order.
    fn split(&self, path: &Path, job_id: Uuid) -> Result<Vec<PathBuf>, ExtractError>;
}

/// Page splitter for PDF documents.
#[derive(Debug, Clone)]
pub struct PdfPageSource {
    pages_dir: PathBuf,
}

impl PdfPageSource {
    pub fn new(pages_dir: impl Into<PathBuf>) -> Self {
        Self {
            pages_dir: pages_dir.into(),
        }
    }

    /// Path of the text file for page `page_num` (1-based).
    pub fn page_path(&self, job_id: Uuid, page_num: u32) -> PathBuf {
        self.pages_dir
            .join(format!("{}_page_{:04}.txt", job_id, page_num))
    }

    fn check_file(path: &Path) -> Result<(), ExtractError> {
        if !path.exists() {
            return Err(ExtractError::NotFound(path.to_path_buf()));
        }
        if !path.is_file() {
            return Err(ExtractError::NotAFile(path.to_path_buf()));
        }
        let is_pdf = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));
        if !is_pdf {
            return Err(ExtractError::NotAPdf(path.to_path_buf()));
        }
        Ok(())
    }

    fn load(path: &Path) -> Result<lopdf::Document, ExtractError> {
        Self::check_file(path)?;
        let bytes = std::fs::read(path)?;
        let doc = lopdf::Document::load_mem(&bytes).map_err(|e| ExtractError::Corrupted {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        if doc.get_pages().is_empty() {
            return Err(ExtractError::NoPages(path.to_path_buf()));
        }
        Ok(doc)
    }
}

impl UnitSource for PdfPageSource {
    fn validate(&self, path: &Path) -> Result<(), ExtractError> {
        let doc = Self::load(path)?;
        tracing::debug!(
            source = %path.display(),
            pages = doc.get_pages().len(),
            "Validated PDF"
        );
        Ok(())
    }

    fn split(&self, path: &Path, job_id: Uuid) -> Result<Vec<PathBuf>, ExtractError> {
        let doc = Self::load(path)?;
        std::fs::create_dir_all(&self.pages_dir)?;

        // get_pages() is keyed by 1-based page number in a BTreeMap.
        let page_numbers: Vec<u32> = doc.get_pages().keys().copied().collect();
        let mut written = Vec::with_capacity(page_numbers.len());

        for page_num in page_numbers {
            let text = match doc.extract_text(&[page_num]) {
                Ok(text) => text,
                Err(e) => {
                    // Image-only pages still become units; the worker reports them as empty.
                    tracing::warn!(page = page_num, error = %e, "No extractable text on page");
                    String::new()
                }
            };
            let page_path = self.page_path(job_id, page_num);
            std::fs::write(&page_path, text)?;
            written.push(page_path);
        }

        tracing::info!(
            job_id = %job_id,
            source = %path.display(),
            pages = written.len(),
            "Split PDF into pages"
        );
        Ok(written)
    }
}
