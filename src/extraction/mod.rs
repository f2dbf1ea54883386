//! Page-level text extraction for uploaded documents.
//!
//! [`PageExtractor`] is the capability the ingestion pipeline consumes: ordered per-page text
//! from the text layer, and ordered per-page text from rasterized pages run through OCR. The
//! default implementation shells out to poppler (`pdftotext`, `pdftoppm`) and `tesseract`.
//! Extraction is blocking and always runs on the worker pool.

mod policy;
mod poppler;

pub use policy::{ExtractedDocument, ExtractedPage, extract_with_fallback, needs_ocr};
pub use poppler::PopplerExtractor;

use std::path::Path;
use thiserror::Error;

/// Errors raised while extracting text from a single document.
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// An external tool exited unsuccessfully or could not be launched.
    #[error("{tool} failed: {message}")]
    Tool {
        /// Name of the executable.
        tool: &'static str,
        /// Diagnostic captured from the tool.
        message: String,
    },
    /// Filesystem access failed while preparing or reading extraction output.
    #[error("I/O error during extraction: {0}")]
    Io(#[from] std::io::Error),
}

/// Capability producing ordered per-page text for a stored document.
pub trait PageExtractor: Send + Sync {
    /// Extract the embedded text layer, one entry per page (entries may be empty).
    fn extract_page_text(&self, path: &Path) -> Result<Vec<String>, ExtractionError>;

    /// Rasterize every page and run OCR, one entry per page (entries may be empty).
    fn ocr_page_text(&self, path: &Path) -> Result<Vec<String>, ExtractionError>;
}
