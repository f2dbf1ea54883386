//! Text-layer extraction with the all-or-nothing OCR fallback.

use std::path::Path;

use super::{ExtractionError, PageExtractor};

/// Share of pages that must carry a text layer before OCR is skipped.
const TEXT_PAGE_RATIO: f64 = 0.1;

/// Non-empty page text paired with its zero-based page index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedPage {
    /// Zero-based position of the page in the document.
    pub index: usize,
    /// Trimmed, non-empty page text.
    pub text: String,
}

/// Result of extracting one document.
#[derive(Debug, Clone, Default)]
pub struct ExtractedDocument {
    /// Pages that produced text, in page order.
    pub pages: Vec<ExtractedPage>,
    /// Number of pages reported by the text-layer pass.
    pub total_pages: usize,
    /// Whether the OCR pass replaced the text-layer result.
    pub ocr_used: bool,
}

/// Decide whether a document should be re-extracted through OCR.
///
/// OCR runs when fewer than 10% of pages (and at least one) produced text.
pub fn needs_ocr(text_pages: usize, total_pages: usize) -> bool {
    let threshold = (total_pages as f64 * TEXT_PAGE_RATIO).max(1.0);
    (text_pages as f64) < threshold
}

/// Extract a document's pages, replacing the text-layer result with OCR output when the text
/// layer is too sparse.
///
/// The fallback is per document: when it triggers every page is OCR'd and the text-layer result
/// is discarded. When it does not trigger no page is OCR'd, even pages that came back empty.
/// If the OCR pass itself fails the text-layer pages are kept.
pub fn extract_with_fallback(
    extractor: &dyn PageExtractor,
    path: &Path,
) -> Result<ExtractedDocument, ExtractionError> {
    let raw = extractor.extract_page_text(path)?;
    let total_pages = raw.len();
    let pages = keep_non_empty(raw);

    if !needs_ocr(pages.len(), total_pages) {
        return Ok(ExtractedDocument {
            pages,
            total_pages,
            ocr_used: false,
        });
    }

    tracing::debug!(
        path = %path.display(),
        text_pages = pages.len(),
        total_pages,
        "Text layer too sparse; re-extracting with OCR"
    );
    match extractor.ocr_page_text(path) {
        Ok(raw) => Ok(ExtractedDocument {
            pages: keep_non_empty(raw),
            total_pages,
            ocr_used: true,
        }),
        Err(error) => {
            tracing::warn!(
                path = %path.display(),
                error = %error,
                text_pages = pages.len(),
                "OCR unavailable; keeping text-layer pages"
            );
            Ok(ExtractedDocument {
                pages,
                total_pages,
                ocr_used: false,
            })
        }
    }
}

fn keep_non_empty(raw: Vec<String>) -> Vec<ExtractedPage> {
    raw.into_iter()
        .enumerate()
        .filter_map(|(index, text)| {
            let trimmed = text.trim();
            (!trimmed.is_empty()).then(|| ExtractedPage {
                index,
                text: trimmed.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        text: Vec<&'static str>,
        ocr: Vec<&'static str>,
        ocr_missing: bool,
        ocr_calls: AtomicUsize,
    }

    impl Scripted {
        fn new(text: Vec<&'static str>, ocr: Vec<&'static str>) -> Self {
            Self {
                text,
                ocr,
                ocr_missing: false,
                ocr_calls: AtomicUsize::new(0),
            }
        }
    }

    impl PageExtractor for Scripted {
        fn extract_page_text(&self, _path: &Path) -> Result<Vec<String>, ExtractionError> {
            Ok(self.text.iter().map(|page| page.to_string()).collect())
        }

        fn ocr_page_text(&self, _path: &Path) -> Result<Vec<String>, ExtractionError> {
            self.ocr_calls.fetch_add(1, Ordering::SeqCst);
            if self.ocr_missing {
                return Err(ExtractionError::Tool {
                    tool: "tesseract",
                    message: "No such file or directory".into(),
                });
            }
            Ok(self.ocr.iter().map(|page| page.to_string()).collect())
        }
    }

    #[test]
    fn threshold_has_a_floor_of_one_page() {
        assert!(needs_ocr(0, 0));
        assert!(needs_ocr(0, 3));
        assert!(!needs_ocr(1, 3));
        assert!(!needs_ocr(1, 10));
        assert!(needs_ocr(1, 11));
        assert!(!needs_ocr(2, 11));
    }

    #[test]
    fn keeps_text_layer_and_skips_empty_pages() {
        let extractor = Scripted::new(vec!["page one", "   ", "page three"], vec!["ocr"]);
        let document = extract_with_fallback(&extractor, Path::new("doc.pdf")).expect("extract");

        assert!(!document.ocr_used);
        assert_eq!(document.total_pages, 3);
        let indices: Vec<usize> = document.pages.iter().map(|page| page.index).collect();
        assert_eq!(indices, vec![0, 2]);
        assert_eq!(extractor.ocr_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn sparse_text_layer_is_replaced_by_ocr() {
        let mut text = vec![""; 20];
        text[4] = "lonely caption";
        let extractor = Scripted::new(text, vec!["scan a", "", "scan c"]);
        let document = extract_with_fallback(&extractor, Path::new("scan.pdf")).expect("extract");

        assert!(document.ocr_used);
        let texts: Vec<&str> = document.pages.iter().map(|page| page.text.as_str()).collect();
        assert_eq!(texts, vec!["scan a", "scan c"]);
        assert_eq!(document.pages[1].index, 2);
    }

    #[test]
    fn empty_ocr_result_yields_no_pages() {
        let extractor = Scripted::new(vec!["", ""], vec!["", " "]);
        let document = extract_with_fallback(&extractor, Path::new("blank.pdf")).expect("extract");
        assert!(document.ocr_used);
        assert!(document.pages.is_empty());
    }

    #[test]
    fn failed_ocr_keeps_sparse_text_layer() {
        let mut text = vec![""; 20];
        text[4] = "lonely caption";
        let extractor = Scripted {
            ocr_missing: true,
            ..Scripted::new(text, vec![])
        };
        let document = extract_with_fallback(&extractor, Path::new("scan.pdf")).expect("extract");

        assert!(!document.ocr_used);
        assert_eq!(document.total_pages, 20);
        assert_eq!(
            document.pages,
            vec![ExtractedPage {
                index: 4,
                text: "lonely caption".into(),
            }]
        );
        assert_eq!(extractor.ocr_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_ocr_on_textless_document_yields_no_pages() {
        let extractor = Scripted {
            ocr_missing: true,
            ..Scripted::new(vec!["", ""], vec![])
        };
        let document = extract_with_fallback(&extractor, Path::new("blank.pdf")).expect("extract");
        assert!(!document.ocr_used);
        assert!(document.pages.is_empty());
    }
}
