//! Poppler + tesseract backed [`PageExtractor`].

use std::path::{Path, PathBuf};
use std::process::Command;

use super::{ExtractionError, PageExtractor};

/// Page separator emitted by `pdftotext` after every page.
const PAGE_BREAK: char = '\u{000C}';

/// Extractor that shells out to `pdftotext`, `pdftoppm`, and `tesseract`.
#[derive(Debug, Clone)]
pub struct PopplerExtractor {
    render_dpi: u32,
}

impl PopplerExtractor {
    /// Build an extractor that rasterizes pages at `render_dpi` before OCR.
    pub fn new(render_dpi: u32) -> Self {
        Self {
            render_dpi: render_dpi.max(72),
        }
    }
}

impl PageExtractor for PopplerExtractor {
    fn extract_page_text(&self, path: &Path) -> Result<Vec<String>, ExtractionError> {
        let stdout = run_tool(
            "pdftotext",
            Command::new("pdftotext")
                .arg("-layout")
                .arg("-enc")
                .arg("UTF-8")
                .arg(path)
                .arg("-"),
        )?;
        let pages = split_pages(&String::from_utf8_lossy(&stdout));
        tracing::debug!(path = %path.display(), pages = pages.len(), "Extracted text layer");
        Ok(pages)
    }

    fn ocr_page_text(&self, path: &Path) -> Result<Vec<String>, ExtractionError> {
        let scratch = tempfile::tempdir()?;
        let prefix = scratch.path().join("page");
        run_tool(
            "pdftoppm",
            Command::new("pdftoppm")
                .arg("-r")
                .arg(self.render_dpi.to_string())
                .arg("-png")
                .arg(path)
                .arg(&prefix),
        )?;

        let images = rendered_pages(scratch.path())?;
        let mut pages = Vec::with_capacity(images.len());
        for image in images {
            let stdout = run_tool(
                "tesseract",
                Command::new("tesseract").arg(&image).arg("stdout"),
            )?;
            pages.push(String::from_utf8_lossy(&stdout).into_owned());
        }
        tracing::debug!(path = %path.display(), pages = pages.len(), "OCR pass complete");
        Ok(pages)
    }
}

/// Split `pdftotext` output into pages, dropping the empty tail after the final page break.
pub(crate) fn split_pages(output: &str) -> Vec<String> {
    if output.is_empty() {
        return Vec::new();
    }
    let mut pages: Vec<String> = output.split(PAGE_BREAK).map(str::to_string).collect();
    if output.ends_with(PAGE_BREAK) {
        pages.pop();
    }
    pages
}

/// Collect rendered page images in page order.
///
/// `pdftoppm` zero-pads page numbers to a common width, so lexical order is page order.
fn rendered_pages(dir: &Path) -> Result<Vec<PathBuf>, ExtractionError> {
    let mut images: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "png"))
        .collect();
    images.sort();
    Ok(images)
}

fn run_tool(tool: &'static str, command: &mut Command) -> Result<Vec<u8>, ExtractionError> {
    let output = command.output().map_err(|error| ExtractionError::Tool {
        tool,
        message: format!("could not launch ({error}); is it installed?"),
    })?;
    if !output.status.success() {
        return Err(ExtractionError::Tool {
            tool,
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output.stdout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_pages_keeps_empty_middle_pages() {
        let output = "first\u{000C}\u{000C}third\u{000C}";
        assert_eq!(split_pages(output), vec!["first", "", "third"]);
    }

    #[test]
    fn split_pages_handles_missing_trailing_break() {
        assert_eq!(split_pages("only page"), vec!["only page"]);
        assert!(split_pages("").is_empty());
    }

    #[test]
    fn rendered_pages_sorts_png_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        for name in ["page-10.png", "page-02.png", "page-01.png", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"").expect("write");
        }
        let names: Vec<String> = rendered_pages(dir.path())
            .expect("pages")
            .iter()
            .filter_map(|path| path.file_name().map(|name| name.to_string_lossy().into_owned()))
            .collect();
        assert_eq!(names, vec!["page-01.png", "page-02.png", "page-10.png"]);
    }
}
