//! Embedded text extraction via Poppler's `pdftotext`.
//!
//! The scan centre ran OCR when digitising the dossiers, so most PDFs
//! carry an invisible text layer. `-layout` keeps the reading order close
//! to the printed arrangement, which matters for the scale designations
//! and parcel numbers the later stages mine out of this text.

use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;

use super::run_tool;
use crate::error::StageError;

#[async_trait]
pub trait TextExtractor: Send + Sync {
    /// Extract the text layer of one PDF, one string per page. Pages
    /// without any text come back as empty strings.
    async fn extract_pages(&self, pdf: &Path) -> Result<Vec<String>, StageError>;
}

pub struct PdfToText;

#[async_trait]
impl TextExtractor for PdfToText {
    async fn extract_pages(&self, pdf: &Path) -> Result<Vec<String>, StageError> {
        let mut command = Command::new("pdftotext");
        command.arg("-layout").arg(pdf).arg("-");
        let output = run_tool("pdftotext", &mut command).await?;
        let text = String::from_utf8_lossy(&output.stdout).into_owned();
        Ok(pages_from_stdout(&text))
    }
}

/// Split `pdftotext` output into pages. The tool terminates every page
/// with a form feed, including the last one, which must not become a
/// phantom empty page.
fn pages_from_stdout(stdout: &str) -> Vec<String> {
    let trimmed = stdout.strip_suffix('\u{c}').unwrap_or(stdout);
    trimmed.split('\u{c}').map(str::to_owned).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_form_feed_is_not_a_page() {
        let pages = pages_from_stdout("first page\x0csecond page\x0c");
        assert_eq!(pages, ["first page", "second page"]);
    }

    #[test]
    fn pages_without_text_stay_in_position() {
        let pages = pages_from_stdout("one\x0c\x0cthree\x0c");
        assert_eq!(pages, ["one", "", "three"]);
    }

    #[test]
    fn empty_output_is_a_single_empty_page() {
        assert_eq!(pages_from_stdout(""), [""]);
        assert_eq!(pages_from_stdout("\x0c"), [""]);
    }
}
