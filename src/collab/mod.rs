//! External tools the pipeline drives.
//!
//! All heavy lifting happens in subprocesses: Poppler extracts text and
//! rasterises PDFs, libtiff assembles multi-frame TIFFs, and the cadaref
//! tools binarise plans, detect symbols, and compute the georeferencing
//! transform. Each concern sits behind a small async trait so the
//! orchestrator can be tested with in-process fakes and none of the
//! tools needs to be installed for the test suite.
//!
//! Subprocess failures never panic and never abort the run: they surface
//! as [`StageError`] values that the scheduler records against the one
//! mutation being processed.

mod detect;
mod georef;
mod render;
mod text;
mod threshold;

pub use detect::{CadarefClassify, SymbolDetector};
pub use georef::{CadarefMatch, GeorefEngine, MatchOutcome};
pub use render::{CairoRenderer, FrameSource, PageRenderer, SourcePage};
pub use text::{PdfToText, TextExtractor};
pub use threshold::{CadarefThreshold, Thresholder, THRESHOLD_DPI};

use std::process::Output;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

use crate::error::StageError;

/// The full set of tool seams, shared across worker tasks.
#[derive(Clone)]
pub struct Collaborators {
    pub text: Arc<dyn TextExtractor>,
    pub renderer: Arc<dyn PageRenderer>,
    pub thresholder: Arc<dyn Thresholder>,
    pub detector: Arc<dyn SymbolDetector>,
    pub engine: Arc<dyn GeorefEngine>,
}

impl Collaborators {
    /// The production wiring: every seam backed by its command-line tool.
    pub fn subprocess(match_timeout: Duration) -> Collaborators {
        Collaborators {
            text: Arc::new(PdfToText),
            renderer: Arc::new(CairoRenderer),
            thresholder: Arc::new(CadarefThreshold),
            detector: Arc::new(CadarefClassify),
            engine: Arc::new(CadarefMatch::new(match_timeout)),
        }
    }
}

/// Run a tool to completion, capturing output. Spawn failures and
/// non-zero exits become [`StageError`]s naming the tool.
pub(crate) async fn run_tool(
    tool: &'static str,
    command: &mut Command,
) -> Result<Output, StageError> {
    let output = command
        .output()
        .await
        .map_err(|e| StageError::Spawn {
            tool,
            detail: e.to_string(),
        })?;
    if !output.status.success() {
        return Err(StageError::ToolFailed {
            tool,
            // -1 when the process was killed by a signal.
            code: output.status.code().unwrap_or(-1),
            stderr: stderr_excerpt(&output.stderr),
        });
    }
    Ok(output)
}

/// The tail of a stderr stream, flattened for log lines. Tools can dump
/// pages of diagnostics; the end is where the actual error lives.
pub(crate) fn stderr_excerpt(stderr: &[u8]) -> String {
    const MAX: usize = 500;
    let text = String::from_utf8_lossy(stderr);
    let flat = text.trim().replace('\n', " | ");
    if flat.len() > MAX {
        let start = flat.len() - MAX;
        let boundary = flat
            .char_indices()
            .map(|(i, _)| i)
            .find(|&i| i >= start)
            .unwrap_or(start);
        format!("...{}", &flat[boundary..])
    } else {
        flat
    }
}
