//! The georeferencing engine seam.
//!
//! `cadaref-match` solves the actual correspondence problem: given one
//! frame of the rendered plan, the symbols detected on it, and the
//! candidate survey points, it searches for a similarity transform that
//! lines them up at one of the offered map scales. On success it writes
//! a georeferenced copy of the frame to the output path and exits 0.
//!
//! "No match" is an expected answer, not a failure: the engine exits
//! non-zero, writes nothing, or (on pathological frames) runs away and
//! is killed at the deadline. All three count as [`MatchOutcome::NoMatch`]
//! and the orchestrator simply tries the next frame.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use super::stderr_excerpt;
use crate::error::StageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome {
    Matched,
    NoMatch,
}

#[async_trait]
pub trait GeorefEngine: Send + Sync {
    /// Try to georeference one frame. `Matched` means `output` now holds
    /// the georeferenced raster.
    async fn match_frame(
        &self,
        rendered: &Path,
        page: u32,
        scales: &[u32],
        symbols_csv: &Path,
        points_csv: &Path,
        output: &Path,
    ) -> Result<MatchOutcome, StageError>;
}

pub struct CadarefMatch {
    timeout: Duration,
}

impl CadarefMatch {
    pub fn new(timeout: Duration) -> CadarefMatch {
        CadarefMatch { timeout }
    }
}

fn scales_arg(scales: &[u32]) -> String {
    scales
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl GeorefEngine for CadarefMatch {
    async fn match_frame(
        &self,
        rendered: &Path,
        page: u32,
        scales: &[u32],
        symbols_csv: &Path,
        points_csv: &Path,
        output: &Path,
    ) -> Result<MatchOutcome, StageError> {
        debug_assert!(!scales.is_empty());
        let mut command = Command::new("cadaref-match");
        command
            .arg("--points")
            .arg(points_csv)
            .arg("--symbols")
            .arg(symbols_csv)
            .arg("--page")
            .arg(page.to_string())
            .arg("--scales")
            .arg(scales_arg(scales))
            .arg(rendered)
            .arg("--output")
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|e| StageError::Spawn {
            tool: "cadaref-match",
            detail: e.to_string(),
        })?;

        // Dropping the wait future on timeout kills the child.
        let result = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| StageError::Spawn {
                tool: "cadaref-match",
                detail: format!("wait failed: {e}"),
            })?,
            Err(_) => {
                warn!(
                    page,
                    secs = self.timeout.as_secs(),
                    "matching timed out, counting as no match"
                );
                return Ok(MatchOutcome::NoMatch);
            }
        };

        if !result.status.success() {
            debug!(
                page,
                code = ?result.status.code(),
                stderr = %stderr_excerpt(&result.stderr),
                "engine found no match"
            );
            return Ok(MatchOutcome::NoMatch);
        }
        match tokio::fs::try_exists(output).await {
            Ok(true) => Ok(MatchOutcome::Matched),
            Ok(false) => {
                debug!(page, "engine exited cleanly but wrote no output");
                Ok(MatchOutcome::NoMatch)
            }
            Err(e) => Err(StageError::io(output, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scales_join_without_spaces() {
        assert_eq!(scales_arg(&[500]), "500");
        assert_eq!(scales_arg(&[200, 500]), "200,500");
        assert_eq!(scales_arg(&[1000, 200, 500]), "1000,200,500");
    }
}
