//! Plan binarisation via the `cadaref-threshold` tool.
//!
//! Symbol detection wants clean black-and-white line work, not grey
//! scans of yellowed paper. The tool converts every frame of a rendered
//! TIFF to bilevel at 600 dpi with Group 4 compression, using one
//! threshold per frame.
//!
//! Measurement and binarisation are separate calls: the tool reports the
//! Otsu threshold it would pick per frame, and the orchestrator may
//! override values before binarising. On very faded plans the global
//! histogram fools Otsu into a threshold that erases half the line work,
//! and that correction is pipeline policy, not tool policy.

use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;

use super::run_tool;
use crate::error::StageError;

/// Resolution of binarised output. Doubling the rendered resolution
/// keeps thin lines connected after thresholding; detected symbol
/// coordinates are scaled back down by the caller.
pub const THRESHOLD_DPI: u32 = 600;

#[async_trait]
pub trait Thresholder: Send + Sync {
    /// Otsu threshold per frame of the rendered TIFF, in frame order.
    async fn measure(&self, rendered: &Path) -> Result<Vec<u8>, StageError>;

    /// Binarise the rendered TIFF into `output`, applying one threshold
    /// per frame. `thresholds` must cover every frame.
    async fn binarize(
        &self,
        rendered: &Path,
        thresholds: &[u8],
        output: &Path,
    ) -> Result<(), StageError>;
}

pub struct CadarefThreshold;

#[async_trait]
impl Thresholder for CadarefThreshold {
    async fn measure(&self, rendered: &Path) -> Result<Vec<u8>, StageError> {
        let mut command = Command::new("cadaref-threshold");
        command.arg("measure").arg(rendered);
        let output = run_tool("cadaref-threshold", &mut command).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_measurements(&stdout).map_err(|detail| StageError::MalformedOutput {
            tool: "cadaref-threshold",
            detail,
        })
    }

    async fn binarize(
        &self,
        rendered: &Path,
        thresholds: &[u8],
        output: &Path,
    ) -> Result<(), StageError> {
        let mut command = Command::new("cadaref-threshold");
        command
            .arg("binarize")
            .arg("--dpi")
            .arg(THRESHOLD_DPI.to_string())
            .arg("--thresholds")
            .arg(thresholds_arg(thresholds))
            .arg(rendered)
            .arg(output);
        run_tool("cadaref-threshold", &mut command).await?;
        Ok(())
    }
}

/// One decimal Otsu value per line, frame order.
fn parse_measurements(stdout: &str) -> Result<Vec<u8>, String> {
    let mut values = Vec::new();
    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let value: u8 = line
            .parse()
            .map_err(|_| format!("unexpected threshold line {line:?}"))?;
        values.push(value);
    }
    if values.is_empty() {
        return Err("no thresholds reported".into());
    }
    Ok(values)
}

fn thresholds_arg(thresholds: &[u8]) -> String {
    thresholds
        .iter()
        .map(u8::to_string)
        .collect::<Vec<_>>()
        .join(",")
}
