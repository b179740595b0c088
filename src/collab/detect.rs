//! Point symbol detection via the `cadaref-classify` tool.
//!
//! The detector works on one frame of the binarised plan at a time and
//! reports every candidate point symbol it finds as `x,y,symbol` CSV on
//! stdout, in the binarised image's pixel grid. Those coordinates are
//! rescaled here into rendered-image pixels, which is the grid the
//! matching engine works in.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use tokio::process::Command;

use super::run_tool;
use crate::error::StageError;
use crate::symbols::SymbolDetection;

#[async_trait]
pub trait SymbolDetector: Send + Sync {
    /// Detect symbols on frame `page` of a thresholded TIFF. Detections
    /// come back in rendered-image pixels: raw coordinates multiplied by
    /// `coord_scale` (rendered dpi over thresholded dpi).
    async fn detect(
        &self,
        thresholded: &Path,
        page: u32,
        coord_scale: f64,
    ) -> Result<Vec<SymbolDetection>, StageError>;
}

pub struct CadarefClassify;

#[async_trait]
impl SymbolDetector for CadarefClassify {
    async fn detect(
        &self,
        thresholded: &Path,
        page: u32,
        coord_scale: f64,
    ) -> Result<Vec<SymbolDetection>, StageError> {
        let mut command = Command::new("cadaref-classify");
        command.arg("--page").arg(page.to_string()).arg(thresholded);
        let output = run_tool("cadaref-classify", &mut command).await?;
        parse_detections(&output.stdout, page, coord_scale).map_err(|detail| {
            StageError::MalformedOutput {
                tool: "cadaref-classify",
                detail,
            }
        })
    }
}

#[derive(Debug, Deserialize)]
struct DetectionRow {
    x: f64,
    y: f64,
    symbol: String,
}

fn parse_detections(
    stdout: &[u8],
    page: u32,
    coord_scale: f64,
) -> Result<Vec<SymbolDetection>, String> {
    let mut reader = csv::Reader::from_reader(stdout);
    let mut detections = Vec::new();
    for row in reader.deserialize() {
        let row: DetectionRow = row.map_err(|e| e.to_string())?;
        detections.push(SymbolDetection {
            page,
            x: row.x * coord_scale,
            y: row.y * coord_scale,
            symbol: row.symbol,
        });
    }
    Ok(detections)
}
