//! Rasterisation and TIFF assembly via Poppler and libtiff.
//!
//! A mutation's PDF parts are rendered page by page with `pdftocairo`,
//! split pages are cropped in-process, and everything is merged into one
//! tiled, zip-compressed multi-frame TIFF with `tiffcp`. When the
//! dossier has a usable date it is stamped into every frame's DateTime
//! tag (306) first, so downstream GIS tooling sees when the plan was
//! drawn without consulting the pipeline's own artifacts.

use async_trait::async_trait;
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use tokio::process::Command;

use super::run_tool;
use crate::error::StageError;
use crate::page::FrameCrop;

/// One rendered source page, before any splitting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcePage {
    pub path: PathBuf,
    pub width_px: u32,
    pub height_px: u32,
}

/// What to put into one frame of the assembled TIFF.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSource {
    pub page: PathBuf,
    pub crop: FrameCrop,
}

#[async_trait]
pub trait PageRenderer: Send + Sync {
    /// Render every page of every part into single-page TIFFs under
    /// `scratch`, returning them in dossier order with their pixel
    /// dimensions.
    async fn render_parts(
        &self,
        parts: &[PathBuf],
        dpi: u32,
        scratch: &Path,
    ) -> Result<Vec<SourcePage>, StageError>;

    /// Assemble the planned frames into one multi-frame TIFF at
    /// `output`, cropping split halves and stamping `scan_date` into the
    /// DateTime tag of every frame.
    async fn assemble(
        &self,
        frames: &[FrameSource],
        scan_date: Option<NaiveDate>,
        scratch: &Path,
        output: &Path,
    ) -> Result<(), StageError>;
}

/// Rendered page files are named `S{part}-{page}.tif`; both numbers are
/// needed to keep dossier order when a mutation has several parts.
static PAGE_FILE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^S(\d+)-(\d+)\.tif$").unwrap());

fn parse_page_name(name: &str) -> Option<(u32, u32)> {
    let caps = PAGE_FILE_RE.captures(name)?;
    Some((caps[1].parse().ok()?, caps[2].parse().ok()?))
}

fn date_stamp(date: NaiveDate) -> String {
    format!("{} 00:00:00", date.format("%Y:%m:%d"))
}

async fn crop_half(source: PathBuf, crop: FrameCrop, dest: PathBuf) -> Result<(), StageError> {
    let dest_for_err = dest.clone();
    tokio::task::spawn_blocking(move || {
        let image = image::open(&source).map_err(|e| StageError::CorruptArtifact {
            path: source.clone(),
            detail: e.to_string(),
        })?;
        let (w, h) = (image.width(), image.height());
        let mid = w / 2;
        let half = match crop {
            FrameCrop::Left => image.crop_imm(0, 0, mid, h),
            FrameCrop::Right => image.crop_imm(mid, 0, w - mid, h),
            FrameCrop::Whole => image,
        };
        half.save(&dest).map_err(|e| StageError::CorruptArtifact {
            path: dest.clone(),
            detail: e.to_string(),
        })
    })
    .await
    .map_err(|e| StageError::CorruptArtifact {
        path: dest_for_err,
        detail: format!("crop task failed: {e}"),
    })?
}

pub struct CairoRenderer;

#[async_trait]
impl PageRenderer for CairoRenderer {
    async fn render_parts(
        &self,
        parts: &[PathBuf],
        dpi: u32,
        scratch: &Path,
    ) -> Result<Vec<SourcePage>, StageError> {
        for (part, pdf) in parts.iter().enumerate() {
            let prefix = scratch.join(format!("S{part}"));
            let mut command = Command::new("pdftocairo");
            command
                .arg("-tiff")
                .arg("-r")
                .arg(dpi.to_string())
                .arg(pdf)
                .arg(&prefix);
            run_tool("pdftocairo", &mut command).await?;
        }

        let mut listed: Vec<(u32, u32, PathBuf)> = Vec::new();
        let mut entries = tokio::fs::read_dir(scratch)
            .await
            .map_err(|e| StageError::io(scratch, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StageError::io(scratch, e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some((part, page)) = parse_page_name(&name) {
                listed.push((part, page, entry.path()));
            }
        }
        listed.sort_by_key(|(part, page, _)| (*part, *page));
        if listed.is_empty() {
            return Err(StageError::MalformedOutput {
                tool: "pdftocairo",
                detail: "no pages rendered".into(),
            });
        }

        let paths: Vec<PathBuf> = listed.into_iter().map(|(_, _, path)| path).collect();
        let probe = paths.clone();
        let dims = tokio::task::spawn_blocking(move || -> Result<Vec<(u32, u32)>, String> {
            probe
                .iter()
                .map(|p| image::image_dimensions(p).map_err(|e| format!("{}: {e}", p.display())))
                .collect()
        })
        .await
        .map_err(|e| StageError::MalformedOutput {
            tool: "pdftocairo",
            detail: e.to_string(),
        })?
        .map_err(|detail| StageError::MalformedOutput {
            tool: "pdftocairo",
            detail,
        })?;

        Ok(paths
            .into_iter()
            .zip(dims)
            .map(|(path, (width_px, height_px))| SourcePage {
                path,
                width_px,
                height_px,
            })
            .collect())
    }

    async fn assemble(
        &self,
        frames: &[FrameSource],
        scan_date: Option<NaiveDate>,
        scratch: &Path,
        output: &Path,
    ) -> Result<(), StageError> {
        let mut frame_files: Vec<PathBuf> = Vec::with_capacity(frames.len());
        for (n, frame) in frames.iter().enumerate() {
            match frame.crop {
                FrameCrop::Whole => frame_files.push(frame.page.clone()),
                crop => {
                    let dest = scratch.join(format!("frame-{}.tif", n + 1));
                    crop_half(frame.page.clone(), crop, dest.clone()).await?;
                    frame_files.push(dest);
                }
            }
        }

        if let Some(date) = scan_date {
            let stamp = date_stamp(date);
            for file in &frame_files {
                let mut command = Command::new("tiffset");
                command.arg("-s").arg("306").arg(&stamp).arg(file);
                run_tool("tiffset", &mut command).await?;
            }
        }

        let mut command = Command::new("tiffcp");
        command.args(["-m", "0", "-t", "-w", "512", "-l", "512", "-c", "zip"]);
        for file in &frame_files {
            command.arg(file);
        }
        command.arg(output);
        run_tool("tiffcp", &mut command).await?;
        Ok(())
    }
}
