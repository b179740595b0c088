//! Page metadata: geometry, paper-format detection, and the planning step
//! that turns rendered source pages into raster frames.
//!
//! Dossiers mix single A4 sheets with wider sheets produced by gluing a plan
//! page and its measurement table side-by-side into one scan, plus the
//! occasional GIS-viewer screenshot filed along with the plans. Three
//! page-level judgements feed the pipeline:
//!
//! * **DIN format** — from pixel size and DPI, with 5 % tolerance.
//! * **Split decision** — sheets whose text mentions a measurement table and
//!   whose format is not A4 are cut into left/right halves, one map per
//!   half. An A4 sheet is never split into A5 halves.
//! * **Screenshot flag** — screenshots never georeference; they are excluded
//!   from the candidate frames (their text still feeds scale resolution).
//!
//! The split decision produces the **frame plan**: source page `k` becomes
//! one frame, or two when split. Frames are numbered 1-based in plan order
//! and become the pages of the assembled rasters; every downstream artifact
//! (symbols, engine invocations) refers to frames. Because OCR ran before
//! any splitting, each frame records which text page it came from.

use serde::{Deserialize, Serialize};

/// Form feed; page separator in extracted dossier text.
pub const PAGE_SEPARATOR: char = '\u{c}';

/// Text markers of a GIS-viewer screenshot.
const SCREENSHOT_MARKERS: [&str; 2] = ["User:", " VAZ-LB "];

/// Text markers of a measurement table glued next to a plan.
const TABLE_MARKERS: [&str; 4] = ["Tabelle", "tabelle", "sind übertragen", "Quadrat"];

pub(crate) const CM_PER_INCH: f64 = 2.54;

/// DIN paper sizes the archive contains, `R` meaning rotated (landscape).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DinFormat {
    A4,
    A4R,
    A3,
    A3R,
}

impl DinFormat {
    /// Detect the format of a page from its pixel size and resolution.
    ///
    /// Matches the physical size against A4 (21.0 × 29.7 cm) and
    /// A3 (29.7 × 42.0 cm) within ± 5 %; anything else is `None`
    /// (odd trims and fold-outs are common in older dossiers).
    pub fn detect(width_px: u32, height_px: u32, dpi: u32) -> Option<DinFormat> {
        let w_cm = width_px as f64 / dpi as f64 * CM_PER_INCH;
        let h_cm = height_px as f64 / dpi as f64 * CM_PER_INCH;
        let close = |got: f64, want: f64| (got - want).abs() <= want * 0.05;
        let candidates = [
            (DinFormat::A4, DinFormat::A4R, 21.0, 29.7),
            (DinFormat::A3, DinFormat::A3R, 29.7, 42.0),
        ];
        for (portrait, rotated, fw, fh) in candidates {
            if close(w_cm, fw) && close(h_cm, fh) {
                return Some(portrait);
            }
            if close(w_cm, fh) && close(h_cm, fw) {
                return Some(rotated);
            }
        }
        None
    }
}

/// Pixel geometry of one rendered source page, as probed after rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceGeometry {
    pub width_px: u32,
    pub height_px: u32,
    pub dpi: u32,
}

/// Which part of a source page a frame shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameCrop {
    Whole,
    /// Columns `0..w/2` of the source page.
    Left,
    /// Columns `w/2..w` of the source page.
    Right,
}

/// One frame of the assembled rasters, as persisted in the sidecar.
///
/// `index` is the 1-based frame number in the rendered (and thresholded)
/// raster. `text_index` is the 1-based page number in the text artifact;
/// split halves share their parent's text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageInfo {
    pub index: u32,
    pub text_index: u32,
    pub width_px: u32,
    pub height_px: u32,
    pub dpi: u32,
    pub split: bool,
}

impl PageInfo {
    pub fn din_format(&self) -> Option<DinFormat> {
        DinFormat::detect(self.width_px, self.height_px, self.dpi)
    }
}

/// One step of the frame plan: which source page, which part of it, and the
/// geometry of the resulting frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramePlan {
    /// Index into the source-page list handed to [`plan_frames`].
    pub source: usize,
    pub crop: FrameCrop,
    pub info: PageInfo,
}

/// Split the text artifact back into per-page texts.
///
/// Text page `n` (1-based) is element `n - 1`.
pub fn split_page_texts(text: &str) -> Vec<&str> {
    text.split(PAGE_SEPARATOR).collect()
}

/// Text belonging to `frame`, empty if the dossier has none for it.
pub fn text_for<'a>(texts: &[&'a str], frame: &PageInfo) -> &'a str {
    texts
        .get(frame.text_index as usize - 1)
        .copied()
        .unwrap_or("")
}

/// Whether this page is a GIS-viewer screenshot.
pub fn is_screenshot(text: &str) -> bool {
    SCREENSHOT_MARKERS.iter().any(|m| text.contains(m))
}

/// Whether a source page should be cut into left/right halves.
///
/// Splitting was tried with layout analysis and punch-hole detection first;
/// plain text markers for the glued-on measurement table work better.
pub fn should_split(geometry: SourceGeometry, text: &str) -> bool {
    if !TABLE_MARKERS.iter().any(|m| text.contains(m)) {
        return false;
    }
    !matches!(
        DinFormat::detect(geometry.width_px, geometry.height_px, geometry.dpi),
        Some(DinFormat::A4) | Some(DinFormat::A4R)
    )
}

/// Apply the split decision to the rendered source pages.
///
/// `texts[k]` is the text of source page `k + 1`; pages that split become a
/// left and a right frame (the left half takes columns `0..w/2`). Order is
/// preserved, so the plan is deterministic for a given render and text.
pub fn plan_frames(sources: &[SourceGeometry], texts: &[&str]) -> Vec<FramePlan> {
    let mut plan = Vec::with_capacity(sources.len());
    for (k, geometry) in sources.iter().enumerate() {
        let text = texts.get(k).copied().unwrap_or("");
        let text_index = k as u32 + 1;
        if should_split(*geometry, text) {
            let mid = geometry.width_px / 2;
            for (crop, width) in [
                (FrameCrop::Left, mid),
                (FrameCrop::Right, geometry.width_px - mid),
            ] {
                plan.push(FramePlan {
                    source: k,
                    crop,
                    info: PageInfo {
                        index: plan.len() as u32 + 1,
                        text_index,
                        width_px: width,
                        height_px: geometry.height_px,
                        dpi: geometry.dpi,
                        split: true,
                    },
                });
            }
        } else {
            plan.push(FramePlan {
                source: k,
                crop: FrameCrop::Whole,
                info: PageInfo {
                    index: plan.len() as u32 + 1,
                    text_index,
                    width_px: geometry.width_px,
                    height_px: geometry.height_px,
                    dpi: geometry.dpi,
                    split: false,
                },
            });
        }
    }
    plan
}
