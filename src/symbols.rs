//! Detected cartographic symbols and their CSV artifact.
//!
//! The symbol detector reports, per frame of the thresholded plan, where
//! it saw point symbols and which class each one is. All detections for a
//! mutation are folded into one `symbols/{id}.csv` artifact so resumed
//! runs can skip detection entirely.
//!
//! Only "white" symbol classes (`white_circle`, `double_white_circle`)
//! are reliable anchors for matching: black dots are easily confused with
//! dirt specks and punched holes on century-old paper. A frame becomes a
//! matching candidate only when it carries enough usable symbols.

use serde::Deserialize;
use std::collections::BTreeMap;

/// Detections below this count per frame do not give the matcher enough
/// anchors to produce a trustworthy transform.
pub const MIN_USABLE_SYMBOLS: usize = 4;

/// One detected symbol, in rendered-image pixel coordinates.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SymbolDetection {
    /// 1-based frame index within the rendered TIFF.
    pub page: u32,
    pub x: f64,
    pub y: f64,
    pub symbol: String,
}

/// Whether a detected class is a usable matching anchor.
pub fn is_usable(symbol: &str) -> bool {
    symbol.contains("white")
}

/// Usable detections on one frame.
pub fn usable_count(detections: &[SymbolDetection], page: u32) -> usize {
    detections
        .iter()
        .filter(|d| d.page == page && is_usable(&d.symbol))
        .count()
}

/// Frames with at least `min_usable` usable detections, ascending.
pub fn candidate_frames(detections: &[SymbolDetection], min_usable: usize) -> Vec<u32> {
    let mut counts: BTreeMap<u32, usize> = BTreeMap::new();
    for d in detections {
        if is_usable(&d.symbol) {
            *counts.entry(d.page).or_insert(0) += 1;
        }
    }
    counts
        .into_iter()
        .filter(|(_, n)| *n >= min_usable)
        .map(|(page, _)| page)
        .collect()
}

/// All detections on one frame, in artifact order.
pub fn for_frame(detections: &[SymbolDetection], page: u32) -> Vec<&SymbolDetection> {
    detections.iter().filter(|d| d.page == page).collect()
}

fn sorted(detections: &[SymbolDetection]) -> Vec<&SymbolDetection> {
    let mut rows: Vec<&SymbolDetection> = detections.iter().collect();
    rows.sort_by(|a, b| {
        a.page
            .cmp(&b.page)
            .then(a.x.total_cmp(&b.x))
            .then(a.y.total_cmp(&b.y))
            .then(a.symbol.cmp(&b.symbol))
    });
    rows
}

/// Serialise the per-mutation symbols artifact (`page,x,y,symbol`).
/// Rows are sorted so the artifact is byte-stable across runs.
pub fn to_csv_bytes(detections: &[SymbolDetection]) -> Vec<u8> {
    let mut out = String::from("page,x,y,symbol\n");
    for d in sorted(detections) {
        out.push_str(&format!("{},{:.3},{:.3},{}\n", d.page, d.x, d.y, d.symbol));
    }
    out.into_bytes()
}

/// Serialise one frame's detections for the matching engine
/// (`x,y,symbol`, no frame column).
pub fn to_engine_csv_bytes(detections: &[&SymbolDetection]) -> Vec<u8> {
    let mut out = String::from("x,y,symbol\n");
    for d in detections {
        out.push_str(&format!("{:.3},{:.3},{}\n", d.x, d.y, d.symbol));
    }
    out.into_bytes()
}

/// Parse a symbols artifact back. The error is a human-readable detail
/// for the caller's corrupt-artifact handling.
pub fn from_csv_bytes(bytes: &[u8]) -> Result<Vec<SymbolDetection>, String> {
    let mut reader = csv::Reader::from_reader(bytes);
    let mut detections = Vec::new();
    for row in reader.deserialize() {
        let detection: SymbolDetection = row.map_err(|e| e.to_string())?;
        detections.push(detection);
    }
    Ok(detections)
}
