//! Map-scale resolution and the distance-limit calculation built on it.
//!
//! Mutation plans carry a printed scale designation (`1:500` and friends),
//! but OCR misses it often enough that a fallback chain is required:
//!
//! 1. the page's own text;
//! 2. sibling pages of the same mutation, in page order (plans and tables of
//!    one dossier share a scale far more often than not);
//! 3. an ordered list of historically common scales.
//!
//! The chain is explicit in [`ResolvedScale`] so downstream consumers can
//! see *how* a scale was obtained and, for fallbacks, try each candidate.
//! From a resolved scale and the page geometry, [`distance_limit_m`] bounds
//! the real-world distance any two marks on the page can be apart; the
//! bounds estimator grows search windows to at least that size.
//!
//! ## Why a list, not a single fallback?
//!
//! A wrongly assumed scale makes the matching engine reject every candidate
//! transform, so guessing one scale would silently lose dossiers that a
//! second guess would have saved. An ordered candidate list keeps the policy
//! in data, where it is testable and configurable.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::page::{PageInfo, CM_PER_INCH};

/// Scale denominators that actually occur on the archive's plans.
static SCALE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\s1\s*:\s*(200|500|1000|2000|5000)\s").unwrap()
});

/// Scales to try when a dossier names none. Order is trial order.
pub const DEFAULT_FALLBACK_SCALES: [u32; 2] = [200, 500];

/// How a page's map scale was determined.
///
/// Ranked by confidence: `Exact` beats `Sibling` beats `Fallback`. A page's
/// resolution happens once and is never replaced by a lower rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedScale {
    /// Designation found in the page's own text.
    Exact(u32),
    /// Borrowed from the first sibling page (in page order) that names one.
    Sibling(u32),
    /// Nothing anywhere in the dossier; ordered candidates to try.
    Fallback(Vec<u32>),
}

impl ResolvedScale {
    /// Candidate denominators in trial order.
    pub fn candidates(&self) -> &[u32] {
        match self {
            ResolvedScale::Exact(s) | ResolvedScale::Sibling(s) => std::slice::from_ref(s),
            ResolvedScale::Fallback(list) => list,
        }
    }

    /// Whether the scale is a guess rather than a read designation.
    pub fn is_fallback(&self) -> bool {
        matches!(self, ResolvedScale::Fallback(_))
    }
}

/// Resolves page scales over the texts of one mutation.
#[derive(Debug, Clone)]
pub struct ScaleResolver {
    fallback: Vec<u32>,
}

impl ScaleResolver {
    /// `fallback` must be non-empty; the config builder checks this.
    pub fn new(fallback: Vec<u32>) -> Self {
        debug_assert!(!fallback.is_empty());
        ScaleResolver { fallback }
    }

    /// First scale designation in `text`, if any.
    pub fn find_in_text(text: &str) -> Option<u32> {
        SCALE_RE
            .captures(text)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }

    /// Resolve the scale of text page `text_index` (1-based) given the
    /// per-page texts of its mutation. Split frames resolve through their
    /// parent's text page, so both halves share one resolution.
    ///
    /// Deterministic: first match in the page's own text, else first match
    /// walking siblings in page order, else the configured fallback list.
    pub fn resolve(&self, text_index: u32, texts: &[&str]) -> ResolvedScale {
        let own = texts.get(text_index as usize - 1).copied().unwrap_or("");
        if let Some(scale) = Self::find_in_text(own) {
            return ResolvedScale::Exact(scale);
        }
        for (i, text) in texts.iter().enumerate() {
            if i + 1 == text_index as usize {
                continue;
            }
            if let Some(scale) = Self::find_in_text(text) {
                return ResolvedScale::Sibling(scale);
            }
        }
        ResolvedScale::Fallback(self.fallback.clone())
    }
}

/// Maximum real-world distance (metres) between two points depicted on a
/// page of `width_px` × `height_px` pixels at `dpi`, drawn at `1:scale`.
///
/// Side lengths convert px → inch → cm → m, scale up by the denominator;
/// the page diagonal bounds any in-page distance.
pub fn distance_limit_m(scale: u32, width_px: u32, height_px: u32, dpi: u32) -> f64 {
    let side_m = |px: u32| px as f64 / dpi as f64 * CM_PER_INCH / 100.0 * scale as f64;
    side_m(width_px).hypot(side_m(height_px))
}

/// One distance limit per candidate scale, in candidate order.
pub fn distance_limits_m(resolved: &ResolvedScale, page: &PageInfo) -> Vec<f64> {
    resolved
        .candidates()
        .iter()
        .map(|&s| distance_limit_m(s, page.width_px, page.height_px, page.dpi))
        .collect()
}

/// Conservative upper bound for a page: the largest limit across its
/// candidate scales.
pub fn max_distance_limit_m(resolved: &ResolvedScale, page: &PageInfo) -> f64 {
    distance_limits_m(resolved, page)
        .into_iter()
        .fold(0.0, f64::max)
}
