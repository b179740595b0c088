//! The per-mutation state machine vocabulary.
//!
//! [`Stage`] is the ordered list of completable pipeline stages; a mutation's
//! [`MutationStatus`] is either `Queued`, `Completed(stage)` for the last
//! stage that finished, or `Failed(reason)`. Status only ever moves forward:
//! `Queued → Completed(Grouped) → … → Completed(Georeferenced)`, or it halts
//! at a terminal [`FailureReason`]. The runner enforces the ordering; this
//! module just makes it expressible and serialisable.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One completable stage of the pipeline, in execution order.
///
/// `Ord` follows declaration order, which is the execution order, so
/// "stage A before stage B" is just `a < b`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Grouped,
    TextExtracted,
    Rendered,
    Thresholded,
    ScreenshotsFlagged,
    ScaleResolved,
    SymbolsDetected,
    BoundsEstimated,
    PointsExtracted,
    Georeferenced,
}

impl Stage {
    /// Every stage, in execution order.
    pub const ALL: [Stage; 10] = [
        Stage::Grouped,
        Stage::TextExtracted,
        Stage::Rendered,
        Stage::Thresholded,
        Stage::ScreenshotsFlagged,
        Stage::ScaleResolved,
        Stage::SymbolsDetected,
        Stage::BoundsEstimated,
        Stage::PointsExtracted,
        Stage::Georeferenced,
    ];

    /// The stage after this one, or `None` for the last.
    pub fn next(self) -> Option<Stage> {
        let i = Stage::ALL.iter().position(|s| *s == self)?;
        Stage::ALL.get(i + 1).copied()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Grouped => "grouped",
            Stage::TextExtracted => "text_extracted",
            Stage::Rendered => "rendered",
            Stage::Thresholded => "thresholded",
            Stage::ScreenshotsFlagged => "screenshots_flagged",
            Stage::ScaleResolved => "scale_resolved",
            Stage::SymbolsDetected => "symbols_detected",
            Stage::BoundsEstimated => "bounds_estimated",
            Stage::PointsExtracted => "points_extracted",
            Stage::Georeferenced => "georeferenced",
        };
        f.write_str(name)
    }
}

/// Why a mutation ended without a georeferenced raster.
///
/// The first three are evidentiary dead ends: terminal, durable, and skipped
/// on the next run. `Stage` failures are collaborator trouble: reported for
/// this run but *not* durable, so the next invocation retries the stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    /// No parcel geometry matched anywhere in the dossier.
    BoundsNotFound,
    /// No candidate page carries at least four usable symbols.
    NotEnoughSymbols,
    /// The matching engine explicitly found no match on any candidate page.
    NotGeoreferenced,
    /// A stage failed for external reasons; retried next run.
    Stage { stage: Stage, detail: String },
}

impl FailureReason {
    /// Terminal failures are recorded durably; stage failures are not,
    /// so that the next invocation retries them.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, FailureReason::Stage { .. })
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::BoundsNotFound => f.write_str("bounds not found"),
            FailureReason::NotEnoughSymbols => f.write_str("not enough symbols"),
            FailureReason::NotGeoreferenced => f.write_str("not georeferenced"),
            FailureReason::Stage { stage, detail } => {
                write!(f, "stage {stage} failed: {detail}")
            }
        }
    }
}

/// Where a mutation currently stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationStatus {
    /// Grouped into a work unit, no stage finished yet.
    Queued,
    /// The given stage (and all before it) finished.
    Completed(Stage),
    /// Halted with a failure reason.
    Failed(FailureReason),
}

impl MutationStatus {
    /// The run is over for this mutation, successfully or not.
    pub fn is_terminal(&self) -> bool {
        match self {
            MutationStatus::Queued => false,
            MutationStatus::Completed(stage) => *stage == Stage::Georeferenced,
            MutationStatus::Failed(reason) => reason.is_terminal(),
        }
    }

    /// Terminal success: a georeferenced raster was stored.
    pub fn is_success(&self) -> bool {
        matches!(self, MutationStatus::Completed(Stage::Georeferenced))
    }

    /// Record completion of `stage`, which must move the status forward.
    ///
    /// Panics in debug builds on a backward transition; the runner only
    /// calls this while walking `Stage::ALL` front to back.
    pub fn advance(&mut self, stage: Stage) {
        if let MutationStatus::Completed(prev) = self {
            debug_assert!(*prev < stage, "status moved backward: {prev} after {stage}");
        }
        *self = MutationStatus::Completed(stage);
    }
}

impl fmt::Display for MutationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationStatus::Queued => f.write_str("queued"),
            MutationStatus::Completed(stage) => write!(f, "{stage}"),
            MutationStatus::Failed(reason) => write!(f, "failed ({reason})"),
        }
    }
}
