//! Error types for the cadaref-batch library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`PipelineError`] — **Fatal**: the run cannot proceed at all (unreadable
//!   scans directory, missing reference dataset, invalid configuration).
//!   Returned as `Err(PipelineError)` from the top-level [`crate::run`]
//!   functions and mapped to exit code 2.
//!
//! * [`StageError`] — **Non-fatal**: one stage of one mutation failed (a
//!   collaborator tool crashed, timed out, or produced garbage) but every
//!   other mutation is fine. Converted into a
//!   [`crate::report::MutationOutcome`] by the per-mutation driver so the
//!   scheduler never sees an `Err`; the stage cache stays incomplete and the
//!   next invocation retries exactly that stage.
//!
//! The separation keeps the failure taxonomy honest: evidentiary dead ends
//! (`BoundsNotFound`, `NotEnoughSymbols`, `NotGeoreferenced`) are *statuses*,
//! not errors, and live in [`crate::status::FailureReason`] instead.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the cadaref-batch library.
///
/// Per-mutation stage failures use [`StageError`] and are folded into the run
/// report rather than propagated here.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// The scans directory does not exist.
    #[error("Scans directory not found: '{path}'\nCheck the path exists and is readable.")]
    ScansDirNotFound { path: PathBuf },

    /// The scans directory exists but cannot be traversed.
    #[error("Cannot read scans directory '{path}': {source}")]
    ScansDirUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Reference-dataset errors ──────────────────────────────────────────
    /// A required survey dataset file is missing.
    #[error("Survey dataset '{name}' not found at '{path}'\nExtract the survey data first, or point --survey-data at the right directory.")]
    DatasetMissing { name: &'static str, path: PathBuf },

    /// A survey dataset file exists but does not parse.
    #[error("Survey dataset '{name}' at '{path}' is malformed: {detail}")]
    DatasetMalformed {
        name: &'static str,
        path: PathBuf,
        detail: String,
    },

    // ── Work-directory errors ─────────────────────────────────────────────
    /// Could not create the work directory tree.
    #[error("Failed to create work directory '{path}': {source}")]
    WorkDirCreateFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Could not open or append to a run log.
    ///
    /// Run logs are the durable terminal-status record; continuing without
    /// them would break resumability, so this is fatal.
    #[error("Failed to write run log '{path}': {source}")]
    LogWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Could not read a run log back while building the done-set.
    #[error("Failed to read run log '{path}': {source}")]
    LogReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// A non-fatal error for a single stage of a single mutation.
///
/// The per-mutation driver records it, leaves the stage cache incomplete,
/// and moves on. The run as a whole continues.
#[derive(Debug, Error)]
pub enum StageError {
    /// A collaborator tool could not be spawned at all.
    #[error("Could not spawn '{tool}': {detail}\nIs {tool} installed and on PATH?")]
    Spawn { tool: &'static str, detail: String },

    /// A collaborator tool ran and exited non-zero. An exit code of -1
    /// means the process died on a signal.
    #[error("'{tool}' exited with {code}: {stderr}")]
    ToolFailed {
        tool: &'static str,
        code: i32,
        stderr: String,
    },

    /// A collaborator tool exceeded its deadline and was killed.
    #[error("'{tool}' timed out after {secs}s")]
    Timeout { tool: &'static str, secs: u64 },

    /// A collaborator ran fine but its output does not parse.
    #[error("Unusable {tool} output: {detail}")]
    MalformedOutput { tool: &'static str, detail: String },

    /// A cached artifact turned out corrupt when a later stage loaded it.
    ///
    /// Atomic writes make this unreachable in normal operation; if it does
    /// happen the artifact is discarded so the next run recomputes it.
    #[error("Corrupt artifact '{path}': {detail}")]
    CorruptArtifact { path: PathBuf, detail: String },

    /// Per-mutation filesystem trouble (scratch files, artifact moves).
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StageError {
    /// Shorthand used by every artifact write/read site.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StageError::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dataset_missing_display_names_the_file() {
        let e = PipelineError::DatasetMissing {
            name: "parcels.csv",
            path: "/data/survey/parcels.csv".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("parcels.csv"), "got: {msg}");
        assert!(msg.contains("--survey-data"), "got: {msg}");
    }

    #[test]
    fn invalid_config_display() {
        let e = PipelineError::InvalidConfig("workers must be >= 1".into());
        assert!(e.to_string().contains("workers must be >= 1"));
    }

    #[test]
    fn spawn_display_hints_at_path() {
        let e = StageError::Spawn {
            tool: "pdftocairo",
            detail: "No such file or directory".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("pdftocairo"));
        assert!(msg.contains("on PATH"));
    }

    #[test]
    fn timeout_display() {
        let e = StageError::Timeout {
            tool: "cadaref-match",
            secs: 300,
        };
        assert!(e.to_string().contains("300s"));
    }

    #[test]
    fn tool_failed_display_carries_stderr() {
        let e = StageError::ToolFailed {
            tool: "tiffcp",
            code: 1,
            stderr: "Cannot open input".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("tiffcp"));
        assert!(msg.contains("Cannot open input"));
    }
}
