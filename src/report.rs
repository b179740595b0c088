//! Durable run logs and the end-of-run report.
//!
//! Terminal outcomes are appended to `logs/success` and `logs/failed` as
//! JSON lines, one [`MutationRecord`] per mutation. At startup the two logs
//! are folded into a done-set so already-finished mutations are skipped
//! wholesale. Stage failures never reach the logs: they live only in the
//! in-memory [`RunReport`] for this run, which leaves their stage cache
//! incomplete and makes the next invocation retry them.

use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use crate::cache::WorkDir;
use crate::error::PipelineError;
use crate::status::{FailureReason, MutationStatus, Stage};

// ── Per-mutation outcome ──────────────────────────────────────────────────

/// Everything this run remembers about one mutation.
#[derive(Debug, Clone)]
pub struct MutationOutcome {
    /// Mutation identifier, e.g. `HG3099`.
    pub id: String,
    /// Where the mutation ended up.
    pub status: MutationStatus,
    /// Number of PDF parts grouped into the dossier.
    pub parts: usize,
    /// Wall-clock seconds per stage actually executed. Stages served from
    /// the cache are absent.
    pub timings: BTreeMap<Stage, f64>,
}

impl MutationOutcome {
    pub fn new(id: impl Into<String>, parts: usize) -> MutationOutcome {
        MutationOutcome {
            id: id.into(),
            status: MutationStatus::Queued,
            parts,
            timings: BTreeMap::new(),
        }
    }

    /// The durable log projection, or `None` while the status is still
    /// retryable (queued, mid-pipeline, or a stage failure).
    pub fn to_record(&self) -> Option<MutationRecord> {
        if !self.status.is_terminal() {
            return None;
        }
        let failure = match &self.status {
            MutationStatus::Failed(reason) => Some(reason.clone()),
            _ => None,
        };
        let status = if self.status.is_success() {
            RecordStatus::Georeferenced
        } else {
            RecordStatus::Failed
        };
        Some(MutationRecord {
            id: self.id.clone(),
            status,
            failure,
            parts: self.parts,
            timings: self.timings.clone(),
        })
    }
}

/// Final status vocabulary of the run logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Georeferenced,
    Failed,
}

/// One line of `logs/success` or `logs/failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationRecord {
    pub id: String,
    pub status: RecordStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    pub parts: usize,
    #[serde(default)]
    pub timings: BTreeMap<Stage, f64>,
}

// ── Run logs ──────────────────────────────────────────────────────────────

/// Append handles to the two run logs, shared across worker tasks.
///
/// Each record is serialised to a single line and written under a lock, so
/// concurrent workers never interleave partial lines.
pub struct RunLog {
    success: Mutex<File>,
    failed: Mutex<File>,
    success_path: PathBuf,
    failed_path: PathBuf,
}

impl RunLog {
    /// Open (creating if necessary) both logs in append mode.
    pub async fn open(work: &WorkDir) -> Result<RunLog, PipelineError> {
        let success_path = work.success_log_path();
        let failed_path = work.failed_log_path();
        let success = open_append(&success_path).await?;
        let failed = open_append(&failed_path).await?;
        Ok(RunLog {
            success: Mutex::new(success),
            failed: Mutex::new(failed),
            success_path,
            failed_path,
        })
    }

    /// Append the outcome to the matching log. Retryable outcomes are not
    /// persisted at all, so the next run picks them up again.
    pub async fn record(&self, outcome: &MutationOutcome) -> Result<(), PipelineError> {
        let Some(record) = outcome.to_record() else {
            return Ok(());
        };
        let (file, path) = if outcome.status.is_success() {
            (&self.success, &self.success_path)
        } else {
            (&self.failed, &self.failed_path)
        };
        let mut line = serde_json::to_string(&record).map_err(|e| PipelineError::LogWriteFailed {
            path: path.clone(),
            source: io::Error::new(io::ErrorKind::InvalidData, e),
        })?;
        line.push('\n');

        let mut file = file.lock().await;
        let written = async {
            file.write_all(line.as_bytes()).await?;
            file.flush().await
        }
        .await;
        written.map_err(|source| PipelineError::LogWriteFailed {
            path: path.clone(),
            source,
        })
    }
}

async fn open_append(path: &Path) -> Result<File, PipelineError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|source| PipelineError::LogWriteFailed {
            path: path.to_path_buf(),
            source,
        })
}

/// Collect the ids of every mutation a previous run already finished.
///
/// Missing logs mean a fresh work directory. Unparseable lines are most
/// likely the torn tail of a killed run; they are skipped with a warning,
/// which makes the affected mutation run again.
pub async fn load_done_set(work: &WorkDir) -> Result<HashSet<String>, PipelineError> {
    let mut done = HashSet::new();
    for path in [work.success_log_path(), work.failed_log_path()] {
        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(source) => return Err(PipelineError::LogReadFailed { path, source }),
        };
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<MutationRecord>(line) {
                Ok(record) => {
                    done.insert(record.id);
                }
                Err(e) => warn!(
                    path = %path.display(),
                    error = %e,
                    "Skipping unparseable run log line"
                ),
            }
        }
    }
    Ok(done)
}

// ── Run report ────────────────────────────────────────────────────────────

/// What one invocation of the pipeline did.
#[derive(Debug, Default)]
pub struct RunReport {
    /// Outcome of every mutation processed in this run, in completion order.
    pub outcomes: Vec<MutationOutcome>,
    /// Mutations skipped because a previous run already recorded them.
    pub skipped_done: usize,
    /// Files under the scans directory whose names did not parse.
    pub unrecognized: Vec<PathBuf>,
}

impl RunReport {
    /// Mutations that ended with a georeferenced raster.
    pub fn succeeded(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status.is_success())
            .count()
    }

    /// Durable failures: recorded in `logs/failed`, skipped next run.
    pub fn terminal_failures(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status.is_terminal() && !o.status.is_success())
            .count()
    }

    /// Retryable collaborator failures: reported but not persisted.
    pub fn stage_failures(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| {
                matches!(
                    o.status,
                    MutationStatus::Failed(FailureReason::Stage { .. })
                )
            })
            .count()
    }

    /// Outcome counts keyed by a short status label, for the summary table.
    pub fn status_counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for outcome in &self.outcomes {
            *counts.entry(bucket(&outcome.status)).or_insert(0) += 1;
        }
        counts
    }

    /// 0 when every processed mutation succeeded, 1 otherwise. Process-level
    /// faults never reach this point; the binary maps them to 2.
    pub fn exit_code(&self) -> i32 {
        if self.outcomes.iter().all(|o| o.status.is_success()) {
            0
        } else {
            1
        }
    }
}

fn bucket(status: &MutationStatus) -> &'static str {
    match status {
        MutationStatus::Completed(Stage::Georeferenced) => "georeferenced",
        MutationStatus::Failed(FailureReason::BoundsNotFound) => "bounds_not_found",
        MutationStatus::Failed(FailureReason::NotEnoughSymbols) => "not_enough_symbols",
        MutationStatus::Failed(FailureReason::NotGeoreferenced) => "not_georeferenced",
        MutationStatus::Failed(FailureReason::Stage { .. }) => "stage_failed",
        _ => "incomplete",
    }
}
