//! Progress-callback trait for per-mutation pipeline events.
//!
//! Inject an [`Arc<dyn RunProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to receive
//! real-time events as the pipeline works through the queue.
//!
//! # Why callbacks instead of channels?
//!
//! The callback approach is the least-invasive integration point: callers
//! can forward events to a terminal progress bar, a database record, or a
//! monitoring endpoint without the library knowing anything about how the
//! host application communicates. The trait is `Send + Sync` so it works
//! correctly when mutations are processed concurrently.
//!
//! # Example
//!
//! ```rust
//! use cadaref_batch::{MutationStatus, RunProgressCallback};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! struct CountingCallback {
//!     succeeded: AtomicUsize,
//! }
//!
//! impl RunProgressCallback for CountingCallback {
//!     fn on_mutation_complete(&self, id: &str, status: &MutationStatus) {
//!         if status.is_success() {
//!             self.succeeded.fetch_add(1, Ordering::SeqCst);
//!         }
//!         eprintln!("{id}: {status}");
//!     }
//! }
//! ```

use std::sync::Arc;

use crate::status::MutationStatus;

/// Called by the pipeline as it works through the mutation queue.
///
/// Implementations must be `Send + Sync` (mutations are processed
/// concurrently by a worker pool). All methods have default no-op
/// implementations so callers only override what they care about.
///
/// # Thread safety
///
/// `on_mutation_start` and `on_mutation_complete` may be called
/// concurrently from different worker tasks. Implementations must protect
/// shared mutable state with appropriate synchronisation primitives.
pub trait RunProgressCallback: Send + Sync {
    /// Called once after grouping, before any mutation is processed.
    ///
    /// # Arguments
    /// * `queued` — mutations that will be processed this run (already
    ///   excluding those finished in earlier runs)
    fn on_run_start(&self, queued: usize) {
        let _ = queued;
    }

    /// Called when a worker picks up a mutation.
    fn on_mutation_start(&self, id: &str) {
        let _ = id;
    }

    /// Called when a mutation reaches its final status for this run,
    /// whether georeferenced, failed terminally, or failed on a stage.
    fn on_mutation_complete(&self, id: &str, status: &MutationStatus) {
        let _ = (id, status);
    }

    /// Called once after the queue is drained or the run is stopped.
    ///
    /// # Arguments
    /// * `processed` — mutations attempted this run
    /// * `succeeded` — those that ended georeferenced
    fn on_run_complete(&self, processed: usize, succeeded: usize) {
        let _ = (processed, succeeded);
    }
}

/// A no-op implementation for callers that don't need progress events.
///
/// This is the default when no callback is configured.
pub struct NoopProgressCallback;

impl RunProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn RunProgressCallback>;
