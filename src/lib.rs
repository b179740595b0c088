//! # cadaref-batch
//!
//! Georeference scanned cadastral mutation plans, in bulk, offline.
//!
//! ## Why this crate?
//!
//! A city archive holds tens of thousands of scanned mutation dossiers:
//! multi-page PDFs mixing plans, measurement tables, and office notes,
//! with nothing but a filename to say what they are. Turning one dossier
//! into a georeferenced raster takes a handful of external tools and a
//! pile of survey data; turning all of them into rasters takes a driver
//! that groups the scans, runs the tools in the right order, caches every
//! intermediate, and survives being killed halfway through. This crate is
//! that driver.
//!
//! ## Pipeline Overview
//!
//! ```text
//! scans/*.pdf
//!  │
//!  ├─ 1. Group       filename → mutation id, date, parcels
//!  ├─ 2. Text        pdftotext page texts (form-feed separated)
//!  ├─ 3. Render      pdftocairo multi-frame TIFF, tables split in two
//!  ├─ 4. Threshold   per-frame Otsu, binarised copy for detection
//!  ├─ 5. Classify    cartographic symbols per frame (white/black marks)
//!  ├─ 6. Bounds      parcels + mutation records → search window
//!  ├─ 7. Points      survey points inside the window, date-filtered
//!  └─ 8. Match       cadaref engine → georeferenced/{id}.tif
//! ```
//!
//! Every stage writes its artifact into the work directory before the
//! next one starts, so a second invocation picks up exactly where the
//! first one stopped. Mutations whose terminal outcome is already in the
//! run logs are not touched again.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cadaref_batch::PipelineConfig;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::builder()
//!         .scans_dir("scans")
//!         .work_dir("workdir")
//!         .survey_data_dir("survey_data")
//!         .workers(4)
//!         .build()?;
//!     let report = cadaref_batch::run(config).await?;
//!     println!(
//!         "georeferenced {} of {} mutations",
//!         report.succeeded(),
//!         report.outcomes.len()
//!     );
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `cadaref-batch` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when embedding the pipeline as a library:
//! ```toml
//! cadaref-batch = { version = "0.1", default-features = false }
//! ```
//!
//! ## External tools
//!
//! The pipeline shells out for everything image- and matching-related:
//! `pdftotext` and `pdftocairo` from poppler, plus the `cadaref-threshold`,
//! `cadaref-classify`, and `cadaref-match` tools on `PATH`. Library users
//! can swap any of them for in-process implementations through
//! [`Collaborators`].

// ── Modules ──────────────────────────────────────────────────────────────

pub mod bounds;
pub mod cache;
pub mod collab;
pub mod config;
pub mod error;
pub mod mutation;
pub mod page;
pub mod points;
pub mod progress;
pub mod report;
pub mod runner;
pub mod scale;
pub mod status;
pub mod survey;
pub mod symbols;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use collab::Collaborators;
pub use config::{PipelineConfig, PipelineConfigBuilder};
pub use error::{PipelineError, StageError};
pub use progress::{NoopProgressCallback, ProgressCallback, RunProgressCallback};
pub use report::{MutationOutcome, MutationRecord, RunReport};
pub use runner::run;
pub use status::{FailureReason, MutationStatus, Stage};
