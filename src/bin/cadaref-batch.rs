//! CLI binary for cadaref-batch.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `PipelineConfig`, renders progress, and turns the run report into
//! an exit code.

use anyhow::{Context, Result};
use cadaref_batch::{
    MutationStatus, PipelineConfig, ProgressCallback, RunProgressCallback, RunReport,
};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: one bar over the queued mutations plus a
/// log line per finished mutation. Mutations complete out of order, so
/// per-mutation timing is keyed by id rather than position.
struct CliProgressCallback {
    /// The single progress bar anchored at the bottom of the terminal.
    bar: ProgressBar,
    /// Per-mutation wall-clock start times for elapsed reporting.
    start_times: Mutex<HashMap<String, Instant>>,
}

impl CliProgressCallback {
    /// Create a callback whose bar length is set by `on_run_start`
    /// (called once the scans have been grouped).
    fn new_dynamic() -> Arc<Self> {
        let bar = ProgressBar::new(0); // length set in on_run_start

        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Loading survey data and grouping scans…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
        })
    }

    /// Switch to the full progress-bar style once the queue size is known.
    fn activate_bar(&self, total: usize) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>4}/{len} mutations  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

        self.bar.set_length(total as u64);
        self.bar.set_style(progress_style);
        self.bar.set_prefix("Georeferencing");
        self.bar.reset_eta();
    }
}

impl RunProgressCallback for CliProgressCallback {
    fn on_run_start(&self, queued: usize) {
        self.activate_bar(queued);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Processing {queued} mutations…"))
        ));
    }

    fn on_mutation_start(&self, id: &str) {
        self.start_times
            .lock()
            .unwrap()
            .insert(id.to_string(), Instant::now());
        self.bar.set_message(id.to_string());
    }

    fn on_mutation_complete(&self, id: &str, status: &MutationStatus) {
        let elapsed = self
            .start_times
            .lock()
            .unwrap()
            .remove(id)
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);

        let line = match status {
            s if s.is_success() => format!("  {} {:<12}  {}", green("✓"), id, dim("georeferenced")),
            MutationStatus::Failed(reason) if reason.is_terminal() => {
                format!("  {} {:<12}  {}", red("✗"), id, red(&reason.to_string()))
            }
            MutationStatus::Failed(reason) => format!(
                "  {} {:<12}  {}",
                cyan("⚠"),
                id,
                cyan(&format!("{reason} (will retry next run)"))
            ),
            other => format!("  {} {:<12}  {}", dim("·"), id, dim(&other.to_string())),
        };
        self.bar
            .println(format!("{line}  {}", dim(&format!("{elapsed:.1}s"))));
        self.bar.inc(1);
    }

    fn on_run_complete(&self, processed: usize, succeeded: usize) {
        let failed = processed.saturating_sub(succeeded);
        self.bar.finish_and_clear();

        if failed == 0 {
            eprintln!(
                "{} {} mutations georeferenced",
                green("✔"),
                bold(&succeeded.to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} mutations georeferenced  ({} failed)",
                if succeeded == 0 { red("✘") } else { cyan("⚠") },
                bold(&succeeded.to_string()),
                processed,
                red(&failed.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Georeference every dossier under scans/
  cadaref-batch --scans scans/ --workdir workdir/ --survey-data survey_data/

  # Resume after an interruption (same command; finished mutations are skipped)
  cadaref-batch --scans scans/ --workdir workdir/ --survey-data survey_data/

  # Honour the register of deleted survey points
  cadaref-batch --scans scans/ --workdir workdir/ --survey-data survey_data/ \
      --deleted-points survey_data/deleted_points.csv

  # Two workers, higher render resolution
  cadaref-batch --scans scans/ --workdir workdir/ --survey-data survey_data/ \
      --workers 2 --dpi 400

WORK DIRECTORY LAYOUT:
  text/            extracted page texts, one file per mutation
  rendered/        multi-frame TIFF per mutation + frame sidecar JSON
  thresholded/     binarised copies used for symbol detection
  symbols/         detected cartographic symbols (CSV)
  bounds/          estimated search window (GeoJSON)
  points/          candidate survey points (CSV)
  georeferenced/   matched rasters — the product
  not_georeferenced/  rendered rasters no frame of which matched
  logs/success, logs/failed  one JSON line per finished mutation
  tmp/             per-mutation scratch, removed after each mutation

EXIT CODES:
  0  every processed mutation ended georeferenced
  1  at least one mutation failed (rerun retries stage failures)
  2  the run itself could not proceed (bad inputs, unwritable workdir)

EXTERNAL TOOLS (must be on PATH):
  pdftotext, pdftocairo          poppler-utils
  tiffcp, tiffset                libtiff-tools
  cadaref-threshold              per-frame Otsu measurement and binarisation
  cadaref-classify               cartographic symbol detection
  cadaref-match                  the georeferencing engine

SIGNALS:
  Ctrl-C stops gracefully: queued mutations stay queued, in-flight ones
  finish and are recorded. Run the same command again to continue.
"#;

/// Georeference scanned cadastral mutation plans in bulk.
#[derive(Parser, Debug)]
#[command(
    name = "cadaref-batch",
    version,
    about = "Georeference scanned cadastral mutation plans in bulk",
    long_about = "Convert a directory of scanned mutation dossiers (PDF) into georeferenced \
TIFF rasters, using the survey point database to anchor each plan. The pipeline is \
resumable: every intermediate is cached in the work directory and finished mutations \
are skipped on the next run.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Directory of scanned dossiers (PDF files).
    #[arg(long, env = "CADAREF_SCANS")]
    scans: PathBuf,

    /// Work directory for artifacts, logs, and outputs.
    #[arg(long, env = "CADAREF_WORKDIR")]
    workdir: PathBuf,

    /// Directory holding the survey datasets (points, parcels, mutations CSVs).
    #[arg(long, env = "CADAREF_SURVEY_DATA")]
    survey_data: PathBuf,

    /// Curated CSV of historically deleted survey points.
    #[arg(long, env = "CADAREF_DELETED_POINTS")]
    deleted_points: Option<PathBuf>,

    /// Number of mutations processed concurrently.
    #[arg(short, long, env = "CADAREF_WORKERS", default_value_t = num_cpus::get())]
    workers: usize,

    /// Rendering resolution in dots per inch (72-600).
    #[arg(long, env = "CADAREF_DPI", default_value_t = 300,
          value_parser = clap::value_parser!(u32).range(72..=600))]
    dpi: u32,

    /// Days a survey point may outlive its deletion date and still count.
    #[arg(long, env = "CADAREF_DATE_SLACK_DAYS", default_value_t = 365)]
    date_slack_days: u64,

    /// Scales tried when no scale is printed on the plan.
    #[arg(long, env = "CADAREF_FALLBACK_SCALES", value_delimiter = ',',
          default_value = "200,500")]
    fallback_scales: Vec<u32>,

    /// Seconds one matching-engine invocation may take before it is killed.
    #[arg(long, env = "CADAREF_GEOREF_TIMEOUT_SECS", default_value_t = 300)]
    georef_timeout_secs: u64,

    /// Disable the progress bar.
    #[arg(long, env = "CADAREF_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "CADAREF_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "CADAREF_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() {
    let code = match run_cli().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {e:#}", red("✘"));
            2
        }
    };
    std::process::exit(code);
}

async fn run_cli() -> Result<i32> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar and tracing both write to stderr; suppress library
    // logs while the bar is active so they do not fight over the terminal.
    let show_progress = !cli.quiet && !cli.no_progress;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Progress + graceful stop ─────────────────────────────────────────
    let progress_cb = if show_progress {
        Some(CliProgressCallback::new_dynamic())
    } else {
        None
    };

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        let bar = progress_cb.as_ref().map(|cb| cb.bar.clone());
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                stop.store(true, Ordering::Relaxed);
                let note = "Stop requested: in-flight mutations finish, queued ones stay queued.";
                match &bar {
                    Some(bar) => bar.println(cyan(note)),
                    None => eprintln!("{}", cyan(note)),
                }
            }
        });
    }

    // ── Build config and run ─────────────────────────────────────────────
    let mut builder = PipelineConfig::builder()
        .scans_dir(&cli.scans)
        .work_dir(&cli.workdir)
        .survey_data_dir(&cli.survey_data)
        .workers(cli.workers)
        .dpi(cli.dpi)
        .date_slack_days(cli.date_slack_days)
        .fallback_scales(cli.fallback_scales.clone())
        .georef_timeout_secs(cli.georef_timeout_secs)
        .stop_flag(stop);
    if let Some(ref csv) = cli.deleted_points {
        builder = builder.deleted_points(csv);
    }
    if let Some(ref cb) = progress_cb {
        builder = builder.progress_callback(Arc::clone(cb) as ProgressCallback);
    }
    let config = builder.build().context("Invalid configuration")?;

    let report = cadaref_batch::run(config).await.context("Run failed")?;

    if !cli.quiet {
        print_summary(&report);
    }
    Ok(report.exit_code())
}

/// Per-status counts plus the bookkeeping a batch operator cares about.
fn print_summary(report: &RunReport) {
    let counts = report.status_counts();
    if !counts.is_empty() {
        eprintln!("{}", bold("Summary"));
        for (status, count) in &counts {
            eprintln!("  {status:<22} {count:>5}");
        }
    }
    if report.skipped_done > 0 {
        eprintln!(
            "  {}",
            dim(&format!(
                "{} mutations already recorded in earlier runs",
                report.skipped_done
            ))
        );
    }
    if !report.unrecognized.is_empty() {
        eprintln!(
            "  {}",
            dim(&format!(
                "{} files did not match the dossier naming scheme",
                report.unrecognized.len()
            ))
        );
    }
}
