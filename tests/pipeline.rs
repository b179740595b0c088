//! End-to-end pipeline tests.
//!
//! Every test drives `cadaref_batch::run` against a scratch work
//! directory with in-process collaborators, so the whole pipeline runs
//! hermetically: no poppler, no matching engine, no network. The fakes
//! count their invocations, which is what makes the resumability
//! guarantees checkable (a cached stage must not call its tool again).

use async_trait::async_trait;
use cadaref_batch::collab::{
    Collaborators, FrameSource, GeorefEngine, MatchOutcome, PageRenderer, SourcePage,
    SymbolDetector, TextExtractor, Thresholder,
};
use cadaref_batch::symbols::SymbolDetection;
use cadaref_batch::{FailureReason, MutationStatus, PipelineConfig, Stage, StageError};
use chrono::NaiveDate;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Enough of a TIFF to satisfy the artifact header check.
const TIFF: &[u8] = b"II*\x00\x08\x00\x00\x00fake";

// ── Fake collaborators ───────────────────────────────────────────────────────

#[derive(Default)]
struct Counters {
    text: AtomicUsize,
    render: AtomicUsize,
    threshold: AtomicUsize,
    detect: AtomicUsize,
    engine: AtomicUsize,
}

struct FakeText {
    /// Pages returned for every part.
    pages: Vec<String>,
    fail: bool,
    counters: Arc<Counters>,
}

#[async_trait]
impl TextExtractor for FakeText {
    async fn extract_pages(&self, _pdf: &Path) -> Result<Vec<String>, StageError> {
        self.counters.text.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(StageError::ToolFailed {
                tool: "pdftotext",
                code: 1,
                stderr: "cannot open".into(),
            });
        }
        Ok(self.pages.clone())
    }
}

/// Returns evidence-free text for `WO_Mut_*` parts and a plan page for
/// everything else, so mutations sharing one run can diverge.
struct PartKeyedText {
    counters: Arc<Counters>,
}

#[async_trait]
impl TextExtractor for PartKeyedText {
    async fn extract_pages(&self, pdf: &Path) -> Result<Vec<String>, StageError> {
        self.counters.text.fetch_add(1, Ordering::SeqCst);
        let name = pdf.file_name().unwrap().to_string_lossy();
        if name.starts_with("WO_Mut") {
            Ok(vec!["Kein Plan vorhanden\nMassstab 1:500 \n".to_string()])
        } else {
            Ok(vec![plan_text()])
        }
    }
}

struct FakeRenderer {
    page_count: usize,
    counters: Arc<Counters>,
}

#[async_trait]
impl PageRenderer for FakeRenderer {
    async fn render_parts(
        &self,
        _parts: &[PathBuf],
        _dpi: u32,
        scratch: &Path,
    ) -> Result<Vec<SourcePage>, StageError> {
        self.counters.render.fetch_add(1, Ordering::SeqCst);
        Ok((0..self.page_count)
            .map(|i| SourcePage {
                path: scratch.join(format!("S0-{i}.tif")),
                width_px: 2480,
                height_px: 3508,
            })
            .collect())
    }

    async fn assemble(
        &self,
        _frames: &[FrameSource],
        _scan_date: Option<NaiveDate>,
        _scratch: &Path,
        output: &Path,
    ) -> Result<(), StageError> {
        std::fs::write(output, TIFF).map_err(|e| StageError::io(output, e))
    }
}

struct FakeThresholder {
    thresholds: Vec<u8>,
    counters: Arc<Counters>,
}

#[async_trait]
impl Thresholder for FakeThresholder {
    async fn measure(&self, _rendered: &Path) -> Result<Vec<u8>, StageError> {
        self.counters.threshold.fetch_add(1, Ordering::SeqCst);
        Ok(self.thresholds.clone())
    }

    async fn binarize(
        &self,
        _rendered: &Path,
        _thresholds: &[u8],
        output: &Path,
    ) -> Result<(), StageError> {
        std::fs::write(output, TIFF).map_err(|e| StageError::io(output, e))
    }
}

struct FakeDetector {
    detections: Vec<SymbolDetection>,
    counters: Arc<Counters>,
}

#[async_trait]
impl SymbolDetector for FakeDetector {
    async fn detect(
        &self,
        _thresholded: &Path,
        page: u32,
        _coord_scale: f64,
    ) -> Result<Vec<SymbolDetection>, StageError> {
        self.counters.detect.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .detections
            .iter()
            .filter(|d| d.page == page)
            .cloned()
            .collect())
    }
}

#[derive(Clone, Copy)]
enum EngineMode {
    Match,
    NoMatch,
    Fail,
}

struct FakeEngine {
    mode: EngineMode,
    pages_seen: Mutex<Vec<u32>>,
    counters: Arc<Counters>,
}

#[async_trait]
impl GeorefEngine for FakeEngine {
    async fn match_frame(
        &self,
        _rendered: &Path,
        page: u32,
        _scales: &[u32],
        _symbols_csv: &Path,
        _points_csv: &Path,
        output: &Path,
    ) -> Result<MatchOutcome, StageError> {
        self.counters.engine.fetch_add(1, Ordering::SeqCst);
        self.pages_seen.lock().unwrap().push(page);
        match self.mode {
            EngineMode::Match => {
                std::fs::write(output, TIFF).map_err(|e| StageError::io(output, e))?;
                Ok(MatchOutcome::Matched)
            }
            EngineMode::NoMatch => Ok(MatchOutcome::NoMatch),
            EngineMode::Fail => Err(StageError::ToolFailed {
                tool: "cadaref-match",
                code: 70,
                stderr: "matcher crashed".into(),
            }),
        }
    }
}

struct FakeSet {
    counters: Arc<Counters>,
    engine: Arc<FakeEngine>,
    collab: Collaborators,
}

fn fakes(pages: Vec<String>, detections: Vec<SymbolDetection>, mode: EngineMode) -> FakeSet {
    let counters = Arc::new(Counters::default());
    let page_count = pages.len();
    let engine = Arc::new(FakeEngine {
        mode,
        pages_seen: Mutex::new(Vec::new()),
        counters: Arc::clone(&counters),
    });
    let collab = Collaborators {
        text: Arc::new(FakeText {
            pages,
            fail: false,
            counters: Arc::clone(&counters),
        }),
        renderer: Arc::new(FakeRenderer {
            page_count,
            counters: Arc::clone(&counters),
        }),
        thresholder: Arc::new(FakeThresholder {
            thresholds: vec![140; page_count],
            counters: Arc::clone(&counters),
        }),
        detector: Arc::new(FakeDetector {
            detections,
            counters: Arc::clone(&counters),
        }),
        engine: engine.clone(),
    };
    FakeSet {
        counters,
        engine,
        collab,
    }
}

// ── Fixtures ─────────────────────────────────────────────────────────────────

struct World {
    scans: TempDir,
    work: TempDir,
    survey: TempDir,
}

impl World {
    fn new() -> World {
        let world = World {
            scans: TempDir::new().unwrap(),
            work: TempDir::new().unwrap(),
            survey: TempDir::new().unwrap(),
        };
        write_survey_dir(world.survey.path());
        world
    }

    fn add_scan(&self, name: &str) {
        std::fs::write(self.scans.path().join(name), b"%PDF-1.4 fake").unwrap();
    }

    fn config(&self, collab: Collaborators) -> PipelineConfig {
        self.builder(collab).build().unwrap()
    }

    fn builder(&self, collab: Collaborators) -> cadaref_batch::PipelineConfigBuilder {
        PipelineConfig::builder()
            .scans_dir(self.scans.path())
            .work_dir(self.work.path())
            .survey_data_dir(self.survey.path())
            .workers(2)
            .collaborators(collab)
    }

    fn work_path(&self, rel: &str) -> PathBuf {
        self.work.path().join(rel)
    }

    fn read_log(&self, name: &str) -> String {
        std::fs::read_to_string(self.work.path().join("logs").join(name)).unwrap()
    }
}

fn write_survey_dir(dir: &Path) {
    std::fs::write(
        dir.join("parcels.csv"),
        "parcel,min_x,max_x,min_y,max_y,created_by,created\n\
         HG2244,2683100.0,2683200.0,1247100.0,1247200.0,HG1000,1875-03-01\n\
         HG2250,2683250.0,2683350.0,1247050.0,1247150.0,HG3099,1952-06-10\n\
         WO15,,,,,WO3,1890-01-01\n",
    )
    .unwrap();
    std::fs::write(
        dir.join("mutations.csv"),
        "mutation,date,min_x,max_x,min_y,max_y\n\
         HG3099,1952-06-10,2683240.0,2683360.0,1247040.0,1247160.0\n\
         HG1000,1875-03-01,,,,\n",
    )
    .unwrap();
    std::fs::write(
        dir.join("border_points.csv"),
        "point,type,x,y,created_by,created\n\
         HG1001,Bolzen,2683120.0,1247150.0,HG1000,1875-03-01\n\
         HG1002,Stein,2683180.0,1247110.0,HG1000,1875-03-01\n\
         HG1003,unversichert,2683150.0,1247130.0,HG1000,1875-03-01\n",
    )
    .unwrap();
    std::fs::write(
        dir.join("fixed_points.csv"),
        "point,type,protection,x,y,created_by,created\n\
         HG9001,LFP3,keine,2683130.0,1247170.0,HG1000,1875-03-01\n",
    )
    .unwrap();
    std::fs::write(
        dir.join("deleted_points.csv"),
        "Punktnummer,Kl,X [LV95],Y [LV95],Erstellmutation,Löschmutation\n\
         HG5005,4,2683140.0,1247120.0,HG1000,HG3099\n\
         HG5006,2,2683141.0,1247121.0,HG1000,\n",
    )
    .unwrap();
}

/// Text of a typical plan page: a recognisable parcel and a printed scale.
fn plan_text() -> String {
    "Mutation HG3099\nbetrifft Parzelle HG2244\nMassstab 1:500 \nKatasterplan".to_string()
}

fn white_symbols(page: u32, n: usize) -> Vec<SymbolDetection> {
    (0..n)
        .map(|i| SymbolDetection {
            page,
            x: 100.0 + i as f64 * 40.0,
            y: 80.0,
            symbol: "white_circle".into(),
        })
        .collect()
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn full_run_produces_a_georeferenced_raster() {
    let world = World::new();
    world.add_scan("HG_Mut_3099_j1952.pdf");
    world.add_scan("randomnotes.pdf");

    let set = fakes(vec![plan_text()], white_symbols(1, 5), EngineMode::Match);
    let report = cadaref_batch::run(world.config(set.collab)).await.unwrap();

    assert_eq!(report.outcomes.len(), 1);
    assert_eq!(report.succeeded(), 1);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.skipped_done, 0);
    assert_eq!(report.unrecognized.len(), 1);

    let outcome = &report.outcomes[0];
    assert_eq!(outcome.id, "HG3099");
    assert!(outcome.status.is_success());
    assert_eq!(outcome.parts, 1);

    for artifact in [
        "text/HG3099.txt",
        "rendered/HG3099.tif",
        "rendered/HG3099.json",
        "thresholded/HG3099.tif",
        "symbols/HG3099.csv",
        "bounds/HG3099.geojson",
        "points/HG3099.csv",
        "georeferenced/HG3099.tif",
    ] {
        assert!(world.work_path(artifact).is_file(), "missing {artifact}");
    }
    assert!(!world.work_path("tmp/HG3099").exists());

    // The evidence window covers all six survey points.
    let points = std::fs::read_to_string(world.work_path("points/HG3099.csv")).unwrap();
    assert_eq!(points.lines().count(), 7);

    let success = world.read_log("success");
    let record: serde_json::Value =
        serde_json::from_str(success.lines().next().unwrap()).unwrap();
    assert_eq!(record["id"], "HG3099");
    assert_eq!(record["status"], "georeferenced");
    assert_eq!(record["parts"], 1);
    assert_eq!(world.read_log("failed"), "");

    assert_eq!(set.counters.text.load(Ordering::SeqCst), 1);
    assert_eq!(set.counters.engine.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn finished_mutations_are_skipped_on_the_next_run() {
    let world = World::new();
    world.add_scan("HG_Mut_3099_j1952.pdf");

    let first = fakes(vec![plan_text()], white_symbols(1, 5), EngineMode::Match);
    cadaref_batch::run(world.config(first.collab)).await.unwrap();

    let second = fakes(vec![plan_text()], white_symbols(1, 5), EngineMode::Match);
    let report = cadaref_batch::run(world.config(second.collab)).await.unwrap();

    assert!(report.outcomes.is_empty());
    assert_eq!(report.skipped_done, 1);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(second.counters.text.load(Ordering::SeqCst), 0);
    assert_eq!(second.counters.render.load(Ordering::SeqCst), 0);
    assert_eq!(second.counters.threshold.load(Ordering::SeqCst), 0);
    assert_eq!(second.counters.detect.load(Ordering::SeqCst), 0);
    assert_eq!(second.counters.engine.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn a_failed_stage_resumes_from_cached_artifacts() {
    let world = World::new();
    world.add_scan("HG_Mut_3099_j1952.pdf");

    let first = fakes(vec![plan_text()], white_symbols(1, 5), EngineMode::Fail);
    let report = cadaref_batch::run(world.config(first.collab)).await.unwrap();
    assert_eq!(report.exit_code(), 1);
    match &report.outcomes[0].status {
        MutationStatus::Failed(FailureReason::Stage { stage, .. }) => {
            assert_eq!(*stage, Stage::Georeferenced)
        }
        other => panic!("unexpected status: {other:?}"),
    }
    // Stage failures are retryable: neither log records the mutation.
    assert_eq!(world.read_log("success"), "");
    assert_eq!(world.read_log("failed"), "");

    let second = fakes(vec![plan_text()], white_symbols(1, 5), EngineMode::Match);
    let report = cadaref_batch::run(world.config(second.collab)).await.unwrap();
    assert_eq!(report.succeeded(), 1);
    assert_eq!(report.skipped_done, 0);

    // Everything up to the matching engine came from the artifact cache.
    assert_eq!(second.counters.text.load(Ordering::SeqCst), 0);
    assert_eq!(second.counters.render.load(Ordering::SeqCst), 0);
    assert_eq!(second.counters.threshold.load(Ordering::SeqCst), 0);
    assert_eq!(second.counters.detect.load(Ordering::SeqCst), 0);
    assert_eq!(second.counters.engine.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unmatched_dossiers_are_filed_as_not_georeferenced() {
    let world = World::new();
    world.add_scan("HG_Mut_3099_j1952.pdf");

    let set = fakes(vec![plan_text()], white_symbols(1, 5), EngineMode::NoMatch);
    let report = cadaref_batch::run(world.config(set.collab)).await.unwrap();

    assert_eq!(report.exit_code(), 1);
    assert_eq!(
        report.outcomes[0].status,
        MutationStatus::Failed(FailureReason::NotGeoreferenced)
    );
    assert!(world.work_path("not_georeferenced/HG3099.tif").is_file());
    assert!(!world.work_path("georeferenced/HG3099.tif").exists());

    let failed = world.read_log("failed");
    let record: serde_json::Value =
        serde_json::from_str(failed.lines().next().unwrap()).unwrap();
    assert_eq!(record["status"], "failed");
    assert_eq!(record["failure"]["reason"], "not_georeferenced");

    // The verdict is final: a rerun does not try again.
    let second = fakes(vec![plan_text()], white_symbols(1, 5), EngineMode::NoMatch);
    let report = cadaref_batch::run(world.config(second.collab)).await.unwrap();
    assert_eq!(report.skipped_done, 1);
    assert_eq!(second.counters.engine.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn frames_without_enough_usable_symbols_fail_terminally() {
    let world = World::new();
    world.add_scan("HG_Mut_3099_j1952.pdf");

    // Three usable symbols plus one black dot: below the floor of four.
    let mut detections = white_symbols(1, 3);
    detections.push(SymbolDetection {
        page: 1,
        x: 0.0,
        y: 0.0,
        symbol: "black_dot".into(),
    });

    let set = fakes(vec![plan_text()], detections, EngineMode::Match);
    let report = cadaref_batch::run(world.config(set.collab)).await.unwrap();

    assert_eq!(
        report.outcomes[0].status,
        MutationStatus::Failed(FailureReason::NotEnoughSymbols)
    );
    assert_eq!(set.counters.engine.load(Ordering::SeqCst), 0);
    // The pipeline stopped before estimating bounds.
    assert!(!world.work_path("bounds/HG3099.geojson").exists());
}

#[tokio::test]
async fn screenshot_frames_never_reach_the_matching_engine() {
    let world = World::new();
    world.add_scan("HG_Mut_3099_j1952.pdf");

    let screenshot_page = "Auszug User: meier\nMassstab 1:500 \n".to_string();
    let mut detections = white_symbols(1, 5);
    detections.extend(white_symbols(2, 5));

    let set = fakes(vec![plan_text(), screenshot_page], detections, EngineMode::Match);
    let report = cadaref_batch::run(world.config(set.collab)).await.unwrap();

    assert!(report.outcomes[0].status.is_success());
    assert_eq!(*set.engine.pages_seen.lock().unwrap(), vec![1]);
}

#[tokio::test]
async fn a_dossier_without_spatial_evidence_fails_as_bounds_not_found() {
    let world = World::new();
    world.add_scan("WO_Mut_15_j1950.pdf");

    // No parcel reference anywhere, and WO15 is unknown to mutations.csv.
    let text = "Kein Plan vorhanden\nMassstab 1:500 \n".to_string();
    let set = fakes(vec![text], white_symbols(1, 5), EngineMode::Match);
    let report = cadaref_batch::run(world.config(set.collab)).await.unwrap();

    assert_eq!(
        report.outcomes[0].status,
        MutationStatus::Failed(FailureReason::BoundsNotFound)
    );
    assert_eq!(set.counters.engine.load(Ordering::SeqCst), 0);
    assert!(!world.work_path("bounds/WO15.geojson").exists());

    let failed = world.read_log("failed");
    let record: serde_json::Value =
        serde_json::from_str(failed.lines().next().unwrap()).unwrap();
    assert_eq!(record["id"], "WO15");
    assert_eq!(record["failure"]["reason"], "bounds_not_found");
}

#[tokio::test]
async fn a_failing_mutation_does_not_disturb_concurrent_ones() {
    let world = World::new();
    world.add_scan("HG_Mut_3099_j1952.pdf");
    world.add_scan("HG_Mut_1000_j1950.pdf");
    world.add_scan("WO_Mut_15_j1950.pdf");

    let mut set = fakes(vec![plan_text()], white_symbols(1, 5), EngineMode::Match);
    set.collab.text = Arc::new(PartKeyedText {
        counters: Arc::clone(&set.counters),
    });

    let report = cadaref_batch::run(world.config(set.collab)).await.unwrap();
    assert_eq!(report.outcomes.len(), 3);
    assert_eq!(report.succeeded(), 2);
    assert_eq!(report.exit_code(), 1);

    let status_of = |id: &str| {
        &report
            .outcomes
            .iter()
            .find(|o| o.id == id)
            .unwrap_or_else(|| panic!("no outcome for {id}"))
            .status
    };
    assert!(status_of("HG3099").is_success());
    assert!(status_of("HG1000").is_success());
    assert_eq!(
        *status_of("WO15"),
        MutationStatus::Failed(FailureReason::BoundsNotFound)
    );

    assert!(world.work_path("georeferenced/HG3099.tif").is_file());
    assert!(world.work_path("georeferenced/HG1000.tif").is_file());
    assert!(!world.work_path("bounds/WO15.geojson").exists());

    // Completion order is up to the scheduler; the ids are not.
    let mut succeeded: Vec<String> = world
        .read_log("success")
        .lines()
        .map(|line| {
            let record: serde_json::Value = serde_json::from_str(line).unwrap();
            record["id"].as_str().unwrap().to_string()
        })
        .collect();
    succeeded.sort();
    assert_eq!(succeeded, ["HG1000", "HG3099"]);

    let failed = world.read_log("failed");
    assert_eq!(failed.lines().count(), 1);
    let record: serde_json::Value = serde_json::from_str(failed.trim_end()).unwrap();
    assert_eq!(record["id"], "WO15");

    assert_eq!(set.counters.text.load(Ordering::SeqCst), 3);
    assert_eq!(set.counters.engine.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn a_raised_stop_flag_leaves_the_queue_untouched() {
    let world = World::new();
    world.add_scan("HG_Mut_3099_j1952.pdf");

    let set = fakes(vec![plan_text()], white_symbols(1, 5), EngineMode::Match);
    let stop = Arc::new(AtomicBool::new(true));
    let config = world
        .builder(set.collab)
        .stop_flag(Arc::clone(&stop))
        .build()
        .unwrap();

    let report = cadaref_batch::run(config).await.unwrap();
    assert!(report.outcomes.is_empty());
    assert_eq!(report.skipped_done, 0);
    assert_eq!(set.counters.text.load(Ordering::SeqCst), 0);
    // Nothing was recorded, so the mutation stays queued for the next run.
    assert_eq!(world.read_log("success"), "");
    assert_eq!(world.read_log("failed"), "");
}

#[tokio::test]
async fn text_extraction_failure_does_not_sink_the_mutation() {
    let world = World::new();
    world.add_scan("HG_Mut_3099_j1952.pdf");

    let mut set = fakes(vec![plan_text()], white_symbols(1, 5), EngineMode::Match);
    set.collab.text = Arc::new(FakeText {
        pages: Vec::new(),
        fail: true,
        counters: Arc::clone(&set.counters),
    });

    let report = cadaref_batch::run(world.config(set.collab)).await.unwrap();
    assert!(report.outcomes[0].status.is_success());
    assert_eq!(set.counters.text.load(Ordering::SeqCst), 1);

    // The degraded text was not cached, so a later run retries extraction.
    assert!(!world.work_path("text/HG3099.txt").exists());

    // Without parcel evidence from the text the window leans on the survey
    // records alone, which leaves every point outside it.
    let points = std::fs::read_to_string(world.work_path("points/HG3099.csv")).unwrap();
    assert_eq!(points.lines().count(), 1);
}

#[tokio::test]
async fn multi_part_dossiers_are_one_work_unit() {
    let world = World::new();
    world.add_scan("HG_Mut_3099_j1952_Teil_1.pdf");
    world.add_scan("HG_Mut_3099_j1952_Teil_2.pdf");

    let mut detections = white_symbols(1, 5);
    detections.extend(white_symbols(2, 5));
    let mut set = fakes(vec![plan_text()], detections, EngineMode::Match);
    // One page per part, two parts: the renderer sees both at once.
    set.collab.renderer = Arc::new(FakeRenderer {
        page_count: 2,
        counters: Arc::clone(&set.counters),
    });
    set.collab.thresholder = Arc::new(FakeThresholder {
        thresholds: vec![140, 140],
        counters: Arc::clone(&set.counters),
    });

    let report = cadaref_batch::run(world.config(set.collab)).await.unwrap();
    assert_eq!(report.outcomes.len(), 1);

    let outcome = &report.outcomes[0];
    assert_eq!(outcome.id, "HG3099");
    assert_eq!(outcome.parts, 2);
    assert!(outcome.status.is_success());
    assert_eq!(set.counters.text.load(Ordering::SeqCst), 2);
    assert_eq!(set.counters.render.load(Ordering::SeqCst), 1);

    let sidecar = std::fs::read(world.work_path("rendered/HG3099.json")).unwrap();
    let frames: Vec<serde_json::Value> = serde_json::from_slice(&sidecar).unwrap();
    assert_eq!(frames.len(), 2);

    // Both frames matched; the second raster gets an index suffix.
    assert_eq!(*set.engine.pages_seen.lock().unwrap(), vec![1, 2]);
    assert!(world.work_path("georeferenced/HG3099.tif").is_file());
    assert!(world.work_path("georeferenced/HG3099_1.tif").is_file());
}
