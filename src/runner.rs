//! The stage orchestrator: drives each mutation through the pipeline and
//! schedules mutations across worker tasks.
//!
//! One mutation moves strictly forward through the stages of
//! [`Stage::ALL`]. Before executing a stage the driver consults the work
//! directory; a valid artifact means the stage already ran in an earlier
//! invocation and is skipped, which is what makes a killed run resumable
//! by simply starting it again. Failures stay inside the mutation that
//! caused them: evidentiary dead ends become terminal
//! [`FailureReason`]s, collaborator trouble becomes a retryable
//! `Stage` failure, and neither ever aborts the run as a whole.
//!
//! Scheduling is plain `buffer_unordered` over the queued mutations.
//! Every mutation is independent (it owns its artifacts and a private
//! scratch directory), so the only shared state is the read-only survey
//! data and the append-only run logs.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::bounds::{bbox_from_geojson, estimate_bounds, parcels_in_text, BoundingBox};
use crate::cache::{artifact_ok, load_artifact, ArtifactKind, WorkDir};
use crate::collab::{Collaborators, FrameSource, MatchOutcome, THRESHOLD_DPI};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, StageError};
use crate::mutation::{group_scans, Mutation};
use crate::page::{
    is_screenshot, plan_frames, split_page_texts, text_for, PageInfo, SourceGeometry,
    PAGE_SEPARATOR,
};
use crate::points::{self, candidate_points};
use crate::progress::ProgressCallback;
use crate::report::{load_done_set, MutationOutcome, RunLog, RunReport};
use crate::scale::{max_distance_limit_m, ResolvedScale, ScaleResolver};
use crate::status::{FailureReason, MutationStatus, Stage};
use crate::survey::SurveyData;
use crate::symbols::{self, candidate_frames, SymbolDetection, MIN_USABLE_SYMBOLS};

/// Everything the worker tasks share. Read-only during the run, except
/// for the run logs which append under their own locks.
struct RunContext {
    work: WorkDir,
    survey: SurveyData,
    collab: Collaborators,
    resolver: ScaleResolver,
    dpi: u32,
    date_slack_days: u64,
    log: RunLog,
    progress: ProgressCallback,
    stop: Option<Arc<AtomicBool>>,
}

impl RunContext {
    fn stopped(&self) -> bool {
        self.stop
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }
}

/// Run the whole pipeline: group the scans, skip mutations a previous run
/// already finished, and process the rest concurrently.
///
/// `Err` means a run-level fault (unreadable inputs, unwritable logs).
/// Per-mutation failures never surface here; they are folded into the
/// returned [`RunReport`].
pub async fn run(config: PipelineConfig) -> Result<RunReport, PipelineError> {
    let progress = config.progress();
    let collab = config.collaborators();

    let survey = SurveyData::load(&config.survey_data_dir, config.deleted_points.as_deref())?;
    info!(points = survey.point_count(), "survey data loaded");

    let work = WorkDir::create(&config.work_dir).await?;
    let log = RunLog::open(&work).await?;
    let done = load_done_set(&work).await?;

    let grouped = group_scans(&config.scans_dir)?;
    let total = grouped.mutations.len();
    let queued = queued_mutations(grouped.mutations, &done);
    let skipped_done = total - queued.len();
    info!(
        total,
        queued = queued.len(),
        skipped_done,
        unrecognized = grouped.unrecognized.len(),
        "scans grouped"
    );

    progress.on_run_start(queued.len());

    let workers = config.workers.max(1);
    let ctx = Arc::new(RunContext {
        work,
        survey,
        collab,
        resolver: ScaleResolver::new(config.fallback_scales.clone()),
        dpi: config.dpi,
        date_slack_days: config.date_slack_days,
        log,
        progress: Arc::clone(&progress),
        stop: config.stop_flag.clone(),
    });

    let mut tasks = stream::iter(queued.into_iter().map(|mutation| {
        let ctx = Arc::clone(&ctx);
        async move { process_one(&ctx, mutation).await }
    }))
    .buffer_unordered(workers);

    let mut outcomes = Vec::new();
    while let Some(processed) = tasks.next().await {
        if let Some(outcome) = processed? {
            outcomes.push(outcome);
        }
    }

    let succeeded = outcomes.iter().filter(|o| o.status.is_success()).count();
    progress.on_run_complete(outcomes.len(), succeeded);
    info!(processed = outcomes.len(), succeeded, "run complete");

    Ok(RunReport {
        outcomes,
        skipped_done,
        unrecognized: grouped.unrecognized,
    })
}

fn queued_mutations(mutations: Vec<Mutation>, done: &HashSet<String>) -> Vec<Mutation> {
    mutations
        .into_iter()
        .filter(|m| {
            if done.contains(&m.id) {
                debug!(id = %m.id, "already recorded, skipping");
                false
            } else {
                true
            }
        })
        .collect()
}

/// Process one mutation end to end, honouring the stop flag and recording
/// the terminal outcome. `Ok(None)` means the mutation was left queued
/// because a stop was requested before it started.
async fn process_one(
    ctx: &RunContext,
    mutation: Mutation,
) -> Result<Option<MutationOutcome>, PipelineError> {
    if ctx.stopped() {
        debug!(id = %mutation.id, "stop requested, leaving mutation queued");
        return Ok(None);
    }
    ctx.progress.on_mutation_start(&mutation.id);

    let outcome = drive_mutation(ctx, &mutation).await;
    match &outcome.status {
        MutationStatus::Failed(reason) if reason.is_terminal() => {
            warn!(id = %outcome.id, %reason, "mutation failed")
        }
        MutationStatus::Failed(reason) => {
            warn!(id = %outcome.id, %reason, "stage failed, mutation will be retried next run")
        }
        status => info!(id = %outcome.id, %status, "mutation done"),
    }

    ctx.log.record(&outcome).await?;
    ctx.progress.on_mutation_complete(&outcome.id, &outcome.status);
    Ok(Some(outcome))
}

fn stage_failure(stage: Stage, err: &StageError) -> FailureReason {
    FailureReason::Stage {
        stage,
        detail: err.to_string(),
    }
}

/// Walk one mutation through every stage. Infallible by design: all
/// failures end up in the returned outcome's status.
async fn drive_mutation(ctx: &RunContext, mutation: &Mutation) -> MutationOutcome {
    let mut outcome = MutationOutcome::new(&mutation.id, mutation.parts.len());

    let scratch = ctx.work.mutation_scratch(&mutation.id);
    if let Err(e) = reset_scratch(&scratch).await {
        outcome.status = MutationStatus::Failed(stage_failure(Stage::Grouped, &e));
        return outcome;
    }
    outcome.status.advance(Stage::Grouped);

    if let Err(reason) = run_stages(ctx, mutation, &scratch, &mut outcome).await {
        outcome.status = MutationStatus::Failed(reason);
    }

    if let Err(e) = fs::remove_dir_all(&scratch).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(id = %mutation.id, error = %e, "could not remove mutation scratch directory");
        }
    }
    outcome
}

async fn reset_scratch(scratch: &Path) -> Result<(), StageError> {
    match fs::remove_dir_all(scratch).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(StageError::io(scratch, e)),
    }
    fs::create_dir_all(scratch)
        .await
        .map_err(|e| StageError::io(scratch, e))
}

async fn run_stages(
    ctx: &RunContext,
    mutation: &Mutation,
    scratch: &Path,
    outcome: &mut MutationOutcome,
) -> Result<(), FailureReason> {
    let id = &mutation.id;

    let text = stage_text(ctx, mutation, outcome)
        .await
        .map_err(|e| stage_failure(Stage::TextExtracted, &e))?;
    outcome.status.advance(Stage::TextExtracted);
    let texts = split_page_texts(&text);

    let frames = stage_render(ctx, mutation, &texts, scratch, outcome)
        .await
        .map_err(|e| stage_failure(Stage::Rendered, &e))?;
    outcome.status.advance(Stage::Rendered);

    stage_threshold(ctx, id, &frames, scratch, outcome)
        .await
        .map_err(|e| stage_failure(Stage::Thresholded, &e))?;
    outcome.status.advance(Stage::Thresholded);

    // Both judgements are pure functions of the text artifact and the
    // frame plan, so they are re-derived rather than cached.
    let screenshots: Vec<bool> = frames
        .iter()
        .map(|f| is_screenshot(text_for(&texts, f)))
        .collect();
    outcome.status.advance(Stage::ScreenshotsFlagged);

    let scales: Vec<ResolvedScale> = frames
        .iter()
        .map(|f| ctx.resolver.resolve(f.text_index, &texts))
        .collect();
    outcome.status.advance(Stage::ScaleResolved);

    let detections = stage_symbols(ctx, id, &frames, outcome)
        .await
        .map_err(|e| stage_failure(Stage::SymbolsDetected, &e))?;
    outcome.status.advance(Stage::SymbolsDetected);

    let candidates = matching_candidates(&detections, &screenshots, frames.len());
    if candidates.is_empty() {
        return Err(FailureReason::NotEnoughSymbols);
    }
    debug!(id = %id, frames = ?candidates, "candidate frames selected");

    let limit = search_limit(&candidates, &scales, &frames);
    let window = stage_bounds(ctx, mutation, &text, limit, outcome)
        .await
        .map_err(|e| stage_failure(Stage::BoundsEstimated, &e))?
        .ok_or(FailureReason::BoundsNotFound)?;
    outcome.status.advance(Stage::BoundsEstimated);

    let map_date = ctx.survey.mutation_date(id).or(mutation.date);
    stage_points(ctx, id, &window, map_date, outcome)
        .await
        .map_err(|e| stage_failure(Stage::PointsExtracted, &e))?;
    outcome.status.advance(Stage::PointsExtracted);

    let matches = stage_georef(ctx, id, &candidates, &scales, &detections, scratch, outcome)
        .await
        .map_err(|e| stage_failure(Stage::Georeferenced, &e))?;
    if matches == 0 {
        return Err(FailureReason::NotGeoreferenced);
    }
    outcome.status.advance(Stage::Georeferenced);
    Ok(())
}

// ── Frame selection ───────────────────────────────────────────────────────

/// Frames worth handing to the matching engine: enough usable symbols,
/// not a screenshot, and actually present in the frame plan.
fn matching_candidates(
    detections: &[SymbolDetection],
    screenshots: &[bool],
    frame_count: usize,
) -> Vec<u32> {
    candidate_frames(detections, MIN_USABLE_SYMBOLS)
        .into_iter()
        .filter(|&page| page >= 1 && page as usize <= frame_count)
        .filter(|&page| !screenshots.get(page as usize - 1).copied().unwrap_or(false))
        .collect()
}

/// The search-window diagonal: the largest distance limit across the
/// candidate frames and their candidate scales.
fn search_limit(candidates: &[u32], scales: &[ResolvedScale], frames: &[PageInfo]) -> f64 {
    candidates
        .iter()
        .map(|&page| {
            let i = page as usize - 1;
            max_distance_limit_m(&scales[i], &frames[i])
        })
        .fold(0.0, f64::max)
}

// ── Stages ────────────────────────────────────────────────────────────────

/// Extract the text layer of every part, joined with form feeds.
///
/// A part whose extraction fails does not fail the mutation: the pages
/// collected so far keep their alignment and the rest of the dossier
/// reads as empty text. The artifact is only persisted when every part
/// extracted, so the next run retries a degraded dossier.
async fn stage_text(
    ctx: &RunContext,
    mutation: &Mutation,
    outcome: &mut MutationOutcome,
) -> Result<String, StageError> {
    let path = ctx.work.text_path(&mutation.id);
    if let Some(bytes) = load_artifact(&path, ArtifactKind::Text).await {
        return Ok(String::from_utf8_lossy(&bytes).into_owned());
    }

    let started = Instant::now();
    let mut pages: Vec<String> = Vec::new();
    let mut complete = true;
    for part in &mutation.parts {
        match ctx.collab.text.extract_pages(part).await {
            Ok(part_pages) => pages.extend(part_pages),
            Err(e) => {
                warn!(
                    id = %mutation.id,
                    part = %part.display(),
                    error = %e,
                    "text extraction failed, continuing with the pages extracted so far"
                );
                complete = false;
                break;
            }
        }
    }
    let text = pages.join(&PAGE_SEPARATOR.to_string());
    if complete {
        ctx.work.store(&path, text.as_bytes()).await?;
    }
    outcome
        .timings
        .insert(Stage::TextExtracted, started.elapsed().as_secs_f64());
    Ok(text)
}

/// Render the dossier into the multi-frame TIFF plus its frame sidecar.
///
/// The sidecar is authoritative for resumed runs: it records how pages
/// were split when the raster was built, so later stages never re-derive
/// the plan against a raster from a previous run.
async fn stage_render(
    ctx: &RunContext,
    mutation: &Mutation,
    texts: &[&str],
    scratch: &Path,
    outcome: &mut MutationOutcome,
) -> Result<Vec<PageInfo>, StageError> {
    let tif_path = ctx.work.rendered_path(&mutation.id);
    let info_path = ctx.work.render_info_path(&mutation.id);
    if artifact_ok(&tif_path, ArtifactKind::Tiff).await {
        if let Some(bytes) = load_artifact(&info_path, ArtifactKind::Json).await {
            match serde_json::from_slice::<Vec<PageInfo>>(&bytes) {
                Ok(frames) if !frames.is_empty() => return Ok(frames),
                Ok(_) => {
                    warn!(id = %mutation.id, "frame sidecar lists no frames, re-rendering")
                }
                Err(e) => {
                    warn!(id = %mutation.id, error = %e, "unusable frame sidecar, re-rendering")
                }
            }
        }
    }

    let started = Instant::now();
    let pages_scratch = scratch.join("render");
    fs::create_dir_all(&pages_scratch)
        .await
        .map_err(|e| StageError::io(&pages_scratch, e))?;

    let sources = ctx
        .collab
        .renderer
        .render_parts(&mutation.parts, ctx.dpi, &pages_scratch)
        .await?;
    let geometries: Vec<SourceGeometry> = sources
        .iter()
        .map(|s| SourceGeometry {
            width_px: s.width_px,
            height_px: s.height_px,
            dpi: ctx.dpi,
        })
        .collect();
    let plan = plan_frames(&geometries, texts);
    let frame_sources: Vec<FrameSource> = plan
        .iter()
        .map(|f| FrameSource {
            page: sources[f.source].path.clone(),
            crop: f.crop,
        })
        .collect();

    let assembled = scratch.join("rendered.tif");
    ctx.collab
        .renderer
        .assemble(&frame_sources, mutation.date, &pages_scratch, &assembled)
        .await?;

    let frames: Vec<PageInfo> = plan.into_iter().map(|f| f.info).collect();
    let sidecar = serde_json::to_vec_pretty(&frames).map_err(|e| {
        StageError::io(
            &info_path,
            std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        )
    })?;
    ctx.work.promote(&assembled, &tif_path).await?;
    ctx.work.store(&info_path, &sidecar).await?;
    outcome
        .timings
        .insert(Stage::Rendered, started.elapsed().as_secs_f64());
    Ok(frames)
}

/// Otsu underestimates on faded plans whose histogram is dominated by
/// yellowed paper; nudging low values up keeps the line work connected.
fn adjust_threshold(otsu: u8) -> u8 {
    if otsu < 110 {
        otsu.saturating_add(15)
    } else {
        otsu
    }
}

async fn stage_threshold(
    ctx: &RunContext,
    id: &str,
    frames: &[PageInfo],
    scratch: &Path,
    outcome: &mut MutationOutcome,
) -> Result<(), StageError> {
    let path = ctx.work.thresholded_path(id);
    if artifact_ok(&path, ArtifactKind::Tiff).await {
        return Ok(());
    }

    let started = Instant::now();
    let rendered = ctx.work.rendered_path(id);
    let measured = ctx.collab.thresholder.measure(&rendered).await?;
    if measured.len() != frames.len() {
        return Err(StageError::MalformedOutput {
            tool: "cadaref-threshold",
            detail: format!("{} thresholds for {} frames", measured.len(), frames.len()),
        });
    }
    let thresholds: Vec<u8> = measured.into_iter().map(adjust_threshold).collect();
    debug!(id = %id, thresholds = ?thresholds, "binarising");

    let binarised = scratch.join("thresholded.tif");
    ctx.collab
        .thresholder
        .binarize(&rendered, &thresholds, &binarised)
        .await?;
    ctx.work.promote(&binarised, &path).await?;
    outcome
        .timings
        .insert(Stage::Thresholded, started.elapsed().as_secs_f64());
    Ok(())
}

async fn stage_symbols(
    ctx: &RunContext,
    id: &str,
    frames: &[PageInfo],
    outcome: &mut MutationOutcome,
) -> Result<Vec<SymbolDetection>, StageError> {
    let path = ctx.work.symbols_path(id);
    if let Some(bytes) = load_artifact(&path, ArtifactKind::Csv).await {
        match symbols::from_csv_bytes(&bytes) {
            Ok(detections) => return Ok(detections),
            Err(detail) => warn!(id = %id, %detail, "unusable symbols artifact, re-detecting"),
        }
    }

    let started = Instant::now();
    let thresholded = ctx.work.thresholded_path(id);
    let mut detections = Vec::new();
    for frame in frames {
        let coord_scale = frame.dpi as f64 / THRESHOLD_DPI as f64;
        let found = ctx
            .collab
            .detector
            .detect(&thresholded, frame.index, coord_scale)
            .await?;
        detections.extend(found);
    }
    ctx.work
        .store(&path, &symbols::to_csv_bytes(&detections))
        .await?;
    outcome
        .timings
        .insert(Stage::SymbolsDetected, started.elapsed().as_secs_f64());
    Ok(detections)
}

/// Estimate the search window. `Ok(None)` means no evidence anywhere,
/// which the caller turns into `BoundsNotFound`.
async fn stage_bounds(
    ctx: &RunContext,
    mutation: &Mutation,
    text: &str,
    limit: f64,
    outcome: &mut MutationOutcome,
) -> Result<Option<BoundingBox>, StageError> {
    let path = ctx.work.bounds_path(&mutation.id);
    if let Some(bytes) = load_artifact(&path, ArtifactKind::Json).await {
        match bbox_from_geojson(&bytes) {
            Ok(bbox) => return Ok(Some(bbox)),
            Err(detail) => {
                warn!(id = %mutation.id, %detail, "unusable bounds artifact, re-estimating")
            }
        }
    }

    let started = Instant::now();
    let mut parcels = parcels_in_text(text);
    parcels.extend(mutation.path_parcels());
    let Some(estimate) = estimate_bounds(&ctx.survey, &mutation.id, &parcels, limit) else {
        return Ok(None);
    };
    debug!(
        id = %mutation.id,
        evidence = estimate.evidence.len(),
        "bounds estimated"
    );
    let geojson = serde_json::to_vec_pretty(&estimate.to_geojson()).map_err(|e| {
        StageError::io(&path, std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    })?;
    ctx.work.store(&path, &geojson).await?;
    outcome
        .timings
        .insert(Stage::BoundsEstimated, started.elapsed().as_secs_f64());
    Ok(Some(estimate.bbox))
}

async fn stage_points(
    ctx: &RunContext,
    id: &str,
    window: &BoundingBox,
    map_date: Option<chrono::NaiveDate>,
    outcome: &mut MutationOutcome,
) -> Result<(), StageError> {
    let path = ctx.work.points_path(id);
    if load_artifact(&path, ArtifactKind::Csv).await.is_some() {
        return Ok(());
    }

    let started = Instant::now();
    let candidates = candidate_points(&ctx.survey, window, map_date, ctx.date_slack_days);
    debug!(id = %id, count = candidates.len(), "candidate points selected");
    ctx.work
        .store(&path, &points::to_csv_bytes(&candidates))
        .await?;
    outcome
        .timings
        .insert(Stage::PointsExtracted, started.elapsed().as_secs_f64());
    Ok(())
}

/// Offer every candidate frame to the matching engine and promote each
/// match into the output directory. Returns the number of matches; zero
/// routes the rendered raster to `not_georeferenced/`.
async fn stage_georef(
    ctx: &RunContext,
    id: &str,
    candidates: &[u32],
    scales: &[ResolvedScale],
    detections: &[SymbolDetection],
    scratch: &Path,
    outcome: &mut MutationOutcome,
) -> Result<usize, StageError> {
    let started = Instant::now();
    let rendered = ctx.work.rendered_path(id);
    let points_csv = ctx.work.points_path(id);

    let mut matches = 0usize;
    for &page in candidates {
        let resolved = &scales[page as usize - 1];
        let frame_symbols = symbols::for_frame(detections, page);
        let symbols_csv = scratch.join(format!("symbols-{page}.csv"));
        fs::write(&symbols_csv, symbols::to_engine_csv_bytes(&frame_symbols))
            .await
            .map_err(|e| StageError::io(&symbols_csv, e))?;

        let output = scratch.join(format!("match-{page}.tif"));
        let matched = ctx
            .collab
            .engine
            .match_frame(
                &rendered,
                page,
                resolved.candidates(),
                &symbols_csv,
                &points_csv,
                &output,
            )
            .await?;
        match matched {
            MatchOutcome::Matched => {
                let dest = ctx.work.georeferenced_path(id, matches);
                ctx.work.promote(&output, &dest).await?;
                matches += 1;
                info!(id = %id, page, "frame georeferenced");
            }
            MatchOutcome::NoMatch => debug!(id = %id, page, "no match on frame"),
        }
    }

    if matches == 0 {
        let dest = ctx.work.not_georeferenced_path(id);
        fs::copy(&rendered, &dest)
            .await
            .map_err(|e| StageError::io(&dest, e))?;
    }
    outcome
        .timings
        .insert(Stage::Georeferenced, started.elapsed().as_secs_f64());
    Ok(matches)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn a4_frame(index: u32) -> PageInfo {
        PageInfo {
            index,
            text_index: index,
            width_px: 2480,
            height_px: 3508,
            dpi: 300,
            split: false,
        }
    }

    fn white(page: u32, n: usize) -> Vec<SymbolDetection> {
        (0..n)
            .map(|i| SymbolDetection {
                page,
                x: i as f64,
                y: 0.0,
                symbol: "white_circle".into(),
            })
            .collect()
    }

    #[test]
    fn low_otsu_values_are_nudged_up() {
        assert_eq!(adjust_threshold(80), 95);
        assert_eq!(adjust_threshold(109), 124);
        assert_eq!(adjust_threshold(110), 110);
        assert_eq!(adjust_threshold(200), 200);
        assert_eq!(adjust_threshold(250), 255);
    }

    #[test]
    fn screenshots_are_never_candidates() {
        let mut detections = white(1, 5);
        detections.extend(white(2, 5));
        detections.extend(white(3, 3));

        // Frame 2 is a screenshot; frame 3 is short of symbols.
        let candidates = matching_candidates(&detections, &[false, true, false], 3);
        assert_eq!(candidates, [1]);

        // Stale detections for frames beyond the plan are dropped.
        let candidates = matching_candidates(&detections, &[false, false], 2);
        assert_eq!(candidates, [1, 2]);
    }

    #[test]
    fn search_limit_takes_the_largest_candidate_scale() {
        let frames = [a4_frame(1), a4_frame(2)];
        let scales = [
            ResolvedScale::Exact(1000),
            ResolvedScale::Fallback(vec![200, 500]),
        ];

        // A4 at 300 dpi and 1:1000 depicts 210 m x 297 m.
        let limit = search_limit(&[1], &scales, &frames);
        let expected = (210.0_f64.powi(2) + 297.0_f64.powi(2)).sqrt();
        assert!((limit - expected).abs() < 0.1, "limit = {limit}");

        // The fallback frame is bounded by its largest scale, 1:500.
        let limit = search_limit(&[2], &scales, &frames);
        assert!((limit - expected / 2.0).abs() < 0.1, "limit = {limit}");

        // Across both frames the larger one wins.
        let limit = search_limit(&[1, 2], &scales, &frames);
        assert!((limit - expected).abs() < 0.1, "limit = {limit}");
    }
}
