//! Current and historical survey data.
//!
//! The pipeline consumes one directory of CSV extracts from the cantonal
//! survey database:
//!
//! * `parcels.csv` — current parcels with optional bounding boxes and the
//!   mutation that created them,
//! * `mutations.csv` — known mutations with dates and recovered bounding
//!   boxes,
//! * `border_points.csv`, `fixed_points.csv` — the current point datasets,
//! * `deleted_points.csv` (optional) — historical points that no longer
//!   exist, exported with the original German column headers,
//! * `mutation_dates.csv` (optional) — hand-curated dates for mutations
//!   the database lost track of.
//!
//! Points are folded into one deduplicated list. Where a point number
//! appears both in a current dataset and among the deleted points, the
//! current record wins. Every point carries a validity interval: current
//! points are valid from their creation date onwards, deleted points from
//! the date of the mutation that created them to the date of the mutation
//! that deleted them. Unknown dates leave the interval open at that end.
//!
//! ## Why an R-tree?
//!
//! Candidate point extraction runs one window query per mutation against
//! a few hundred thousand points. A bulk-loaded [`rstar::RTree`] answers
//! those queries in microseconds and is immutable after load, so the
//! whole structure can be shared across worker tasks without locking.

use chrono::{Days, NaiveDate};
use rstar::{RTree, RTreeObject, AABB};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::bounds::BoundingBox;
use crate::error::PipelineError;

// ── Symbol vocabulary ───────────────────────────────────────────────────

/// Cartographic symbol a survey point is drawn with on historical plans.
///
/// The matching engine compares these against the symbols detected in the
/// scanned image, so the names must match the detector's vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointSymbol {
    BlackDot,
    WhiteCircle,
    DoubleWhiteCircle,
    Other,
}

impl PointSymbol {
    pub fn as_str(&self) -> &'static str {
        match self {
            PointSymbol::BlackDot => "black_dot",
            PointSymbol::WhiteCircle => "white_circle",
            PointSymbol::DoubleWhiteCircle => "double_white_circle",
            PointSymbol::Other => "other",
        }
    }

    /// Symbol for a current border point, by marking type. Types outside
    /// the known vocabulary are not drawn as point symbols at all and
    /// yield `None`.
    fn border_type(kind: &str) -> Option<PointSymbol> {
        match kind {
            "unversichert" => Some(PointSymbol::BlackDot),
            "Bolzen" | "Stein" => Some(PointSymbol::WhiteCircle),
            _ => None,
        }
    }

    /// Symbol for a deleted point, by its recorded class.
    fn deleted_class(class: &str) -> PointSymbol {
        match class.trim() {
            "2" => PointSymbol::DoubleWhiteCircle,
            "4" => PointSymbol::WhiteCircle,
            _ => PointSymbol::Other,
        }
    }
}

impl fmt::Display for PointSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Records ─────────────────────────────────────────────────────────────

/// A survey point, current or historical, with its validity interval.
#[derive(Debug, Clone, PartialEq)]
pub struct SurveyPoint {
    pub id: String,
    pub x: f64,
    pub y: f64,
    pub symbol: PointSymbol,
    pub valid_from: Option<NaiveDate>,
    pub valid_until: Option<NaiveDate>,
}

impl SurveyPoint {
    /// Whether this point can plausibly appear on a plan drawn around
    /// `map_date`. `slack_days` widens the interval at both ends to absorb
    /// imprecise dossier dates. An unknown map date keeps every point.
    pub fn valid_around(&self, map_date: Option<NaiveDate>, slack_days: u64) -> bool {
        let Some(date) = map_date else {
            return true;
        };
        let slack = Days::new(slack_days);
        if let Some(from) = self.valid_from {
            let earliest = from.checked_sub_days(slack).unwrap_or(NaiveDate::MIN);
            if date < earliest {
                return false;
            }
        }
        if let Some(until) = self.valid_until {
            let latest = until.checked_add_days(slack).unwrap_or(NaiveDate::MAX);
            if date > latest {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone)]
struct MutationRecord {
    date: Option<NaiveDate>,
    bbox: Option<BoundingBox>,
}

/// Entry in the spatial index, pointing back into the point list.
struct PointHandle {
    slot: usize,
    position: [f64; 2],
}

impl RTreeObject for PointHandle {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point(self.position)
    }
}

// ── CSV row shapes ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ParcelRow {
    parcel: String,
    min_x: Option<f64>,
    max_x: Option<f64>,
    min_y: Option<f64>,
    max_y: Option<f64>,
    created_by: String,
}

#[derive(Debug, Deserialize)]
struct MutationRow {
    mutation: String,
    date: Option<NaiveDate>,
    min_x: Option<f64>,
    max_x: Option<f64>,
    min_y: Option<f64>,
    max_y: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct BorderPointRow {
    point: String,
    #[serde(rename = "type")]
    kind: String,
    x: f64,
    y: f64,
    created: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
struct FixedPointRow {
    point: String,
    x: f64,
    y: f64,
    created: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
struct DeletedPointRow {
    #[serde(rename = "Punktnummer")]
    point: String,
    #[serde(rename = "Kl")]
    class: String,
    #[serde(rename = "X [LV95]")]
    x: Option<f64>,
    #[serde(rename = "Y [LV95]")]
    y: Option<f64>,
    #[serde(rename = "Erstellmutation")]
    created_by: String,
    #[serde(rename = "Löschmutation")]
    deleted_by: String,
}

#[derive(Debug, Deserialize)]
struct MutationDateRow {
    mutation: String,
    date: NaiveDate,
}

fn bbox_from_columns(
    min_x: Option<f64>,
    max_x: Option<f64>,
    min_y: Option<f64>,
    max_y: Option<f64>,
) -> Option<BoundingBox> {
    match (min_x, max_x, min_y, max_y) {
        (Some(min_x), Some(max_x), Some(min_y), Some(max_y)) => {
            Some(BoundingBox::new(min_x, min_y, max_x, max_y))
        }
        _ => None,
    }
}

// ── Loading ─────────────────────────────────────────────────────────────

/// In-memory survey database, immutable after [`SurveyData::load`].
pub struct SurveyData {
    parcels: HashMap<String, Option<BoundingBox>>,
    /// Mutation id to the parcels it created (only those with a bbox).
    created_parcels: HashMap<String, Vec<(String, BoundingBox)>>,
    mutations: HashMap<String, MutationRecord>,
    date_overrides: HashMap<String, NaiveDate>,
    points: Vec<SurveyPoint>,
    index: RTree<PointHandle>,
}

fn read_rows<T: for<'de> Deserialize<'de>>(
    name: &'static str,
    path: &Path,
) -> Result<Vec<T>, PipelineError> {
    let malformed = |detail: String| PipelineError::DatasetMalformed {
        name,
        path: path.to_path_buf(),
        detail,
    };
    let mut reader = csv::Reader::from_path(path).map_err(|e| malformed(e.to_string()))?;
    let mut rows = Vec::new();
    for row in reader.deserialize() {
        rows.push(row.map_err(|e| malformed(e.to_string()))?);
    }
    Ok(rows)
}

fn required(survey_dir: &Path, name: &'static str) -> Result<PathBuf, PipelineError> {
    let path = survey_dir.join(name);
    if !path.is_file() {
        return Err(PipelineError::DatasetMissing { name, path });
    }
    Ok(path)
}

impl SurveyData {
    /// Load every dataset from `survey_dir`. The four core files are
    /// required; `mutation_dates.csv` is used when present. The deleted
    /// points come from `deleted_points` when given (and must exist
    /// then), otherwise from `deleted_points.csv` in `survey_dir` when
    /// present.
    pub fn load(
        survey_dir: &Path,
        deleted_points: Option<&Path>,
    ) -> Result<SurveyData, PipelineError> {
        let parcel_rows: Vec<ParcelRow> =
            read_rows("parcels.csv", &required(survey_dir, "parcels.csv")?)?;
        let mutation_rows: Vec<MutationRow> =
            read_rows("mutations.csv", &required(survey_dir, "mutations.csv")?)?;
        let border_rows: Vec<BorderPointRow> =
            read_rows("border_points.csv", &required(survey_dir, "border_points.csv")?)?;
        let fixed_rows: Vec<FixedPointRow> =
            read_rows("fixed_points.csv", &required(survey_dir, "fixed_points.csv")?)?;

        let deleted_rows: Vec<DeletedPointRow> = match deleted_points {
            Some(path) => {
                if !path.is_file() {
                    return Err(PipelineError::DatasetMissing {
                        name: "deleted_points.csv",
                        path: path.to_path_buf(),
                    });
                }
                read_rows("deleted_points.csv", path)?
            }
            None => {
                let path = survey_dir.join("deleted_points.csv");
                if path.is_file() {
                    read_rows("deleted_points.csv", &path)?
                } else {
                    debug!(path = %path.display(), "no deleted points dataset");
                    Vec::new()
                }
            }
        };

        let overrides_path = survey_dir.join("mutation_dates.csv");
        let override_rows: Vec<MutationDateRow> = if overrides_path.is_file() {
            read_rows("mutation_dates.csv", &overrides_path)?
        } else {
            Vec::new()
        };

        let mut parcels = HashMap::new();
        let mut created_parcels: HashMap<String, Vec<(String, BoundingBox)>> = HashMap::new();
        for row in parcel_rows {
            let bbox = bbox_from_columns(row.min_x, row.max_x, row.min_y, row.max_y);
            if let Some(bbox) = bbox {
                created_parcels
                    .entry(row.created_by)
                    .or_default()
                    .push((row.parcel.clone(), bbox));
            }
            parcels.insert(row.parcel, bbox);
        }
        for list in created_parcels.values_mut() {
            list.sort_by(|(a, _), (b, _)| a.cmp(b));
        }

        let mut mutations = HashMap::new();
        for row in mutation_rows {
            let bbox = bbox_from_columns(row.min_x, row.max_x, row.min_y, row.max_y);
            mutations.insert(
                row.mutation,
                MutationRecord {
                    date: row.date,
                    bbox,
                },
            );
        }

        let date_overrides: HashMap<String, NaiveDate> = override_rows
            .into_iter()
            .map(|row| (row.mutation, row.date))
            .collect();

        let mut points: Vec<SurveyPoint> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for row in border_rows {
            let Some(symbol) = PointSymbol::border_type(&row.kind) else {
                continue;
            };
            if seen.insert(row.point.clone()) {
                points.push(SurveyPoint {
                    id: row.point,
                    x: row.x,
                    y: row.y,
                    symbol,
                    valid_from: row.created,
                    valid_until: None,
                });
            }
        }
        for row in fixed_rows {
            if seen.insert(row.point.clone()) {
                points.push(SurveyPoint {
                    id: row.point,
                    x: row.x,
                    y: row.y,
                    symbol: PointSymbol::DoubleWhiteCircle,
                    valid_from: row.created,
                    valid_until: None,
                });
            }
        }
        let recorded_date = |mutation: &str| -> Option<NaiveDate> {
            if mutation.is_empty() {
                return None;
            }
            mutations.get(mutation).and_then(|m| m.date)
        };
        for row in deleted_rows {
            let (Some(x), Some(y)) = (row.x, row.y) else {
                continue;
            };
            if seen.insert(row.point.clone()) {
                points.push(SurveyPoint {
                    id: row.point,
                    x,
                    y,
                    symbol: PointSymbol::deleted_class(&row.class),
                    valid_from: recorded_date(&row.created_by),
                    valid_until: recorded_date(&row.deleted_by),
                });
            }
        }

        let handles: Vec<PointHandle> = points
            .iter()
            .enumerate()
            .map(|(slot, p)| PointHandle {
                slot,
                position: [p.x, p.y],
            })
            .collect();
        let index = RTree::bulk_load(handles);

        debug!(
            parcels = parcels.len(),
            mutations = mutations.len(),
            points = points.len(),
            overrides = date_overrides.len(),
            "survey data loaded"
        );

        Ok(SurveyData {
            parcels,
            created_parcels,
            mutations,
            date_overrides,
            points,
            index,
        })
    }

    // ── Lookups ─────────────────────────────────────────────────────────

    /// Bounding box of a current parcel, if the parcel exists and the
    /// survey data has coordinates for it.
    pub fn parcel_bbox(&self, parcel: &str) -> Option<BoundingBox> {
        self.parcels.get(parcel).copied().flatten()
    }

    /// Parcels created by the given mutation, with their boxes, ordered
    /// by parcel id.
    pub fn parcels_created_by(&self, mutation: &str) -> Vec<(String, BoundingBox)> {
        self.created_parcels
            .get(mutation)
            .cloned()
            .unwrap_or_default()
    }

    /// Recovered bounding box of the mutation itself, if any.
    pub fn mutation_bbox(&self, mutation: &str) -> Option<BoundingBox> {
        self.mutations.get(mutation).and_then(|m| m.bbox)
    }

    /// Best known date for a mutation: the survey database first, then
    /// the curated overrides.
    pub fn mutation_date(&self, mutation: &str) -> Option<NaiveDate> {
        self.mutations
            .get(mutation)
            .and_then(|m| m.date)
            .or_else(|| self.date_overrides.get(mutation).copied())
    }

    pub fn point_count(&self) -> usize {
        self.points.len()
    }

    /// All points inside the window, ordered by point id.
    pub fn points_within(&self, bbox: &BoundingBox) -> Vec<&SurveyPoint> {
        let envelope = AABB::from_corners([bbox.min_x, bbox.min_y], [bbox.max_x, bbox.max_y]);
        let mut found: Vec<&SurveyPoint> = self
            .index
            .locate_in_envelope(&envelope)
            .map(|handle| &self.points[handle.slot])
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        found
    }
}
