//! Approximate location estimation for a mutation.
//!
//! The matching engine cannot search the whole city: the point set would be
//! huge and wildly wrong matches become likely. So every mutation first gets
//! an approximate bounding box, assembled from three evidence sources, in
//! this order:
//!
//! 1. parcels whose number was recognised in the dossier's text or file
//!    names and that still exist in the current survey data;
//! 2. parcels recorded as *created by* this mutation (a mutation that
//!    created a parcel which still exists has left a direct trace);
//! 3. the mutation's own bounding box in `mutations.csv`, when the survey
//!    data recovered one from historical records.
//!
//! The union of all evidence is then grown, centred on itself, until its
//! diagonal reaches the page distance limit: a single surviving parcel may
//! sit anywhere on the plan, so the search window must admit the whole
//! depicted area around it. No evidence at all is a terminal dead end
//! (`BoundsNotFound`).
//!
//! The estimate is persisted as a small GeoJSON FeatureCollection carrying
//! the grown `bbox`, the CRS tag, and one rectangle feature per piece of
//! evidence, which makes the guesses easy to inspect in any GIS viewer.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::BTreeSet;

use crate::survey::SurveyData;

/// Planar coordinate reference system of all survey data (LV95).
pub const CRS_URN: &str = "urn:ogc:def:crs:EPSG::2056";

/// Parcel references in OCR text: either the five-digit city-wide numbers
/// (they start with 2 or 3) or a neighbourhood code plus short number.
static TEXT_PARCEL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b([23]\d{4}|(?:AA|AF|AL|AR|AU|EN|FL|HG|HI|HO|LE|OB|OE|RI|SE|SW|UN|WD|WI|WO|WP)\d{1,4})\b",
    )
    .unwrap()
});

/// An axis-aligned box in LV95 metres.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BoundingBox {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        BoundingBox {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    pub fn center(&self) -> (f64, f64) {
        (
            self.min_x + self.width() / 2.0,
            self.min_y + self.height() / 2.0,
        )
    }

    pub fn diagonal(&self) -> f64 {
        self.width().hypot(self.height())
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }

    /// Smallest box covering both.
    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox {
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }

    /// Grow the box, keeping its centre, until the diagonal is at least
    /// `min_diagonal` metres. A box already large enough is returned
    /// unchanged; a degenerate (point-like) box becomes a square with
    /// exactly that diagonal. Never shrinks.
    pub fn grow_to_diagonal(&self, min_diagonal: f64) -> BoundingBox {
        let diagonal = self.diagonal();
        if diagonal >= min_diagonal {
            return *self;
        }
        let (cx, cy) = self.center();
        let (half_w, half_h) = if diagonal > 0.0 {
            let factor = min_diagonal / diagonal;
            (self.width() / 2.0 * factor, self.height() / 2.0 * factor)
        } else {
            let half = min_diagonal / (2.0 * std::f64::consts::SQRT_2);
            (half, half)
        };
        BoundingBox {
            min_x: cx - half_w,
            min_y: cy - half_h,
            max_x: cx + half_w,
            max_y: cy + half_h,
        }
    }
}

/// Parcel references recognised in dossier text.
pub fn parcels_in_text(text: &str) -> BTreeSet<String> {
    TEXT_PARCEL_RE
        .captures_iter(text)
        .map(|c| c[1].to_owned())
        .collect()
}

/// The estimated location of a mutation: the grown search window plus the
/// evidence rectangles it was derived from.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundsEstimate {
    pub bbox: BoundingBox,
    /// `(feature id, rectangle)` per evidence source, deterministic order.
    pub evidence: Vec<(String, BoundingBox)>,
}

/// Estimate the bounds of `mutation_id` from recognised parcels and the
/// survey data, growing the union to `distance_limit_m`.
///
/// `None` means not a single piece of evidence matched; the mutation ends
/// as `BoundsNotFound`.
pub fn estimate_bounds(
    survey: &SurveyData,
    mutation_id: &str,
    parcels: &BTreeSet<String>,
    distance_limit_m: f64,
) -> Option<BoundsEstimate> {
    let mut evidence: Vec<(String, BoundingBox)> = Vec::new();

    for parcel in parcels {
        if let Some(bbox) = survey.parcel_bbox(parcel) {
            evidence.push((parcel.clone(), bbox));
        }
    }
    for (parcel, bbox) in survey.parcels_created_by(mutation_id) {
        if !evidence.iter().any(|(id, _)| id == &parcel) {
            evidence.push((parcel, bbox));
        }
    }
    if let Some(bbox) = survey.mutation_bbox(mutation_id) {
        evidence.push((mutation_id.to_owned(), bbox));
    }

    let mut boxes = evidence.iter().map(|(_, b)| b);
    let first = *boxes.next()?;
    let union = boxes.fold(first, |acc, b| acc.union(b));

    Some(BoundsEstimate {
        bbox: union.grow_to_diagonal(distance_limit_m),
        evidence,
    })
}

impl BoundsEstimate {
    /// The bounds artifact: a FeatureCollection with the grown `bbox`, the
    /// LV95 CRS tag, and one rectangle per evidence source.
    pub fn to_geojson(&self) -> Value {
        let features: Vec<Value> = self
            .evidence
            .iter()
            .map(|(id, b)| {
                json!({
                    "type": "Feature",
                    "id": id,
                    "properties": {},
                    "geometry": {
                        "type": "Polygon",
                        "coordinates": [[
                            [b.min_x, b.min_y],
                            [b.max_x, b.min_y],
                            [b.max_x, b.max_y],
                            [b.min_x, b.max_y],
                            [b.min_x, b.min_y],
                        ]],
                    },
                })
            })
            .collect();
        json!({
            "type": "FeatureCollection",
            "bbox": [self.bbox.min_x, self.bbox.min_y, self.bbox.max_x, self.bbox.max_y],
            "crs": {
                "type": "name",
                "properties": { "name": CRS_URN },
            },
            "features": features,
        })
    }
}

/// Read the search window back out of a bounds artifact.
pub fn bbox_from_geojson(bytes: &[u8]) -> Result<BoundingBox, String> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| format!("invalid JSON: {e}"))?;
    let bbox = value
        .get("bbox")
        .and_then(Value::as_array)
        .ok_or("missing bbox")?;
    let coords: Vec<f64> = bbox.iter().filter_map(Value::as_f64).collect();
    if coords.len() != 4 {
        return Err(format!("bbox has {} coordinates, want 4", coords.len()));
    }
    if coords[0] > coords[2] || coords[1] > coords[3] {
        return Err("bbox minima exceed maxima".into());
    }
    Ok(BoundingBox::new(coords[0], coords[1], coords[2], coords[3]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::survey::tests::small_survey;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn union_covers_both_boxes() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 5.0);
        let b = BoundingBox::new(8.0, -2.0, 12.0, 4.0);
        let u = a.union(&b);
        assert_eq!(u, BoundingBox::new(0.0, -2.0, 12.0, 5.0));
    }

    #[test]
    fn growth_preserves_center_and_meets_diagonal() {
        let b = BoundingBox::new(100.0, 200.0, 130.0, 240.0); // diagonal 50
        let grown = b.grow_to_diagonal(500.0);
        let (cx, cy) = b.center();
        let (gx, gy) = grown.center();
        assert!(close(cx, gx) && close(cy, gy));
        assert!(grown.diagonal() >= 500.0 - 1e-6);
        // Aspect ratio is preserved too.
        assert!(close(grown.width() / grown.height(), b.width() / b.height()));
    }

    #[test]
    fn growth_never_shrinks_a_large_box() {
        let b = BoundingBox::new(0.0, 0.0, 3000.0, 4000.0); // diagonal 5000
        assert_eq!(b.grow_to_diagonal(500.0), b);
        assert_eq!(b.grow_to_diagonal(5000.0), b);
    }

    #[test]
    fn point_evidence_grows_into_a_square() {
        let b = BoundingBox::new(1000.0, 2000.0, 1000.0, 2000.0);
        let grown = b.grow_to_diagonal(363.7);
        assert!(close(grown.diagonal(), 363.7));
        assert!(close(grown.width(), grown.height()));
        let (cx, cy) = grown.center();
        assert!(close(cx, 1000.0) && close(cy, 2000.0));
    }

    #[test]
    fn text_parcels_cover_both_numbering_schemes() {
        let text = "Kat. Nr. 27123 und HG3099, vergleiche WO12 sowie 12345.";
        let parcels = parcels_in_text(text);
        assert!(parcels.contains("27123"));
        assert!(parcels.contains("HG3099"));
        assert!(parcels.contains("WO12"));
        // Five-digit numbers outside the 2xxxx/3xxxx ranges are not parcels.
        assert!(!parcels.contains("12345"));
        // "XY" is not a neighbourhood.
        assert!(parcels_in_text("siehe XY123").is_empty());
    }

    #[test]
    fn estimate_unions_all_evidence_sources() {
        let survey = small_survey();
        let parcels: BTreeSet<String> = ["HG2244".to_owned()].into();
        let estimate = estimate_bounds(&survey, "HG3099", &parcels, 10.0).unwrap();

        // Evidence: the OCR parcel, a parcel created by HG3099, and the
        // mutation's own record.
        let ids: Vec<&str> = estimate.evidence.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, ["HG2244", "HG2250", "HG3099"]);

        let raw = estimate
            .evidence
            .iter()
            .map(|(_, b)| *b)
            .reduce(|a, b| a.union(&b))
            .unwrap();
        assert!(estimate.bbox.diagonal() >= raw.diagonal());
    }

    #[test]
    fn estimate_without_evidence_is_none() {
        let survey = small_survey();
        let parcels = BTreeSet::new();
        assert_eq!(estimate_bounds(&survey, "ZZ9999", &parcels, 100.0), None);
    }

    #[test]
    fn geojson_round_trips_the_bbox() {
        let estimate = BoundsEstimate {
            bbox: BoundingBox::new(2683000.0, 1247000.0, 2683400.0, 1247300.0),
            evidence: vec![(
                "HG2244".into(),
                BoundingBox::new(2683100.0, 1247100.0, 2683200.0, 1247200.0),
            )],
        };
        let value = estimate.to_geojson();
        assert_eq!(value["crs"]["properties"]["name"], CRS_URN);
        assert_eq!(value["features"][0]["id"], "HG2244");

        let bytes = serde_json::to_vec(&value).unwrap();
        let bbox = bbox_from_geojson(&bytes).unwrap();
        assert_eq!(bbox, estimate.bbox);
    }

    #[test]
    fn malformed_geojson_is_rejected() {
        assert!(bbox_from_geojson(b"not json").is_err());
        assert!(bbox_from_geojson(br#"{"type":"FeatureCollection"}"#).is_err());
        assert!(bbox_from_geojson(br#"{"bbox":[1.0,2.0,3.0]}"#).is_err());
        assert!(bbox_from_geojson(br#"{"bbox":[9.0,2.0,3.0,4.0]}"#).is_err());
    }
}
