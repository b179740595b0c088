//! Candidate survey points for one mutation.
//!
//! Once a mutation has an estimated search window and a best-guess date,
//! the candidate set is every known point inside the window that could
//! have existed when the plan was drawn. The set is written to
//! `points/{id}.csv` and handed to the matching engine as one half of its
//! correspondence problem (the other half being the detected symbols).

use chrono::NaiveDate;

use crate::bounds::BoundingBox;
use crate::survey::{SurveyData, SurveyPoint};

/// Points inside `window` whose validity interval admits `map_date`
/// (widened by `slack_days` at both ends), ordered by point id.
pub fn candidate_points<'a>(
    survey: &'a SurveyData,
    window: &BoundingBox,
    map_date: Option<NaiveDate>,
    slack_days: u64,
) -> Vec<&'a SurveyPoint> {
    survey
        .points_within(window)
        .into_iter()
        .filter(|p| p.valid_around(map_date, slack_days))
        .collect()
}

/// Serialise the points artifact (`id,x,y,symbol`), byte-stable for a
/// given candidate set.
pub fn to_csv_bytes(points: &[&SurveyPoint]) -> Vec<u8> {
    let mut out = String::from("id,x,y,symbol\n");
    for p in points {
        out.push_str(&format!("{},{:.3},{:.3},{}\n", p.id, p.x, p.y, p.symbol));
    }
    out.into_bytes()
}
