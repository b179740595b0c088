//! Mutation identifiers, scan dates, and the grouping of scanned PDF parts
//! into per-mutation work units.
//!
//! The archive encodes everything in file names, e.g.
//!
//! ```text
//! AF_Mut_20009_Kat_AF5146_AF5147_j2005.pdf   → mutation 20009, year 2005
//! FL_Mut_1303_Kat_588_J1959_01-01.pdf        → mutation FL1303, 1959-01-01
//! WD_Mut_K_85_j1982.pdf                      → mutation WD-K85 (court series)
//! ```
//!
//! Tokens before `_Mut_` are neighbourhood prefixes (`FB`, an area
//! correction marker, is not a neighbourhood). Mutation numbers below 20000
//! are per-neighbourhood and need the prefix to be unique city-wide; numbers
//! from 20000 up come from the city-wide numbering era and stand alone.
//!
//! Grouping is a pure function of the file-name set: parts sort
//! lexicographically by file name, mutations sort by identifier, and the
//! earliest file-name date wins, so two runs over the same tree agree no
//! matter how the directory walk ordered its output.

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::PipelineError;

/// Scan date suffix: `_j2005`, `_J1959_01-01`, `_j2004-07-15`.
static DATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r".+_[jJ](\d{4})([-_](\d{2})[-_](\d{2}))?.*\.pdf$").unwrap());

/// Mutation number after `_Mut_`, optionally led by a neighbourhood code.
static MUTATION_NUM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([A-Z]{2})?(\d+)").unwrap());

/// Court-decision series after `_Mut_`: `K_85`, `k-12`.
static COURT_NUM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[kK][-_](\d+)").unwrap());

/// Parcel references like `AF5146` anywhere in a scan path.
static PATH_PARCEL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Z]{2}\d+").unwrap());

/// One dossier: all scanned parts of a single cadastral mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    /// Short identifier, unique within the archive (`21989`, `HG3099`).
    pub id: String,
    /// Scan date from the file names, if any part carried one.
    pub date: Option<NaiveDate>,
    /// Constituent PDFs, lexicographic by file name.
    pub parts: Vec<PathBuf>,
}

impl Mutation {
    /// Parcel references encoded in the scan paths of this mutation.
    pub fn path_parcels(&self) -> Vec<String> {
        let mut parcels: Vec<String> = self
            .parts
            .iter()
            .flat_map(|p| {
                PATH_PARCEL_RE
                    .find_iter(&p.to_string_lossy())
                    .map(|m| m.as_str().to_owned())
                    .collect::<Vec<_>>()
            })
            .collect();
        parcels.sort();
        parcels.dedup();
        parcels
    }
}

/// Result of grouping one directory tree.
#[derive(Debug, Default)]
pub struct GroupedScans {
    /// Work units, sorted by mutation id.
    pub mutations: Vec<Mutation>,
    /// PDFs whose names did not yield a mutation id, sorted.
    pub unrecognized: Vec<PathBuf>,
}

/// Extract the mutation identifier from a scan file name.
///
/// `None` means the name does not follow the archive's scheme; the caller
/// reports such files rather than dropping them silently.
pub fn extract_mutation_id(filename: &str) -> Option<String> {
    let (prefix, suffix) = filename.split_once("_Mut_")?;
    // First non-"FB" token is the neighbourhood.
    let neighborhood = prefix
        .split('_')
        .map(str::trim)
        .find(|t| !t.is_empty() && *t != "FB");
    if let Some(caps) = MUTATION_NUM_RE.captures(suffix) {
        let num: u32 = caps[2].parse().ok()?;
        return if num >= 20000 {
            Some(num.to_string())
        } else {
            neighborhood.map(|n| format!("{n}{num}"))
        };
    }
    if let Some(caps) = COURT_NUM_RE.captures(suffix) {
        let num: u32 = caps[1].parse().ok()?;
        return neighborhood.map(|n| format!("{n}-K{num}"));
    }
    None
}

/// Extract the scan date from a file name.
///
/// A year alone maps to January 1st; a month/day pair that does not form a
/// real calendar date falls back to January 1st of the year.
pub fn extract_mutation_date(filename: &str) -> Option<NaiveDate> {
    let caps = DATE_RE.captures(filename)?;
    let year: i32 = caps[1].parse().ok()?;
    let month: u32 = caps.get(3).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
    let day: u32 = caps.get(4).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
    NaiveDate::from_ymd_opt(year, month, day).or_else(|| NaiveDate::from_ymd_opt(year, 1, 1))
}

/// Collect every `.pdf` under `root`.
///
/// Traversal order is irrelevant; [`group_paths`] sorts everything.
pub fn scan_directory(root: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    if !root.is_dir() {
        return Err(PipelineError::ScansDirNotFound {
            path: root.to_path_buf(),
        });
    }
    let mut paths = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(|e| PipelineError::ScansDirUnreadable {
            path: e
                .path()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| root.to_path_buf()),
            source: e
                .into_io_error()
                .unwrap_or_else(|| std::io::Error::other("directory walk failed")),
        })?;
        if entry.file_type().is_file()
            && entry.file_name().to_string_lossy().ends_with(".pdf")
        {
            paths.push(entry.into_path());
        }
    }
    Ok(paths)
}

/// Group scan paths into mutations.
///
/// Pure in the set of paths: any permutation of the input produces the same
/// groups, part order, and dates.
pub fn group_paths(paths: Vec<PathBuf>) -> GroupedScans {
    let mut groups: BTreeMap<String, (Option<NaiveDate>, Vec<PathBuf>)> = BTreeMap::new();
    let mut unrecognized = Vec::new();

    for path in paths {
        let name = match path.file_name() {
            Some(n) => n.to_string_lossy().into_owned(),
            None => continue,
        };
        let Some(id) = extract_mutation_id(&name) else {
            warn!(path = %path.display(), "file name does not match the naming scheme");
            unrecognized.push(path);
            continue;
        };
        let date = extract_mutation_date(&name);
        let entry = groups.entry(id).or_default();
        // Earliest file-name date wins, independent of traversal order.
        entry.0 = match (entry.0, date) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        entry.1.push(path);
    }

    let mutations = groups
        .into_iter()
        .map(|(id, (date, mut parts))| {
            parts.sort_by(|a, b| {
                let by_name = a.file_name().cmp(&b.file_name());
                by_name.then_with(|| a.cmp(b))
            });
            Mutation { id, date, parts }
        })
        .collect();
    unrecognized.sort();

    GroupedScans {
        mutations,
        unrecognized,
    }
}

/// Scan `root` and group everything in one step.
pub fn group_scans(root: &Path) -> Result<GroupedScans, PipelineError> {
    let paths = scan_directory(root)?;
    let grouped = group_paths(paths);
    debug!(
        mutations = grouped.mutations.len(),
        unrecognized = grouped.unrecognized.len(),
        "grouped scans"
    );
    Ok(grouped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn city_wide_numbers_stand_alone() {
        assert_eq!(
            extract_mutation_id("AF_Mut_20009_Kat_AF5146_AF5147_j2005.pdf"),
            Some("20009".into())
        );
        assert_eq!(
            extract_mutation_id("WO_Mut_21989_Kat_WO6495_j2004.pdf"),
            Some("21989".into())
        );
    }

    #[test]
    fn neighbourhood_numbers_take_the_prefix() {
        assert_eq!(
            extract_mutation_id("FL_Mut_1303_Kat_588_J1959_01-01.pdf"),
            Some("FL1303".into())
        );
        // "FB" is an area correction marker, not a neighbourhood.
        assert_eq!(
            extract_mutation_id("HG_FB_Mut_9032_AA2845_j1997.pdf"),
            Some("HG9032".into())
        );
        // A neighbourhood code may repeat right after _Mut_.
        assert_eq!(
            extract_mutation_id("AA_Mut_AA2845_j1997.pdf"),
            Some("AA2845".into())
        );
    }

    #[test]
    fn court_series_get_a_k_id() {
        assert_eq!(
            extract_mutation_id("WD_Mut_K_85_j1982.pdf"),
            Some("WD-K85".into())
        );
        assert_eq!(
            extract_mutation_id("SE_Mut_k-7_j1975.pdf"),
            Some("SE-K7".into())
        );
    }

    #[test]
    fn malformed_names_are_rejected() {
        assert_eq!(extract_mutation_id("scan001.pdf"), None);
        assert_eq!(extract_mutation_id("HG_Mutation_123_j1997.pdf"), None);
        // Below 20000 and no usable neighbourhood prefix.
        assert_eq!(extract_mutation_id("FB_Mut_123_j1997.pdf"), None);
        assert_eq!(extract_mutation_id("HG_Mut_Kat_j1997.pdf"), None);
    }

    #[test]
    fn dates_parse_with_and_without_month_day() {
        assert_eq!(
            extract_mutation_date("AF_Mut_20009_Kat_AF5146_AF5147_j2005.pdf"),
            NaiveDate::from_ymd_opt(2005, 1, 1)
        );
        assert_eq!(
            extract_mutation_date("FL_Mut_1303_Kat_588_J1959_01-01.pdf"),
            NaiveDate::from_ymd_opt(1959, 1, 1)
        );
        assert_eq!(
            extract_mutation_date("WO_Mut_21989_j2004-07-15.pdf"),
            NaiveDate::from_ymd_opt(2004, 7, 15)
        );
        assert_eq!(extract_mutation_date("WO_Mut_21989.pdf"), None);
    }

    #[test]
    fn nonsense_month_day_falls_back_to_january() {
        assert_eq!(
            extract_mutation_date("HG_Mut_9032_j1997-13-40.pdf"),
            NaiveDate::from_ymd_opt(1997, 1, 1)
        );
        // February 31st is no date either.
        assert_eq!(
            extract_mutation_date("HG_Mut_9032_j1997-02-31.pdf"),
            NaiveDate::from_ymd_opt(1997, 1, 1)
        );
    }

    #[test]
    fn path_parcels_are_sorted_and_deduped() {
        let mutation = Mutation {
            id: "20009".into(),
            date: None,
            parts: vec![
                PathBuf::from("scans/AF/AF_Mut_20009_Kat_AF5147_AF5146_j2005.pdf"),
                PathBuf::from("scans/AF/AF_Mut_20009_Kat_AF5146_j2005_2.pdf"),
            ],
        };
        assert_eq!(mutation.path_parcels(), vec!["AF5146", "AF5147"]);
    }

    #[test]
    fn grouping_is_independent_of_traversal_order() {
        let paths = vec![
            PathBuf::from("scans/WO_Mut_21989_Kat_WO6495_j2004.pdf"),
            PathBuf::from("scans/b/FL_Mut_1303_Kat_588_J1959_01-01.pdf"),
            PathBuf::from("scans/a/FL_Mut_1303_Teil_2_j1958.pdf"),
            PathBuf::from("scans/unrelated_notes.pdf"),
        ];
        let mut reversed = paths.clone();
        reversed.reverse();

        let a = group_paths(paths);
        let b = group_paths(reversed);

        let ids: Vec<&str> = a.mutations.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["21989", "FL1303"]);
        assert_eq!(a.mutations, b.mutations);
        assert_eq!(a.unrecognized, b.unrecognized);
        assert_eq!(a.unrecognized, vec![PathBuf::from("scans/unrelated_notes.pdf")]);
    }

    #[test]
    fn multi_part_mutations_sort_parts_and_take_earliest_date() {
        let grouped = group_paths(vec![
            PathBuf::from("scans/b/FL_Mut_1303_Kat_588_J1959_01-01.pdf"),
            PathBuf::from("scans/a/FL_Mut_1303_Teil_2_j1958.pdf"),
        ]);
        assert_eq!(grouped.mutations.len(), 1);
        let m = &grouped.mutations[0];
        assert_eq!(m.id, "FL1303");
        assert_eq!(m.date, NaiveDate::from_ymd_opt(1958, 1, 1));
        // Lexicographic by file name, not by directory.
        let names: Vec<_> = m
            .parts
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            [
                "FL_Mut_1303_Kat_588_J1959_01-01.pdf",
                "FL_Mut_1303_Teil_2_j1958.pdf"
            ]
        );
    }
}
