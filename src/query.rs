use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use chrono::{Days, NaiveDate};
use serde::Serialize;
use tracing::{info, warn};

use crate::archive::{ArchiveClient, TapRow};
use crate::config::{DateField, FilterSection};
use crate::domain::{Uid, UnitCandidate, UnitIdentity, band_number, normalize_band_token};
use crate::error::AlmaError;
use crate::store::{now_utc, write_bytes_atomic};

const SPEED_OF_LIGHT_M_PER_S: f64 = 299_792_458.0;

#[derive(Debug, Clone, Serialize)]
pub struct Discovery {
    pub adql: String,
    pub rows: usize,
    pub candidates: Vec<UnitCandidate>,
}

/// Runs the discovery query and groups the rows into units.
pub fn discover(
    client: &dyn ArchiveClient,
    start: &str,
    end: &str,
    filters: &FilterSection,
) -> Result<Discovery, AlmaError> {
    let adql = build_adql(start, end, filters)?;
    let rows = client.query_tap(&adql)?;
    info!(rows = rows.len(), "tap query returned");
    let mut candidates = group_rows(&rows, filters);
    let timestamp = now_utc();
    for candidate in &mut candidates {
        candidate.query_timestamp = Some(timestamp.clone());
    }
    Ok(Discovery {
        adql,
        rows: rows.len(),
        candidates,
    })
}

pub fn build_adql(start: &str, end: &str, filters: &FilterSection) -> Result<String, AlmaError> {
    let start_date = parse_date(start)?;
    let end_date = parse_date(end)?;

    let mut clauses = vec![
        "data_rights = 'Public'".to_string(),
        "member_ous_uid IS NOT NULL".to_string(),
    ];
    match filters.date_field {
        DateField::Release => {
            clauses.push(format!("obs_release_date >= '{start_date}'"));
            clauses.push(format!("obs_release_date < '{end_date}'"));
        }
        DateField::Observation => {
            clauses.push("t_min IS NOT NULL".to_string());
            clauses.push(format!("t_min >= {:.1}", date_to_mjd(start_date)));
            clauses.push(format!("t_min < {:.1}", date_to_mjd(end_date)));
        }
    }

    if filters.exclude_tp {
        clauses.push(
            "(antenna_arrays IS NULL OR (LOWER(antenna_arrays) NOT LIKE '%pm%' \
             AND LOWER(antenna_arrays) NOT LIKE '%tp%'))"
                .to_string(),
        );
    }
    if filters.exclude_7m {
        clauses.push(
            "(antenna_arrays IS NULL OR (LOWER(antenna_arrays) NOT LIKE '%cm%' \
             AND LOWER(antenna_arrays) NOT LIKE '%7m%'))"
                .to_string(),
        );
    }

    for band in &filters.bands_include {
        clauses.push(band_match_clause(band));
    }
    for band in &filters.bands_exclude {
        clauses.push(format!("NOT {}", band_match_clause(band)));
    }

    if !filters.project_codes_include.is_empty() {
        clauses.push(format!(
            "proposal_id IN ({})",
            quoted_list(&filters.project_codes_include)
        ));
    }
    if !filters.project_codes_exclude.is_empty() {
        clauses.push(format!(
            "proposal_id NOT IN ({})",
            quoted_list(&filters.project_codes_exclude)
        ));
    }

    if let Some(ghz) = filters.min_freq_ghz.filter(|ghz| *ghz > 0.0) {
        clauses.push(format!("em_min <= {}", SPEED_OF_LIGHT_M_PER_S / (ghz * 1e9)));
    }
    if let Some(ghz) = filters.max_freq_ghz.filter(|ghz| *ghz > 0.0) {
        clauses.push(format!("em_max >= {}", SPEED_OF_LIGHT_M_PER_S / (ghz * 1e9)));
    }

    Ok(format!(
        "SELECT proposal_id, member_ous_uid, group_ous_uid, asdm_uid, band_list, \
         obs_release_date, t_min, t_max, qa2_passed, target_name, science_keyword, \
         scan_intent, antenna_arrays FROM ivoa.obscore WHERE {}",
        clauses.join(" AND ")
    ))
}

/// Matches a band given either as a number or as text such as `BAND 6`.
fn band_match_clause(token: &str) -> String {
    let num = band_number(token);
    if num.is_empty() {
        let band = sql_escape(&normalize_band_token(token));
        return format!("UPPER(band_list) LIKE '%{band}%'");
    }
    let candidates = [
        format!("band_list = '{num}'"),
        format!("band_list LIKE '{num},%'"),
        format!("band_list LIKE '{num}, %'"),
        format!("band_list LIKE '%,{num}'"),
        format!("band_list LIKE '%, {num}'"),
        format!("band_list LIKE '%,{num},%'"),
        format!("band_list LIKE '%, {num},%'"),
        format!("band_list LIKE '%,{num}, %'"),
        format!("band_list LIKE '%, {num}, %'"),
        format!("UPPER(band_list) LIKE '%BAND {num}%'"),
    ];
    format!("({})", candidates.join(" OR "))
}

fn quoted_list(values: &[String]) -> String {
    values
        .iter()
        .map(|value| format!("'{}'", sql_escape(value)))
        .collect::<Vec<_>>()
        .join(",")
}

fn sql_escape(value: &str) -> String {
    value.replace('\'', "''")
}

fn parse_date(value: &str) -> Result<NaiveDate, AlmaError> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|_| AlmaError::InvalidDate(value.to_string()))
}

fn mjd_epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1858, 11, 17).unwrap_or_default()
}

fn date_to_mjd(date: NaiveDate) -> f64 {
    (date - mjd_epoch()).num_days() as f64
}

fn mjd_to_date(value: &str) -> Option<String> {
    let mjd: f64 = value.trim().parse().ok()?;
    if !mjd.is_finite() || mjd < 0.0 {
        return None;
    }
    mjd_epoch()
        .checked_add_days(Days::new(mjd.floor() as u64))
        .map(|date| date.format("%Y-%m-%d").to_string())
}

#[derive(Default)]
struct UnitAccumulator {
    project_code: Option<String>,
    group_ous_uid: Option<Uid>,
    eb_uids: BTreeSet<String>,
    bands: BTreeSet<String>,
    release_date: Option<String>,
    obs_date: Option<String>,
    qa2_passed: Option<bool>,
    source_rows: u32,
}

/// Folds obscore rows into one candidate per member UID: union of EBs and
/// bands, latest release date, earliest observation date, QA2 passed when
/// any row says so.
pub fn group_rows(rows: &[TapRow], filters: &FilterSection) -> Vec<UnitCandidate> {
    let mut grouped: BTreeMap<Uid, UnitAccumulator> = BTreeMap::new();
    for row in rows {
        let raw = field(row, "member_ous_uid");
        if raw.is_empty() {
            continue;
        }
        let mous: Uid = match raw.parse() {
            Ok(uid) => uid,
            Err(_) => {
                warn!(member_ous_uid = raw, "skipping row with malformed member uid");
                continue;
            }
        };
        let item = grouped.entry(mous).or_default();
        item.source_rows += 1;

        let project = field(row, "proposal_id");
        if item.project_code.is_none() && !project.is_empty() {
            item.project_code = Some(project.to_string());
        }
        if item.group_ous_uid.is_none() {
            item.group_ous_uid = field(row, "group_ous_uid").parse().ok();
        }
        let eb = field(row, "asdm_uid");
        if !eb.is_empty() {
            item.eb_uids.insert(eb.to_string());
        }
        for token in field(row, "band_list").replace(';', ",").split(',') {
            let token = token.trim();
            if !token.is_empty() {
                item.bands.insert(normalize_band_token(token));
            }
        }
        let release = field(row, "obs_release_date");
        if !release.is_empty()
            && item
                .release_date
                .as_deref()
                .is_none_or(|current| release > current)
        {
            item.release_date = Some(release.to_string());
        }
        if let Some(obs) = mjd_to_date(field(row, "t_min")) {
            if item
                .obs_date
                .as_deref()
                .is_none_or(|current| obs.as_str() < current)
            {
                item.obs_date = Some(obs);
            }
        }
        match field(row, "qa2_passed").to_ascii_lowercase().as_str() {
            "t" | "true" | "1" => item.qa2_passed = Some(true),
            "f" | "false" | "0" if item.qa2_passed.is_none() => item.qa2_passed = Some(false),
            _ => {}
        }
    }

    let include = uid_set(&filters.mous_include);
    let exclude = uid_set(&filters.mous_exclude);

    let mut candidates: Vec<UnitCandidate> = grouped
        .into_iter()
        .filter(|(uid, _)| include.is_empty() || include.contains(uid))
        .filter(|(uid, _)| !exclude.contains(uid))
        .map(|(mous_uid, item)| {
            let mut identity = UnitIdentity::new(
                item.project_code.as_deref().unwrap_or("UNKNOWN"),
                mous_uid,
            );
            identity.group_ous_uid = item.group_ous_uid;
            let mut candidate = UnitCandidate::new(identity);
            candidate.eb_uids = item.eb_uids.into_iter().collect();
            candidate.band_list = item.bands.into_iter().collect();
            candidate.release_date = item.release_date;
            candidate.obs_date = item.obs_date;
            candidate.qa2_passed = item.qa2_passed;
            candidate.source_rows = item.source_rows;
            candidate
        })
        .collect();
    candidates.sort_by(|a, b| {
        (
            a.release_date.clone().unwrap_or_default(),
            &a.identity.project_code,
            &a.identity.mous_uid,
        )
            .cmp(&(
                b.release_date.clone().unwrap_or_default(),
                &b.identity.project_code,
                &b.identity.mous_uid,
            ))
    });
    candidates
}

fn field<'a>(row: &'a TapRow, name: &str) -> &'a str {
    row.get(name).map(|value| value.trim()).unwrap_or_default()
}

fn uid_set(values: &[String]) -> BTreeSet<Uid> {
    values.iter().filter_map(|value| value.parse().ok()).collect()
}

pub fn write_candidates_jsonl(path: &Path, candidates: &[UnitCandidate]) -> Result<(), AlmaError> {
    let mut content = Vec::new();
    for candidate in candidates {
        let line =
            serde_json::to_string(candidate).map_err(|err| AlmaError::Filesystem(err.to_string()))?;
        content.extend_from_slice(line.as_bytes());
        content.push(b'\n');
    }
    write_bytes_atomic(path, &content)
}

pub fn read_candidates_jsonl(path: &Path) -> Result<Vec<UnitCandidate>, AlmaError> {
    let content = fs::read_to_string(path)
        .map_err(|err| AlmaError::Filesystem(format!("read {}: {err}", path.display())))?;
    let mut candidates = Vec::new();
    for (number, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let candidate = serde_json::from_str(line).map_err(|err| AlmaError::DocumentCorruption {
            path: path.to_path_buf(),
            message: format!("line {}: {err}", number + 1),
        })?;
        candidates.push(candidate);
    }
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observation_window_uses_mjd() {
        let filters = FilterSection {
            date_field: DateField::Observation,
            ..FilterSection::default()
        };
        let adql = build_adql("2020-01-01", "2020-02-01", &filters).unwrap();
        assert!(adql.contains("t_min >= 58849.0"));
        assert!(adql.contains("t_min < 58880.0"));
    }

    #[test]
    fn mjd_round_trip() {
        assert_eq!(mjd_to_date("58849.25").as_deref(), Some("2020-01-01"));
        assert_eq!(mjd_to_date("NULL"), None);
    }
}
