use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::Path;

use camino::Utf8PathBuf;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::Uid;
use crate::error::AlmaError;
use crate::index::{IndexRecord, IndexStore};
use crate::layout::{SUMMARY_FILENAME, UnitLayout};
use crate::store::walk_files;

#[derive(Debug, Clone, Copy, Default)]
pub struct MergeOptions {
    pub vacuum: bool,
    pub integrity_check: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeConflict {
    pub mous_uid: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MergeReport {
    pub central: String,
    pub shard_tables: usize,
    pub summary_files: usize,
    pub candidates: usize,
    pub applied: usize,
    pub unchanged: usize,
    pub conflicts: Vec<MergeConflict>,
    pub skipped: Vec<String>,
    pub integrity: String,
}

/// Folds shard records into the central table. The outcome depends only on
/// the set of candidate records, never on the order they arrive in.
pub struct IndexMerger {
    options: MergeOptions,
}

impl IndexMerger {
    pub fn new(options: MergeOptions) -> Self {
        Self { options }
    }

    /// Merges every shard table and summary document found under
    /// `shards_root` into the table at `central_path`.
    pub fn merge_from_shards(
        &self,
        shards_root: &Path,
        central_path: &Path,
    ) -> Result<MergeReport, AlmaError> {
        let mut central = IndexStore::open(central_path)?;
        let central_name = central_path.file_name();
        let mut report = MergeReport::default();
        let mut incoming = Vec::new();

        let files = walk_files(shards_root)?;
        for path in files
            .iter()
            .filter(|path| path.extension().is_some_and(|ext| ext == "sqlite"))
        {
            if path.as_path() == central_path || path.file_name() == central_name {
                continue;
            }
            match IndexStore::open_read_only(path).and_then(|shard| shard.records()) {
                Ok(records) => {
                    debug!(shard = %path.display(), records = records.len(), "read shard table");
                    incoming.extend(records);
                    report.shard_tables += 1;
                }
                Err(err) => {
                    warn!(shard = %path.display(), error = %err, "skipping shard table");
                    report.skipped.push(format!("{}: {err}", path.display()));
                }
            }
        }

        for path in files
            .iter()
            .filter(|path| path.file_name().is_some_and(|name| name == SUMMARY_FILENAME))
        {
            let Some(dir) = path
                .parent()
                .and_then(|dir| Utf8PathBuf::from_path_buf(dir.to_path_buf()).ok())
            else {
                continue;
            };
            let shard_id = dir.file_name().map(str::to_string);
            let layout = UnitLayout::new(dir);
            match IndexRecord::from_unit_dir(&layout, shard_id.as_deref()) {
                Ok(Some(record)) => {
                    incoming.push(record);
                    report.summary_files += 1;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(summary = %path.display(), error = %err, "skipping summary document");
                    report.skipped.push(format!("{}: {err}", path.display()));
                }
            }
        }

        let folded = self.fold(&mut central, incoming)?;
        report.candidates = folded.candidates;
        report.applied = folded.applied;
        report.unchanged = folded.unchanged;
        report.conflicts = folded.conflicts;
        report.central = central_path.display().to_string();
        report.integrity = self.finish(&central)?;
        info!(
            shard_tables = report.shard_tables,
            summaries = report.summary_files,
            applied = report.applied,
            conflicts = report.conflicts.len(),
            "index merge finished"
        );
        Ok(report)
    }

    /// Merges already opened shard stores into `central`.
    pub fn merge(
        &self,
        central: &mut IndexStore,
        shards: &[&IndexStore],
    ) -> Result<MergeReport, AlmaError> {
        let mut incoming = Vec::new();
        for shard in shards {
            incoming.extend(shard.records()?);
        }
        let mut report = self.fold(central, incoming)?;
        report.shard_tables = shards.len();
        report.central = central.path().display().to_string();
        report.integrity = self.finish(central)?;
        Ok(report)
    }

    fn finish(&self, central: &IndexStore) -> Result<String, AlmaError> {
        if self.options.vacuum {
            central.vacuum()?;
        }
        if self.options.integrity_check {
            central.integrity_check()
        } else {
            Ok("not-run".to_string())
        }
    }

    fn fold(
        &self,
        central: &mut IndexStore,
        incoming: Vec<IndexRecord>,
    ) -> Result<MergeReport, AlmaError> {
        let mut report = MergeReport {
            candidates: incoming.len(),
            ..MergeReport::default()
        };

        let current: BTreeMap<Uid, IndexRecord> = central
            .records()?
            .into_iter()
            .map(|record| (record.mous_uid.clone(), record))
            .collect();

        let mut grouped: BTreeMap<Uid, Vec<IndexRecord>> = BTreeMap::new();
        for record in incoming {
            grouped.entry(record.mous_uid.clone()).or_default().push(record);
        }

        let mut winners = Vec::new();
        for (mous_uid, mut candidates) in grouped {
            let existing = current.get(&mous_uid);
            if let Some(existing) = existing {
                candidates.push(existing.clone());
            }
            match resolve(candidates) {
                Resolution::Winner(winner) => {
                    if existing == Some(&winner) {
                        report.unchanged += 1;
                    } else {
                        debug!(
                            mous_uid = %mous_uid,
                            provenance_at = winner.provenance_at.as_deref().unwrap_or("-"),
                            shard = winner.shard_id.as_deref().unwrap_or("-"),
                            "merge applies record"
                        );
                        winners.push(winner);
                    }
                }
                Resolution::Ambiguous(count) => {
                    let err = AlmaError::AmbiguousProvenance {
                        mous_uid: mous_uid.to_string(),
                        message: format!(
                            "{count} differing records without provenance timestamps"
                        ),
                    };
                    warn!(error = %err, "merge conflict left unresolved");
                    report.conflicts.push(MergeConflict {
                        mous_uid: mous_uid.to_string(),
                        message: err.to_string(),
                    });
                }
            }
        }

        report.applied = winners.len();
        central.upsert_all(&winners)?;
        Ok(report)
    }
}

enum Resolution {
    Winner(IndexRecord),
    Ambiguous(usize),
}

/// Picks the record with the latest provenance timestamp. Equal timestamps
/// fall back to shard id, then to the canonical serialization. Records without
/// a timestamp only win when all candidates agree on the content.
fn resolve(candidates: Vec<IndexRecord>) -> Resolution {
    let mut keyed: Vec<(String, IndexRecord)> = candidates
        .into_iter()
        .map(|record| (canonical(&record), record))
        .collect();
    keyed.sort_by(|a, b| compare(&a.1, &a.0, &b.1, &b.0));
    keyed.dedup_by(|a, b| a.0 == b.0);

    let any_provenance = keyed.iter().any(|(_, record)| record.provenance_at.is_some());
    if !any_provenance {
        let mut contents: Vec<String> = keyed
            .iter()
            .map(|(_, record)| content_key(record))
            .collect();
        contents.sort();
        contents.dedup();
        if contents.len() > 1 {
            return Resolution::Ambiguous(keyed.len());
        }
    }
    match keyed.pop() {
        Some((_, winner)) => Resolution::Winner(winner),
        None => Resolution::Ambiguous(0),
    }
}

fn compare(a: &IndexRecord, a_key: &str, b: &IndexRecord, b_key: &str) -> Ordering {
    a.provenance_at
        .cmp(&b.provenance_at)
        .then_with(|| a.shard_id.cmp(&b.shard_id))
        .then_with(|| a_key.cmp(b_key))
}

fn canonical(record: &IndexRecord) -> String {
    serde_json::to_string(record).unwrap_or_default()
}

/// Serialization without the shard label; two shards that derived the same
/// facts agree even though their labels differ.
fn content_key(record: &IndexRecord) -> String {
    let mut copy = record.clone();
    copy.shard_id = None;
    canonical(&copy)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(qa2: &str, shard: &str, at: Option<&str>) -> IndexRecord {
        IndexRecord {
            mous_uid: "uid://A001/X1/X2".parse().unwrap(),
            project_code: None,
            science_goal_uid: None,
            group_ous_uid: None,
            release_date: None,
            obs_date: None,
            bands: Vec::new(),
            qa2_status: qa2.to_string(),
            qa0_status: None,
            qa2_reasons: Vec::new(),
            qa0_reasons: Vec::new(),
            dr_intervention_suspected: false,
            dr_flag_commands_count: 0,
            dr_manual_flag_commands_count: 0,
            asa_qa_present: false,
            local_dir: None,
            manifest_path: None,
            summary_path: None,
            discovered: true,
            downloaded: false,
            unpacked: false,
            summarized: true,
            last_error_stage: None,
            last_error_message: None,
            shard_id: Some(shard.to_string()),
            provenance_at: at.map(str::to_string),
            eb_uids: Vec::new(),
            artifacts: Vec::new(),
        }
    }

    fn winner(candidates: Vec<IndexRecord>) -> IndexRecord {
        match resolve(candidates) {
            Resolution::Winner(record) => record,
            Resolution::Ambiguous(_) => panic!("expected a winner"),
        }
    }

    #[test]
    fn later_provenance_wins_in_any_order() {
        let a = record("PASS", "a", Some("2024-01-01T00:00:00Z"));
        let b = record("FAIL", "b", Some("2024-02-01T00:00:00Z"));
        assert_eq!(winner(vec![a.clone(), b.clone()]).qa2_status, "FAIL");
        assert_eq!(winner(vec![b, a]).qa2_status, "FAIL");
    }

    #[test]
    fn equal_provenance_breaks_on_shard_id() {
        let a = record("PASS", "part-0001", Some("2024-01-01T00:00:00Z"));
        let b = record("FAIL", "part-0002", Some("2024-01-01T00:00:00Z"));
        assert_eq!(winner(vec![b.clone(), a.clone()]).shard_id.as_deref(), Some("part-0002"));
        assert_eq!(winner(vec![a, b]).shard_id.as_deref(), Some("part-0002"));
    }

    #[test]
    fn missing_provenance_is_flagged_when_records_differ() {
        let a = record("PASS", "a", None);
        let b = record("FAIL", "b", None);
        assert!(matches!(resolve(vec![a.clone(), b]), Resolution::Ambiguous(2)));

        let same = record("PASS", "c", None);
        assert_eq!(winner(vec![a, same]).qa2_status, "PASS");
    }

    #[test]
    fn provenance_beats_missing_provenance() {
        let undated = record("PASS", "a", None);
        let dated = record("FAIL", "b", Some("2020-01-01T00:00:00Z"));
        assert_eq!(winner(vec![dated, undated]).qa2_status, "FAIL");
    }
}
