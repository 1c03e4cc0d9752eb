use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use glob_match::glob_match;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::config::UnpackPolicy;
use crate::domain::{ArtifactKind, ArtifactStatus, Uid};
use crate::error::AlmaError;
use crate::fs_util::{self, ExtractStats, member_parts};
use crate::layout::UnitLayout;
use crate::manifest::{ArtifactRecord, HistoryEvent, ManifestStore, OperationalManifest};
use crate::store::{now_utc, walk_files};

/// Nested measurement-set flag backups are never expanded, whatever the
/// configured exclude list says.
pub const FLAGVERSIONS_PATTERN: &str = "*.flagversions.*";

const OLDER_VERSION_REASON: &str = "older archive version for same kind";

#[derive(Debug, Clone)]
pub struct UnpackCandidate {
    pub record: ArtifactRecord,
    pub archive: PathBuf,
    pub target_dir: PathBuf,
    pub stamp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedArchive {
    pub kind: ArtifactKind,
    pub filename: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub chosen: Vec<UnpackCandidate>,
    pub rejected: Vec<RejectedArchive>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecursivePass {
    pub pass: u32,
    pub archives: Vec<String>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecursiveSummary {
    pub enabled: bool,
    pub passes: Vec<RecursivePass>,
    pub unpacked_count: usize,
    pub error_count: usize,
    pub excluded: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UnpackReport {
    pub mous_uid: String,
    pub unpacked: Vec<String>,
    pub already_unpacked: Vec<String>,
    pub rejected: Vec<RejectedArchive>,
    pub removed: Vec<String>,
    pub errors: Vec<String>,
    pub recursive: RecursiveSummary,
}

impl UnpackReport {
    pub fn did_work(&self) -> bool {
        !self.unpacked.is_empty() || !self.errors.is_empty() || self.recursive.unpacked_count > 0
    }
}

pub struct UnpackController<'a> {
    manifests: &'a ManifestStore,
    policy: &'a UnpackPolicy,
}

impl<'a> UnpackController<'a> {
    pub fn new(manifests: &'a ManifestStore, policy: &'a UnpackPolicy) -> Self {
        Self { manifests, policy }
    }

    /// Complete archives of unpack-enabled kinds that are still on disk.
    /// Per kind the newest modification time wins, ties broken by filename.
    pub fn select(&self, manifest: &OperationalManifest) -> Selection {
        let mut by_kind: BTreeMap<ArtifactKind, Vec<(SystemTime, UnpackCandidate)>> =
            BTreeMap::new();
        for record in &manifest.artifacts {
            if record.status != ArtifactStatus::Complete || !self.policy.unpacks(record.kind) {
                continue;
            }
            let Some(local) = record.local_path.as_deref().map(PathBuf::from) else {
                continue;
            };
            if !local.is_file() || !fs_util::is_archive(&local) {
                continue;
            }
            let Ok(meta) = fs::metadata(&local) else {
                continue;
            };
            let modified = meta.modified().unwrap_or(UNIX_EPOCH);
            let target_dir = local
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            by_kind.entry(record.kind).or_default().push((
                modified,
                UnpackCandidate {
                    record: record.clone(),
                    stamp: stamp_for(meta.len(), modified),
                    archive: local,
                    target_dir,
                },
            ));
        }

        let settled = settled_versions(manifest, self.policy);
        let mut selection = Selection::default();
        for (kind, mut group) in by_kind {
            group.sort_by(|a, b| {
                b.0.cmp(&a.0)
                    .then_with(|| a.1.record.filename.cmp(&b.1.record.filename))
            });
            let mut group = group.into_iter();
            if let Some((modified, newest)) = group.next() {
                let superseded = settled.get(&kind).is_some_and(|(secs, filename)| {
                    let candidate = (epoch_secs(modified), newest.record.filename.as_str());
                    *secs > candidate.0
                        || (*secs == candidate.0 && filename.as_str() <= candidate.1)
                });
                if superseded {
                    selection.rejected.push(RejectedArchive {
                        kind,
                        filename: newest.record.filename,
                        reason: OLDER_VERSION_REASON.to_string(),
                    });
                } else {
                    selection.chosen.push(newest);
                }
            }
            for (_, older) in group {
                selection.rejected.push(RejectedArchive {
                    kind,
                    filename: older.record.filename,
                    reason: OLDER_VERSION_REASON.to_string(),
                });
            }
        }
        selection
    }

    pub fn unpack_unit(&self, layout: &UnitLayout) -> Result<UnpackReport, AlmaError> {
        let manifest = self.manifests.load(layout)?.ok_or_else(|| {
            AlmaError::Filesystem(format!("no manifest at {}", layout.manifest_path()))
        })?;
        let mut report = UnpackReport {
            mous_uid: manifest.mous_uid.to_string(),
            ..UnpackReport::default()
        };

        let selection = self.select(&manifest);
        for candidate in &selection.chosen {
            let filename = candidate.record.filename.clone();
            if manifest.unpacked.get(&filename) == Some(&candidate.stamp) {
                report.already_unpacked.push(filename);
                continue;
            }
            let rejected: Vec<&RejectedArchive> = selection
                .rejected
                .iter()
                .filter(|item| item.kind == candidate.record.kind)
                .collect();
            report.rejected.extend(rejected.iter().map(|item| (*item).clone()));

            match self.unpack(&manifest.mous_uid, candidate) {
                Ok((stats, prefix)) => {
                    self.record_unpacked(layout, candidate, &stats, &prefix, &rejected)?;
                    info!(archive = %filename, files = stats.files, "unpacked");
                    report.unpacked.push(filename);
                    if self.policy.remove_archives_after_unpack {
                        self.remove_after_unpack(layout, candidate, &mut report)?;
                    }
                }
                Err(err) if is_fatal(&err) => return Err(err),
                Err(err) => {
                    warn!(archive = %filename, error = %err, "unpack failed");
                    self.record_failure(layout, candidate, &err)?;
                    report.errors.push(format!("{filename}: {err}"));
                }
            }
        }

        report.recursive = RecursiveSummary {
            enabled: self.policy.recursive_enabled,
            ..RecursiveSummary::default()
        };
        if self.policy.recursive_enabled {
            report.recursive = self.recursive_unpack(layout)?;
        }
        Ok(report)
    }

    /// Extracts one selected archive next to itself. The unit's own
    /// `project/science_goal/group/member` prefix is stripped when present.
    pub fn unpack(
        &self,
        mous_uid: &Uid,
        candidate: &UnpackCandidate,
    ) -> Result<(ExtractStats, Vec<String>), AlmaError> {
        let names = fs_util::entry_names(&candidate.archive)?;
        let prefix = match detect_unit_prefix(&names) {
            Some(prefix) if prefix_matches_unit(&prefix, mous_uid) => prefix,
            Some(prefix) => {
                warn!(
                    archive = %candidate.record.filename,
                    prefix = %prefix.join("/"),
                    "archive layout names another member; extracting without stripping"
                );
                Vec::new()
            }
            None => Vec::new(),
        };
        let stats = fs_util::extract_archive(&candidate.archive, &candidate.target_dir, &prefix)?;
        if stats.files == 0 {
            return Err(AlmaError::extraction(
                &candidate.archive,
                "archive produced no files",
            ));
        }
        Ok((stats, prefix))
    }

    fn record_unpacked(
        &self,
        layout: &UnitLayout,
        candidate: &UnpackCandidate,
        stats: &ExtractStats,
        prefix: &[String],
        rejected: &[&RejectedArchive],
    ) -> Result<(), AlmaError> {
        let target = candidate.target_dir.display().to_string();
        self.manifests.update(layout, |manifest| {
            backfill_identity(manifest, prefix);
            let entry = manifest
                .artifact_mut(candidate.record.kind, &candidate.record.filename)
                .ok_or_else(|| {
                    AlmaError::Filesystem(format!(
                        "{} missing from manifest",
                        candidate.record.filename
                    ))
                })?;
            entry.unpacked = true;
            entry.unpacked_to = Some(target.clone());
            entry.unpacked_at = Some(now_utc());
            entry.unpack_error = None;
            entry.strip_prefix = (!prefix.is_empty()).then(|| prefix.join("/"));
            manifest
                .unpacked
                .insert(candidate.record.filename.clone(), candidate.stamp.clone());
            manifest.record(HistoryEvent::new(
                "unpack",
                "unpacked",
                json!({
                    "kind": candidate.record.kind.as_str(),
                    "filename": candidate.record.filename,
                    "target_dir": target,
                    "files": stats.files,
                    "skipped_links": stats.skipped,
                    "strip_prefix": prefix.join("/"),
                    "rejected": rejected,
                }),
            ));
            Ok(())
        })?;
        Ok(())
    }

    fn record_failure(
        &self,
        layout: &UnitLayout,
        candidate: &UnpackCandidate,
        err: &AlmaError,
    ) -> Result<(), AlmaError> {
        let message = err.to_string();
        self.manifests.update(layout, |manifest| {
            if let Some(entry) =
                manifest.artifact_mut(candidate.record.kind, &candidate.record.filename)
            {
                entry.unpack_error = Some(message.clone());
            }
            manifest.record(HistoryEvent::new(
                "unpack",
                "unpack_failed",
                json!({
                    "kind": candidate.record.kind.as_str(),
                    "filename": candidate.record.filename,
                    "error": message,
                }),
            ));
            Ok(())
        })?;
        Ok(())
    }

    /// Deletes a verified, recorded archive. A delete that fails leaves the
    /// archive in place, lands in history and the report, and does not stop
    /// the unit. Deleting outside the unit directory stays fatal.
    fn remove_after_unpack(
        &self,
        layout: &UnitLayout,
        candidate: &UnpackCandidate,
        report: &mut UnpackReport,
    ) -> Result<(), AlmaError> {
        let filename = &candidate.record.filename;
        match self.remove_archive(layout, candidate) {
            Ok(()) => report.removed.push(filename.clone()),
            Err(err) if is_fatal(&err) => return Err(err),
            Err(err) => {
                let message = err.to_string();
                warn!(archive = %filename, error = %message, "archive removal failed");
                self.record_remove_failure(layout, filename, &message)?;
                report.errors.push(format!("{filename}: {message}"));
            }
        }
        Ok(())
    }

    fn remove_archive(
        &self,
        layout: &UnitLayout,
        candidate: &UnpackCandidate,
    ) -> Result<(), AlmaError> {
        ensure_inside_unit(layout, &candidate.archive)?;
        fs::remove_file(&candidate.archive)
            .map_err(|err| AlmaError::Filesystem(err.to_string()))?;
        self.manifests.update(layout, |manifest| {
            if let Some(entry) =
                manifest.artifact_mut(candidate.record.kind, &candidate.record.filename)
            {
                entry.archive_removed_after_unpack = true;
            }
            manifest.record(HistoryEvent::new(
                "unpack",
                "archive_removed",
                json!({ "filename": candidate.record.filename }),
            ));
            Ok(())
        })?;
        Ok(())
    }

    fn record_remove_failure(
        &self,
        layout: &UnitLayout,
        archive: &str,
        message: &str,
    ) -> Result<(), AlmaError> {
        self.manifests.append_history(
            layout,
            HistoryEvent::new(
                "unpack",
                "archive_remove_failed",
                json!({ "filename": archive, "error": message }),
            ),
        )?;
        Ok(())
    }

    /// Expands nested archives below `delivered/` that match the recursive
    /// patterns, pass after pass, until nothing new is found.
    fn recursive_unpack(&self, layout: &UnitLayout) -> Result<RecursiveSummary, AlmaError> {
        let mut summary = RecursiveSummary {
            enabled: true,
            ..RecursiveSummary::default()
        };
        if self.policy.recursive_patterns.is_empty() {
            return Ok(summary);
        }
        let root = layout.root().as_std_path();
        let delivered = layout.delivered().into_std_path_buf();
        let mut processed: BTreeSet<PathBuf> = BTreeSet::new();
        let mut excluded: BTreeSet<String> = BTreeSet::new();

        for pass in 1..=self.policy.recursive_max_passes {
            let (stamps, deliverables) = match self.manifests.load(layout)? {
                Some(manifest) => {
                    let deliverables: BTreeSet<PathBuf> = manifest
                        .artifacts
                        .iter()
                        .filter_map(|record| record.local_path.as_deref().map(PathBuf::from))
                        .collect();
                    (manifest.unpacked, deliverables)
                }
                None => (BTreeMap::new(), BTreeSet::new()),
            };

            let mut candidates = Vec::new();
            for path in walk_files(&delivered)? {
                if !fs_util::is_archive(&path)
                    || processed.contains(&path)
                    || deliverables.contains(&path)
                {
                    continue;
                }
                let rel = relative_key(root, &path);
                if !matches_any(&path, &rel, &self.policy.recursive_patterns) {
                    continue;
                }
                if self.is_excluded(&path, &rel) {
                    excluded.insert(rel);
                    continue;
                }
                let Ok(meta) = fs::metadata(&path) else {
                    continue;
                };
                let stamp = stamp_for(meta.len(), meta.modified().unwrap_or(UNIX_EPOCH));
                if stamps.get(&rel) == Some(&stamp) {
                    continue;
                }
                candidates.push((path, rel, stamp));
            }
            if candidates.is_empty() {
                break;
            }

            let mut pass_info = RecursivePass {
                pass,
                ..RecursivePass::default()
            };
            for (archive, rel, stamp) in candidates {
                processed.insert(archive.clone());
                match self.unpack_nested(layout, &archive, &rel, &stamp) {
                    Ok(()) => {
                        summary.unpacked_count += 1;
                        pass_info.archives.push(rel);
                    }
                    Err(err) if is_fatal(&err) => return Err(err),
                    Err(err) => {
                        warn!(archive = %rel, error = %err, "nested unpack failed");
                        summary.error_count += 1;
                        pass_info.errors.push(format!("{rel}: {err}"));
                    }
                }
            }
            summary.passes.push(pass_info);
        }

        summary.excluded = excluded.into_iter().collect();
        if summary.error_count > 0 {
            let errors: Vec<String> = summary
                .passes
                .iter()
                .flat_map(|pass| pass.errors.iter().cloned())
                .collect();
            self.manifests.append_history(
                layout,
                HistoryEvent::new("unpack", "nested_unpack_failed", json!({ "errors": errors })),
            )?;
        }
        Ok(summary)
    }

    fn unpack_nested(
        &self,
        layout: &UnitLayout,
        archive: &Path,
        rel: &str,
        stamp: &str,
    ) -> Result<(), AlmaError> {
        let target = archive
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| layout.delivered().into_std_path_buf());
        let parent_name = target
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        let names = fs_util::entry_names(archive)?;
        let prefix = detect_parent_redundant_prefix(&names, &parent_name).unwrap_or_default();
        let stats = fs_util::extract_archive(archive, &target, &prefix)?;
        if stats.files == 0 {
            return Err(AlmaError::extraction(archive, "archive produced no files"));
        }

        let removed = if self.policy.remove_archives_after_unpack {
            ensure_inside_unit(layout, archive)?;
            match fs::remove_file(archive) {
                Ok(()) => true,
                Err(err) => {
                    let message = err.to_string();
                    warn!(archive = %rel, error = %message, "archive removal failed");
                    self.record_remove_failure(layout, rel, &message)?;
                    false
                }
            }
        } else {
            false
        };
        info!(archive = %rel, files = stats.files, removed, "nested archive unpacked");

        self.manifests.update(layout, |manifest| {
            manifest.unpacked.insert(rel.to_string(), stamp.to_string());
            manifest.record(HistoryEvent::new(
                "unpack",
                "nested_unpacked",
                json!({
                    "archive": rel,
                    "files": stats.files,
                    "strip_prefix": prefix.join("/"),
                    "archive_removed": removed,
                }),
            ));
            Ok(())
        })?;
        Ok(())
    }

    fn is_excluded(&self, path: &Path, rel: &str) -> bool {
        matches_any(path, rel, &[FLAGVERSIONS_PATTERN.to_string()])
            || matches_any(path, rel, &self.policy.recursive_exclude_patterns)
    }
}

fn is_fatal(err: &AlmaError) -> bool {
    matches!(
        err,
        AlmaError::DocumentCorruption { .. } | AlmaError::PolicyViolation { .. }
    )
}

fn epoch_secs(modified: SystemTime) -> u64 {
    modified
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

fn stamp_for(size: u64, modified: SystemTime) -> String {
    format!("{size}:{}", epoch_secs(modified))
}

/// Per kind, the newest archive that was already extracted and then removed.
/// Its stamp still carries the modification time it won with.
fn settled_versions(
    manifest: &OperationalManifest,
    policy: &UnpackPolicy,
) -> BTreeMap<ArtifactKind, (u64, String)> {
    let mut settled: BTreeMap<ArtifactKind, (u64, String)> = BTreeMap::new();
    for record in &manifest.artifacts {
        if !record.unpacked || !policy.unpacks(record.kind) {
            continue;
        }
        let on_disk = record
            .local_path
            .as_deref()
            .is_some_and(|path| Path::new(path).is_file());
        if on_disk {
            continue;
        }
        let Some(secs) = manifest
            .unpacked
            .get(&record.filename)
            .and_then(|stamp| stamp.rsplit(':').next())
            .and_then(|secs| secs.parse::<u64>().ok())
        else {
            continue;
        };
        let replace = settled.get(&record.kind).is_none_or(|(best, name)| {
            secs > *best || (secs == *best && record.filename.as_str() < name.as_str())
        });
        if replace {
            settled.insert(record.kind, (secs, record.filename.clone()));
        }
    }
    settled
}

fn relative_key(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

fn ensure_inside_unit(layout: &UnitLayout, path: &Path) -> Result<(), AlmaError> {
    let root = layout.root().as_std_path();
    let escapes = path
        .components()
        .any(|part| matches!(part, std::path::Component::ParentDir));
    if path.starts_with(root) && !escapes {
        return Ok(());
    }
    Err(AlmaError::PolicyViolation {
        action: format!("delete {}", path.display()),
        reason: format!("outside unit directory {}", layout.root()),
    })
}

/// Matches the file name or the unit-relative path, case-insensitively.
pub fn matches_any(path: &Path, rel: &str, patterns: &[String]) -> bool {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let name_lower = name.to_ascii_lowercase();
    let rel_lower = rel.to_ascii_lowercase();
    patterns.iter().any(|pattern| {
        let pattern_lower = pattern.to_ascii_lowercase();
        glob_match(pattern, &name)
            || glob_match(pattern, rel)
            || glob_match(&pattern_lower, &name_lower)
            || glob_match(&pattern_lower, &rel_lower)
    })
}

/// The `project/science_goal.uid___*/group.uid___*/member.uid___*` prefix, or
/// the same without the project, when every member agrees on it.
pub fn detect_unit_prefix(names: &[String]) -> Option<Vec<String>> {
    let mut detected: Option<Vec<String>> = None;
    for name in names {
        let parts = member_parts(name);
        let candidate = if parts.len() >= 5 && is_unit_triplet(&parts[1..4]) {
            parts[..4].to_vec()
        } else if parts.len() >= 4 && is_unit_triplet(&parts[..3]) {
            parts[..3].to_vec()
        } else {
            continue;
        };
        match &detected {
            None => detected = Some(candidate),
            Some(existing) if *existing == candidate => {}
            Some(_) => return None,
        }
    }
    detected
}

fn is_unit_triplet(parts: &[String]) -> bool {
    parts.len() == 3
        && parts[0].starts_with("science_goal.uid___")
        && parts[1].starts_with("group.uid___")
        && parts[2].starts_with("member.uid___")
}

fn prefix_matches_unit(prefix: &[String], mous_uid: &Uid) -> bool {
    prefix
        .last()
        .is_some_and(|member| *member == format!("member.{}", mous_uid.path_segment()))
}

/// A single top-level directory named like the archive's own parent.
pub fn detect_parent_redundant_prefix(names: &[String], parent_name: &str) -> Option<Vec<String>> {
    let tops: BTreeSet<String> = names
        .iter()
        .map(|name| member_parts(name))
        .filter(|parts| parts.len() >= 2)
        .map(|parts| parts[0].clone())
        .collect();
    if tops.len() == 1 && tops.iter().next().is_some_and(|top| top == parent_name) {
        return Some(tops.into_iter().collect());
    }
    None
}

fn backfill_identity(manifest: &mut OperationalManifest, prefix: &[String]) {
    let components = match prefix.len() {
        4 => &prefix[1..4],
        3 => prefix,
        _ => return,
    };
    let uid_of = |component: &str, label: &str| -> Option<Uid> {
        component
            .strip_prefix(label)
            .and_then(|rest| rest.strip_prefix('.'))
            .and_then(|segment| segment.parse().ok())
    };
    if manifest.science_goal_uid.is_none() {
        manifest.science_goal_uid = uid_of(&components[0], "science_goal");
    }
    if manifest.group_ous_uid.is_none() {
        manifest.group_ous_uid = uid_of(&components[1], "group");
    }
    if manifest.project_code.is_empty() && prefix.len() == 4 {
        manifest.project_code = prefix[0].clone();
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::domain::{UnitCandidate, UnitIdentity};

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|item| item.to_string()).collect()
    }

    #[test]
    fn detects_full_unit_prefix() {
        let listing = names(&[
            "2019.1.00001.S/science_goal.uid___A001_X1_X1/group.uid___A001_X1_X2/member.uid___A001_X1_X3/calibration/a.txt",
            "2019.1.00001.S/science_goal.uid___A001_X1_X1/group.uid___A001_X1_X2/member.uid___A001_X1_X3/README",
        ]);
        let prefix = detect_unit_prefix(&listing).unwrap();
        assert_eq!(prefix.len(), 4);
        assert!(prefix_matches_unit(&prefix, &"uid://A001/X1/X3".parse().unwrap()));
        assert!(!prefix_matches_unit(&prefix, &"uid://A001/X1/X9".parse().unwrap()));
    }

    #[test]
    fn inconsistent_prefixes_are_not_stripped() {
        let listing = names(&[
            "science_goal.uid___A_B_C/group.uid___A_B_D/member.uid___A_B_E/x",
            "science_goal.uid___A_B_C/group.uid___A_B_D/member.uid___A_B_F/y",
        ]);
        assert_eq!(detect_unit_prefix(&listing), None);
    }

    #[test]
    fn flagversions_excluded_by_pattern() {
        let patterns = vec!["*.tgz".to_string()];
        let path = Path::new("/u/delivered/uid___A.ms.flagversions.tgz");
        assert!(matches_any(path, "delivered/uid___A.ms.flagversions.tgz", &patterns));
        assert!(matches_any(
            path,
            "delivered/uid___A.ms.flagversions.tgz",
            &[FLAGVERSIONS_PATTERN.to_string()]
        ));
    }

    #[test]
    fn parent_redundant_prefix() {
        let listing = names(&["calibration/a.txt", "calibration/b/c.txt"]);
        assert_eq!(
            detect_parent_redundant_prefix(&listing, "calibration"),
            Some(vec!["calibration".to_string()])
        );
        assert_eq!(detect_parent_redundant_prefix(&listing, "delivered"), None);
    }

    fn removal_policy() -> UnpackPolicy {
        UnpackPolicy {
            enabled: ArtifactKind::ALL.into_iter().collect(),
            remove_archives_after_unpack: true,
            recursive_enabled: false,
            recursive_patterns: Vec::new(),
            recursive_exclude_patterns: Vec::new(),
            recursive_max_passes: 1,
        }
    }

    fn candidate_at(archive: PathBuf) -> UnpackCandidate {
        let filename = archive
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        let mut record = ArtifactRecord::new(ArtifactKind::Auxiliary, &filename, "");
        record.status = ArtifactStatus::Complete;
        record.local_path = Some(archive.display().to_string());
        UnpackCandidate {
            record,
            target_dir: archive.parent().map(Path::to_path_buf).unwrap_or_default(),
            archive,
            stamp: "1:1".to_string(),
        }
    }

    #[test]
    fn failed_archive_delete_is_recorded_and_not_fatal() {
        let temp = tempfile::tempdir().unwrap();
        let layout = UnitLayout::new(
            camino::Utf8PathBuf::from_path_buf(temp.path().join("member.unit")).unwrap(),
        );
        layout.ensure().unwrap();
        let manifests = ManifestStore::new();
        let identity = UnitIdentity::new("2019.1.00001.S", "uid://A001/X1/X3".parse().unwrap());
        manifests
            .initialize(&layout, &UnitCandidate::new(identity))
            .unwrap();
        let policy = removal_policy();
        let controller = UnpackController::new(&manifests, &policy);

        // A directory in the archive's place cannot be unlinked, even by root.
        let stuck = layout.delivered().as_std_path().join("stuck.tgz");
        fs::create_dir_all(&stuck).unwrap();
        let loose = layout.delivered().as_std_path().join("loose.tgz");
        fs::write(&loose, b"x").unwrap();

        let mut report = UnpackReport::default();
        controller
            .remove_after_unpack(&layout, &candidate_at(stuck.clone()), &mut report)
            .unwrap();
        controller
            .remove_after_unpack(&layout, &candidate_at(loose.clone()), &mut report)
            .unwrap();

        assert!(stuck.exists());
        assert!(!loose.exists());
        assert_eq!(report.removed, vec!["loose.tgz".to_string()]);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("stuck.tgz: "));
        let history = manifests.load(&layout).unwrap().unwrap().history;
        let failed = history
            .iter()
            .find(|event| event.decision == "archive_remove_failed")
            .unwrap();
        assert_eq!(failed.detail["filename"], "stuck.tgz");
        assert!(
            history
                .iter()
                .any(|event| event.decision == "archive_removed")
        );
    }

    #[test]
    fn deleting_outside_the_unit_stays_fatal() {
        let temp = tempfile::tempdir().unwrap();
        let layout = UnitLayout::new(
            camino::Utf8PathBuf::from_path_buf(temp.path().join("member.unit")).unwrap(),
        );
        layout.ensure().unwrap();
        let manifests = ManifestStore::new();
        let policy = removal_policy();
        let controller = UnpackController::new(&manifests, &policy);
        let outside = temp.path().join("elsewhere.tgz");
        fs::write(&outside, b"x").unwrap();

        let mut report = UnpackReport::default();
        let err = controller
            .remove_after_unpack(&layout, &candidate_at(outside.clone()), &mut report)
            .unwrap_err();
        assert_matches!(err, AlmaError::PolicyViolation { .. });
        assert!(outside.exists());
    }
}
