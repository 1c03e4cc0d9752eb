use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{ArtifactKind, ArtifactStatus, Uid, UnitCandidate, UnitIdentity};
use crate::error::AlmaError;
use crate::layout::UnitLayout;
use crate::store::{now_utc, read_json_document, write_json_atomic};

pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

fn manifest_schema_version() -> u32 {
    MANIFEST_SCHEMA_VERSION
}

/// Per-unit operational state. Fields this version does not know about are
/// kept in `extra` and written back untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationalManifest {
    #[serde(default = "manifest_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub project_code: String,
    #[serde(default)]
    pub science_goal_uid: Option<Uid>,
    #[serde(default)]
    pub group_ous_uid: Option<Uid>,
    pub mous_uid: Uid,
    #[serde(default)]
    pub release_date: Option<String>,
    #[serde(default)]
    pub obs_date: Option<String>,
    #[serde(default)]
    pub band_list: Vec<String>,
    #[serde(default)]
    pub eb_uids: Vec<String>,
    #[serde(default)]
    pub qa2_passed: Option<bool>,
    #[serde(default)]
    pub qa0_status: Option<String>,
    #[serde(default)]
    pub qa0_reasons: Vec<String>,
    #[serde(default)]
    pub qa2_reasons: Vec<String>,
    #[serde(default)]
    pub local_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_timestamp: Option<String>,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
    #[serde(default)]
    pub artifacts: Vec<ArtifactRecord>,
    /// Extraction stamps (`size:mtime`) keyed by archive filename.
    #[serde(default)]
    pub unpacked: BTreeMap<String, String>,
    #[serde(default)]
    pub history: Vec<HistoryEvent>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub kind: ArtifactKind,
    pub filename: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub local_path: Option<String>,
    #[serde(default)]
    pub size_bytes: Option<u64>,
    #[serde(default)]
    pub checksum: Option<String>,
    pub status: ArtifactStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub bytes_received: u64,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub downloaded_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub unpacked: bool,
    #[serde(default)]
    pub unpacked_to: Option<String>,
    #[serde(default)]
    pub unpacked_at: Option<String>,
    #[serde(default)]
    pub archive_removed_after_unpack: bool,
    #[serde(default)]
    pub strip_prefix: Option<String>,
    #[serde(default)]
    pub unpack_error: Option<String>,
    #[serde(default)]
    pub semantics: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ArtifactRecord {
    pub fn new(kind: ArtifactKind, filename: &str, url: &str) -> Self {
        Self {
            kind,
            filename: filename.to_string(),
            url: url.to_string(),
            local_path: None,
            size_bytes: None,
            checksum: None,
            status: ArtifactStatus::Pending,
            error: None,
            bytes_received: 0,
            attempts: 0,
            downloaded_at: None,
            updated_at: None,
            unpacked: false,
            unpacked_to: None,
            unpacked_at: None,
            archive_removed_after_unpack: false,
            strip_prefix: None,
            unpack_error: None,
            semantics: None,
            description: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> (ArtifactKind, &str) {
        (self.kind, self.filename.as_str())
    }

    /// Complete and either still on disk or removed after a recorded unpack.
    pub fn is_satisfied(&self) -> bool {
        if self.status != ArtifactStatus::Complete {
            return false;
        }
        if self.archive_removed_after_unpack && self.unpacked_to.is_some() {
            return true;
        }
        self.local_path
            .as_deref()
            .is_some_and(|path| std::path::Path::new(path).is_file())
    }
}

/// One history entry. Entries written by older tools carry other keys
/// (`event`, `message`, ...); those land in `extra` and are written back as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    #[serde(default)]
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stage: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub decision: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub detail: Value,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl HistoryEvent {
    pub fn new(stage: &str, decision: &str, detail: Value) -> Self {
        Self {
            timestamp: now_utc(),
            stage: stage.to_string(),
            decision: decision.to_string(),
            detail,
            extra: BTreeMap::new(),
        }
    }
}

impl OperationalManifest {
    pub fn new(candidate: &UnitCandidate, layout: &UnitLayout) -> Self {
        let now = now_utc();
        let identity = &candidate.identity;
        let mut manifest = Self {
            schema_version: MANIFEST_SCHEMA_VERSION,
            project_code: identity.project_code.clone(),
            science_goal_uid: identity.science_goal_uid.clone(),
            group_ous_uid: identity.group_ous_uid.clone(),
            mous_uid: identity.mous_uid.clone(),
            release_date: None,
            obs_date: None,
            band_list: Vec::new(),
            eb_uids: Vec::new(),
            qa2_passed: None,
            qa0_status: None,
            qa0_reasons: Vec::new(),
            qa2_reasons: Vec::new(),
            local_dir: Some(layout.root().to_string()),
            query_timestamp: None,
            created_at: now.clone(),
            updated_at: now,
            artifacts: Vec::new(),
            unpacked: BTreeMap::new(),
            history: Vec::new(),
            extra: BTreeMap::new(),
        };
        manifest.absorb_candidate(candidate);
        manifest
    }

    pub fn identity(&self) -> UnitIdentity {
        UnitIdentity {
            project_code: self.project_code.clone(),
            science_goal_uid: self.science_goal_uid.clone(),
            group_ous_uid: self.group_ous_uid.clone(),
            mous_uid: self.mous_uid.clone(),
        }
    }

    /// Rebuilds a discovery record from the stored metadata.
    pub fn candidate(&self) -> UnitCandidate {
        UnitCandidate {
            identity: self.identity(),
            eb_uids: self.eb_uids.clone(),
            band_list: self.band_list.clone(),
            release_date: self.release_date.clone(),
            obs_date: self.obs_date.clone(),
            qa2_passed: self.qa2_passed,
            qa0_status: self.qa0_status.clone(),
            qa0_reasons: self.qa0_reasons.clone(),
            qa2_reasons: self.qa2_reasons.clone(),
            source_rows: 0,
            query_timestamp: self.query_timestamp.clone(),
        }
    }

    /// Refreshes archive metadata from a query row. Identity fields are only
    /// backfilled, never changed.
    pub fn absorb_candidate(&mut self, candidate: &UnitCandidate) {
        let identity = &candidate.identity;
        if self.project_code.is_empty() {
            self.project_code = identity.project_code.clone();
        }
        if self.science_goal_uid.is_none() {
            self.science_goal_uid = identity.science_goal_uid.clone();
        }
        if self.group_ous_uid.is_none() {
            self.group_ous_uid = identity.group_ous_uid.clone();
        }
        if candidate.release_date.is_some() {
            self.release_date = candidate.release_date.clone();
        }
        if candidate.obs_date.is_some() {
            self.obs_date = candidate.obs_date.clone();
        }
        if !candidate.band_list.is_empty() {
            self.band_list = candidate.band_list.clone();
        }
        if !candidate.eb_uids.is_empty() {
            self.eb_uids = candidate.eb_uids.clone();
        }
        if candidate.qa2_passed.is_some() {
            self.qa2_passed = candidate.qa2_passed;
        }
        if candidate.qa0_status.is_some() {
            self.qa0_status = candidate.qa0_status.clone();
        }
        if !candidate.qa0_reasons.is_empty() {
            self.qa0_reasons = candidate.qa0_reasons.clone();
        }
        if !candidate.qa2_reasons.is_empty() {
            self.qa2_reasons = candidate.qa2_reasons.clone();
        }
        if candidate.query_timestamp.is_some() {
            self.query_timestamp = candidate.query_timestamp.clone();
        }
    }

    pub fn artifact(&self, kind: ArtifactKind, filename: &str) -> Option<&ArtifactRecord> {
        self.artifacts
            .iter()
            .find(|record| record.key() == (kind, filename))
    }

    pub fn artifact_mut(
        &mut self,
        kind: ArtifactKind,
        filename: &str,
    ) -> Option<&mut ArtifactRecord> {
        self.artifacts
            .iter_mut()
            .find(|record| record.key() == (kind, filename))
    }

    /// Replaces the record with the same `(kind, filename)` or appends it.
    pub fn upsert_artifact(&mut self, record: ArtifactRecord) {
        let position = self
            .artifacts
            .iter()
            .position(|existing| existing.key() == record.key());
        match position {
            Some(index) => self.artifacts[index] = record,
            None => self.artifacts.push(record),
        }
    }

    pub fn record(&mut self, event: HistoryEvent) {
        self.history.push(event);
    }

    fn content_eq(&self, other: &Self) -> bool {
        let strip = |manifest: &Self| {
            let mut copy = manifest.clone();
            copy.history.clear();
            copy.updated_at.clear();
            copy
        };
        strip(self) == strip(other)
    }
}

/// Serializes writers per unit within this process and persists every change
/// atomically. Cross-process writers on one unit are not supported.
#[derive(Default)]
pub struct ManifestStore {
    locks: Mutex<HashMap<Utf8PathBuf, Arc<Mutex<()>>>>,
}

impl ManifestStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self, layout: &UnitLayout) -> Result<Option<OperationalManifest>, AlmaError> {
        read_json_document(layout.manifest_path().as_std_path())
    }

    /// Creates the manifest for a discovered unit, or refreshes the archive
    /// metadata of an existing one.
    pub fn initialize(
        &self,
        layout: &UnitLayout,
        candidate: &UnitCandidate,
    ) -> Result<OperationalManifest, AlmaError> {
        let lock = self.unit_lock(layout)?;
        let _guard = lock
            .lock()
            .map_err(|_| AlmaError::Filesystem("manifest lock poisoned".to_string()))?;

        match self.load(layout)? {
            Some(current) => {
                if current.mous_uid != candidate.identity.mous_uid {
                    return Err(AlmaError::PolicyViolation {
                        action: "manifest initialize".to_string(),
                        reason: format!(
                            "{} already holds {}",
                            layout.manifest_path(),
                            current.mous_uid
                        ),
                    });
                }
                let mut next = current.clone();
                next.absorb_candidate(candidate);
                self.commit(layout, &current, next)
            }
            None => {
                let mut manifest = OperationalManifest::new(candidate, layout);
                manifest.record(HistoryEvent::new(
                    "discover",
                    "manifest_created",
                    serde_json::json!({ "mous_uid": candidate.identity.mous_uid.as_str() }),
                ));
                write_json_atomic(layout.manifest_path().as_std_path(), &manifest)?;
                Ok(manifest)
            }
        }
    }

    /// Applies `mutation` to the current document and persists the result.
    /// History may only grow and set identity fields may not change.
    pub fn update<F>(
        &self,
        layout: &UnitLayout,
        mutation: F,
    ) -> Result<OperationalManifest, AlmaError>
    where
        F: FnOnce(&mut OperationalManifest) -> Result<(), AlmaError>,
    {
        let lock = self.unit_lock(layout)?;
        let _guard = lock
            .lock()
            .map_err(|_| AlmaError::Filesystem("manifest lock poisoned".to_string()))?;

        let current = self.load(layout)?.ok_or_else(|| {
            AlmaError::Filesystem(format!("no manifest at {}", layout.manifest_path()))
        })?;
        let mut next = current.clone();
        mutation(&mut next)?;
        self.commit(layout, &current, next)
    }

    pub fn append_history(
        &self,
        layout: &UnitLayout,
        event: HistoryEvent,
    ) -> Result<OperationalManifest, AlmaError> {
        self.update(layout, |manifest| {
            manifest.record(event);
            Ok(())
        })
    }

    fn commit(
        &self,
        layout: &UnitLayout,
        current: &OperationalManifest,
        mut next: OperationalManifest,
    ) -> Result<OperationalManifest, AlmaError> {
        check_history_append_only(current, &next)?;
        check_identity_stable(current, &next)?;

        let content_changed = !current.content_eq(&next);
        if content_changed {
            next.updated_at = now_utc();
        } else {
            next.updated_at = current.updated_at.clone();
        }
        if content_changed || next.history.len() != current.history.len() {
            write_json_atomic(layout.manifest_path().as_std_path(), &next)?;
        }
        Ok(next)
    }

    fn unit_lock(&self, layout: &UnitLayout) -> Result<Arc<Mutex<()>>, AlmaError> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| AlmaError::Filesystem("manifest lock table poisoned".to_string()))?;
        Ok(locks
            .entry(layout.root().to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone())
    }
}

fn check_history_append_only(
    current: &OperationalManifest,
    next: &OperationalManifest,
) -> Result<(), AlmaError> {
    let kept = next.history.len() >= current.history.len()
        && next.history[..current.history.len()] == current.history[..];
    if kept {
        Ok(())
    } else {
        Err(AlmaError::PolicyViolation {
            action: "history rewrite".to_string(),
            reason: format!("history of {} is append-only", current.mous_uid),
        })
    }
}

fn check_identity_stable(
    current: &OperationalManifest,
    next: &OperationalManifest,
) -> Result<(), AlmaError> {
    let changed = |field: &str| AlmaError::PolicyViolation {
        action: "identity change".to_string(),
        reason: format!("{field} of {} is immutable once set", current.mous_uid),
    };
    if current.mous_uid != next.mous_uid {
        return Err(changed("mous_uid"));
    }
    if !current.project_code.is_empty() && current.project_code != next.project_code {
        return Err(changed("project_code"));
    }
    if current.science_goal_uid.is_some() && current.science_goal_uid != next.science_goal_uid {
        return Err(changed("science_goal_uid"));
    }
    if current.group_ous_uid.is_some() && current.group_ous_uid != next.group_ous_uid {
        return Err(changed("group_ous_uid"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_keeps_kind_filename_unique() {
        let candidate = UnitCandidate::new(UnitIdentity::new(
            "2019.1.00001.S",
            "uid://A001/X1/X3".parse().unwrap(),
        ));
        let mut manifest = OperationalManifest::new(&candidate, &UnitLayout::new("/tmp/u"));
        let record = ArtifactRecord::new(ArtifactKind::Auxiliary, "a.tgz", "https://x/a.tgz");
        manifest.upsert_artifact(record.clone());
        let mut updated = record;
        updated.size_bytes = Some(10);
        manifest.upsert_artifact(updated);
        assert_eq!(manifest.artifacts.len(), 1);
        assert_eq!(manifest.artifacts[0].size_bytes, Some(10));
    }
}
