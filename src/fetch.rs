use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::app::RunBudget;
use crate::archive::{ArchiveClient, Deliverable};
use crate::config::FetchPolicy;
use crate::domain::{ArtifactStatus, Uid};
use crate::error::AlmaError;
use crate::layout::UnitLayout;
use crate::manifest::{ArtifactRecord, HistoryEvent, ManifestStore};
use crate::store::now_utc;

const MAX_BACKOFF_MS: u64 = 10_000;

#[derive(Debug, Clone, Default, Serialize)]
pub struct FetchReport {
    pub mous_uid: String,
    pub planned: usize,
    pub already_complete: usize,
    pub adopted: usize,
    pub downloaded: usize,
    pub failed: usize,
    pub interrupted: usize,
    pub errors: Vec<String>,
}

/// Drives the deliverables of one unit from listing to verified files.
pub struct ArtifactFetcher<'a> {
    client: &'a dyn ArchiveClient,
    manifests: &'a ManifestStore,
    policy: &'a FetchPolicy,
    budget: &'a RunBudget,
}

enum Outcome {
    Complete,
    Failed(String),
    Interrupted,
}

impl<'a> ArtifactFetcher<'a> {
    pub fn new(
        client: &'a dyn ArchiveClient,
        manifests: &'a ManifestStore,
        policy: &'a FetchPolicy,
        budget: &'a RunBudget,
    ) -> Self {
        Self {
            client,
            manifests,
            policy,
            budget,
        }
    }

    /// Lists, plans and downloads every selected deliverable of the unit.
    pub fn fetch_unit(
        &self,
        layout: &UnitLayout,
        mous_uid: &Uid,
    ) -> Result<FetchReport, AlmaError> {
        let mut report = FetchReport {
            mous_uid: mous_uid.to_string(),
            ..FetchReport::default()
        };
        let (planned, adopted) = self.plan(layout, mous_uid)?;
        report.planned = planned.len();
        report.adopted = adopted;

        let pending: VecDeque<ArtifactRecord> = planned
            .into_iter()
            .filter(|record| record.status != ArtifactStatus::Complete)
            .collect();
        report.already_complete = report.planned.saturating_sub(pending.len() + adopted);

        if !pending.is_empty() {
            info!(unit = %mous_uid, artifacts = pending.len(), "downloading");
        }
        let outcomes = self.fetch_pending(layout, pending)?;
        for (record, outcome) in &outcomes {
            match outcome {
                Outcome::Complete => report.downloaded += 1,
                Outcome::Failed(message) => {
                    report.failed += 1;
                    report.errors.push(format!("{}: {message}", record.filename));
                }
                Outcome::Interrupted => report.interrupted += 1,
            }
        }

        if report.downloaded + report.failed + report.adopted > 0 {
            self.manifests.append_history(
                layout,
                HistoryEvent::new(
                    "download",
                    "fetched",
                    json!({
                        "selected_kinds": self
                            .policy
                            .selected
                            .iter()
                            .map(|kind| kind.as_str())
                            .collect::<Vec<_>>(),
                        "adopted": report.adopted,
                        "downloaded": report.downloaded,
                        "failed": report.failed,
                    }),
                ),
            )?;
        }
        Ok(report)
    }

    /// Merges the archive listing into the manifest. Returns the selected
    /// records in `(kind, filename)` order and how many local files were
    /// adopted without a transfer.
    pub fn plan(
        &self,
        layout: &UnitLayout,
        mous_uid: &Uid,
    ) -> Result<(Vec<ArtifactRecord>, usize), AlmaError> {
        let mut listing: Vec<Deliverable> = self
            .client
            .list_deliverables(mous_uid)?
            .into_iter()
            .filter(|item| self.policy.selected.contains(&item.kind))
            .collect();
        listing.sort_by(|a, b| (a.kind, &a.filename).cmp(&(b.kind, &b.filename)));
        listing.dedup_by(|a, b| a.kind == b.kind && a.filename == b.filename);

        let delivered = layout.delivered();
        let mut adopted_names = Vec::new();
        let manifest = self.manifests.update(layout, |manifest| {
            for item in &listing {
                let local = delivered.join(&item.filename);
                let mut record = manifest
                    .artifact(item.kind, &item.filename)
                    .cloned()
                    .unwrap_or_else(|| ArtifactRecord::new(item.kind, &item.filename, &item.url));
                record.url = item.url.clone();
                record.local_path = Some(local.to_string());
                if item.size_bytes.is_some() {
                    record.size_bytes = item.size_bytes;
                }
                if item.checksum.is_some() {
                    record.checksum = item.checksum.clone();
                }
                if item.semantics.is_some() {
                    record.semantics = item.semantics.clone();
                }
                if item.description.is_some() {
                    record.description = item.description.clone();
                }

                if record.is_satisfied() {
                    manifest.upsert_artifact(record);
                    continue;
                }
                if local.is_file()
                    && verify_file(
                        local.as_std_path(),
                        record.size_bytes,
                        record.checksum.as_deref(),
                    )
                    .is_ok()
                {
                    let now = now_utc();
                    record.status = ArtifactStatus::Complete;
                    record.bytes_received = file_size(local.as_std_path());
                    record.error = None;
                    record.downloaded_at.get_or_insert(now.clone());
                    record.updated_at = Some(now);
                    adopted_names.push(item.filename.clone());
                } else if record.status != ArtifactStatus::Pending {
                    record.status = ArtifactStatus::Pending;
                    record.updated_at = Some(now_utc());
                }
                manifest.upsert_artifact(record);
            }
            if !adopted_names.is_empty() {
                manifest.record(HistoryEvent::new(
                    "download",
                    "adopted_existing",
                    json!({ "files": adopted_names }),
                ));
            }
            Ok(())
        })?;

        let planned = listing
            .iter()
            .filter_map(|item| manifest.artifact(item.kind, &item.filename).cloned())
            .collect();
        Ok((planned, adopted_names.len()))
    }

    fn fetch_pending(
        &self,
        layout: &UnitLayout,
        pending: VecDeque<ArtifactRecord>,
    ) -> Result<Vec<(ArtifactRecord, Outcome)>, AlmaError> {
        if pending.is_empty() {
            return Ok(Vec::new());
        }
        let workers = self.policy.max_workers.clamp(1, pending.len());
        let queue = Mutex::new(pending);
        let results = Mutex::new(Vec::new());
        let fatal: Mutex<Option<AlmaError>> = Mutex::new(None);

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    loop {
                        let next = match queue.lock() {
                            Ok(mut queue) => queue.pop_front(),
                            Err(_) => None,
                        };
                        let Some(record) = next else {
                            break;
                        };
                        match self.fetch_one(layout, &record) {
                            Ok(outcome) => {
                                if let Ok(mut results) = results.lock() {
                                    results.push((record, outcome));
                                }
                            }
                            Err(err) => {
                                if let Ok(mut fatal) = fatal.lock() {
                                    fatal.get_or_insert(err);
                                }
                                if let Ok(mut queue) = queue.lock() {
                                    queue.clear();
                                }
                                break;
                            }
                        }
                    }
                });
            }
        });

        if let Some(err) = fatal
            .into_inner()
            .map_err(|_| AlmaError::Filesystem("fetch worker poisoned".to_string()))?
        {
            return Err(err);
        }
        let mut results = results
            .into_inner()
            .map_err(|_| AlmaError::Filesystem("fetch worker poisoned".to_string()))?;
        results.sort_by(|a, b| a.0.key().cmp(&b.0.key()));
        Ok(results)
    }

    /// Transfers one artifact with bounded retries. Only manifest-level
    /// failures are returned as errors; transfer failures end in `Failed`.
    fn fetch_one(
        &self,
        layout: &UnitLayout,
        record: &ArtifactRecord,
    ) -> Result<Outcome, AlmaError> {
        let local = layout.delivered().join(&record.filename).into_std_path_buf();
        let part = part_path(&local);
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent).map_err(|err| AlmaError::Filesystem(err.to_string()))?;
        }

        self.transition(layout, record, |entry| {
            entry.status = ArtifactStatus::Downloading;
            entry.bytes_received = file_size(&part);
        })?;

        let mut last_error = String::from("no attempt made");
        let mut attempts_made = 0u32;
        for attempt in 1..=self.policy.retry_count {
            if self.budget.exhausted() {
                info!(file = %record.filename, "run budget exhausted; leaving transfer resumable");
                return Ok(Outcome::Interrupted);
            }

            attempts_made += 1;
            match self.attempt(record, &local, &part) {
                Ok(sha256) => {
                    let size = file_size(&local);
                    self.transition(layout, record, |entry| {
                        let now = now_utc();
                        entry.status = ArtifactStatus::Complete;
                        entry.error = None;
                        entry.bytes_received = size;
                        entry.attempts += attempts_made;
                        entry.local_path = Some(local.display().to_string());
                        if entry.size_bytes.is_none() {
                            entry.size_bytes = Some(size);
                        }
                        if entry.checksum.is_none() {
                            if let Some(sha) = &sha256 {
                                entry.checksum = Some(format!("sha256:{sha}"));
                            }
                        }
                        entry.downloaded_at = Some(now.clone());
                        entry.updated_at = Some(now);
                        entry.archive_removed_after_unpack = false;
                    })?;
                    info!(file = %record.filename, bytes = size, "artifact complete");
                    if self.policy.rate_limit_ms > 0 {
                        thread::sleep(Duration::from_millis(self.policy.rate_limit_ms));
                    }
                    return Ok(Outcome::Complete);
                }
                Err(err) => {
                    last_error = err.to_string();
                    let progress = file_size(&part);
                    self.transition(layout, record, |entry| {
                        entry.bytes_received = progress;
                        entry.error = Some(last_error.clone());
                    })?;
                    if !err.is_retryable() && !matches!(err, AlmaError::ArchiveHttp(_)) {
                        warn!(
                            file = %record.filename,
                            error = %err,
                            "non-retryable transfer failure"
                        );
                        break;
                    }
                    warn!(
                        file = %record.filename,
                        attempt,
                        error = %err,
                        "transfer attempt failed"
                    );
                    if attempt < self.policy.retry_count {
                        thread::sleep(backoff(self.policy.retry_backoff_ms, attempt));
                    }
                }
            }
        }

        self.transition(layout, record, |entry| {
            entry.status = ArtifactStatus::Failed;
            entry.error = Some(last_error.clone());
            entry.attempts += attempts_made;
        })?;
        self.manifests.append_history(
            layout,
            HistoryEvent::new(
                "download",
                "artifact_failed",
                json!({
                    "kind": record.kind.as_str(),
                    "filename": record.filename,
                    "error": last_error,
                }),
            ),
        )?;
        Ok(Outcome::Failed(last_error))
    }

    /// One transfer into the `.part` file followed by verification and the
    /// rename into place. Returns the SHA-256 when one was computed.
    fn attempt(
        &self,
        record: &ArtifactRecord,
        local: &Path,
        part: &Path,
    ) -> Result<Option<String>, AlmaError> {
        let mut offset = file_size(part);
        if let Some(expected) = record.size_bytes {
            if offset > expected {
                debug!(file = %record.filename, "partial file longer than expected; restarting");
                remove_quietly(part);
                offset = 0;
            }
        }

        let complete_already = record
            .size_bytes
            .is_some_and(|expected| offset == expected && offset > 0);
        if !complete_already {
            let outcome = self.client.download(&record.url, part, offset)?;
            debug!(
                file = %record.filename,
                offset,
                resumed = outcome.resumed,
                bytes = outcome.bytes_written,
                "transfer finished"
            );
        }

        let verified = verify_file(part, record.size_bytes, record.checksum.as_deref());
        let mut sha256 = match verified {
            Ok(sha) => sha,
            Err(err) => {
                remove_quietly(part);
                return Err(err);
            }
        };
        if sha256.is_none() && self.policy.compute_sha256 && record.checksum.is_none() {
            sha256 = Some(sha256_file(part)?);
        }

        fs::rename(part, local).map_err(|err| AlmaError::Filesystem(err.to_string()))?;
        if let Some(parent) = local.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        Ok(sha256)
    }

    fn transition<F>(
        &self,
        layout: &UnitLayout,
        record: &ArtifactRecord,
        apply: F,
    ) -> Result<(), AlmaError>
    where
        F: FnOnce(&mut ArtifactRecord),
    {
        self.manifests.update(layout, |manifest| {
            if manifest.artifact(record.kind, &record.filename).is_none() {
                manifest.upsert_artifact(record.clone());
            }
            let entry = manifest
                .artifact_mut(record.kind, &record.filename)
                .ok_or_else(|| AlmaError::Filesystem("artifact vanished".to_string()))?;
            let before = entry.status;
            apply(entry);
            if entry.status != before {
                entry.updated_at = Some(now_utc());
            }
            Ok(())
        })?;
        Ok(())
    }
}

pub fn part_path(local: &Path) -> PathBuf {
    let mut name = local
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    local.with_file_name(name)
}

fn backoff(base_ms: u64, attempt: u32) -> Duration {
    let factor = 1u64 << attempt.saturating_sub(1).min(16);
    Duration::from_millis(base_ms.saturating_mul(factor).min(MAX_BACKOFF_MS))
}

fn file_size(path: &Path) -> u64 {
    fs::metadata(path).map(|meta| meta.len()).unwrap_or(0)
}

fn remove_quietly(path: &Path) {
    if path.exists() {
        if let Err(err) = fs::remove_file(path) {
            warn!(path = %path.display(), error = %err, "failed to discard partial file");
        }
    }
}

/// Size check, then SHA-256 when the archive reports one. Checksums in any
/// other form fall back to size-only with a warning.
pub fn verify_file(
    path: &Path,
    expected_size: Option<u64>,
    checksum: Option<&str>,
) -> Result<Option<String>, AlmaError> {
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().trim_end_matches(".part").to_string())
        .unwrap_or_default();
    let actual = fs::metadata(path)
        .map_err(|err| AlmaError::Verification {
            filename: filename.clone(),
            message: err.to_string(),
        })?
        .len();
    if let Some(expected) = expected_size {
        if actual != expected {
            return Err(AlmaError::Verification {
                filename,
                message: format!("expected {expected} bytes, got {actual}"),
            });
        }
    }

    let Some(checksum) = checksum.map(str::trim).filter(|value| !value.is_empty()) else {
        return Ok(None);
    };
    let Some(expected_sha) = sha256_hex(checksum) else {
        warn!(file = %filename, checksum, "unsupported checksum form; size-only verification");
        return Ok(None);
    };
    let actual_sha = sha256_file(path)?;
    if actual_sha != expected_sha {
        return Err(AlmaError::Verification {
            filename,
            message: format!("sha256 mismatch: expected {expected_sha}, got {actual_sha}"),
        });
    }
    Ok(Some(actual_sha))
}

fn sha256_hex(checksum: &str) -> Option<String> {
    let lower = checksum.to_ascii_lowercase();
    let hex = lower
        .strip_prefix("sha256:")
        .or_else(|| lower.strip_prefix("sha-256:"))
        .unwrap_or(&lower);
    (hex.len() == 64 && hex.chars().all(|ch| ch.is_ascii_hexdigit())).then(|| hex.to_string())
}

pub fn sha256_file(path: &Path) -> Result<String, AlmaError> {
    let mut file = File::open(path).map_err(|err| AlmaError::Filesystem(err.to_string()))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1 << 20];
    loop {
        let read = file
            .read(&mut buffer)
            .map_err(|err| AlmaError::Filesystem(err.to_string()))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
