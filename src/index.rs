use std::fs;
use std::path::{Path, PathBuf};

use camino::Utf8Path;
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::domain::{ArtifactStatus, QaStatus, Uid};
use crate::error::AlmaError;
use crate::layout::{UnitLayout, find_unit_dirs};
use crate::manifest::OperationalManifest;
use crate::store::read_json_document;
use crate::summary::AnalysisSummary;

pub const INDEX_FILENAME: &str = "alma_index.sqlite";
pub const INDEX_SCHEMA_VERSION: &str = "index.v1";

/// Flattened projection of one unit's manifest and summary. Holds no
/// wall-clock fields of its own; `provenance_at` comes from the documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub mous_uid: Uid,
    pub project_code: Option<String>,
    pub science_goal_uid: Option<String>,
    pub group_ous_uid: Option<String>,
    pub release_date: Option<String>,
    pub obs_date: Option<String>,
    pub bands: Vec<String>,
    pub qa2_status: String,
    pub qa0_status: Option<String>,
    pub qa2_reasons: Vec<String>,
    pub qa0_reasons: Vec<String>,
    pub dr_intervention_suspected: bool,
    pub dr_flag_commands_count: u64,
    pub dr_manual_flag_commands_count: u64,
    pub asa_qa_present: bool,
    pub local_dir: Option<String>,
    pub manifest_path: Option<String>,
    pub summary_path: Option<String>,
    pub discovered: bool,
    pub downloaded: bool,
    pub unpacked: bool,
    pub summarized: bool,
    pub last_error_stage: Option<String>,
    pub last_error_message: Option<String>,
    pub shard_id: Option<String>,
    pub provenance_at: Option<String>,
    pub eb_uids: Vec<String>,
    pub artifacts: Vec<IndexedArtifact>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexedArtifact {
    pub filename: String,
    pub kind: String,
    pub status: String,
    pub local_path: Option<String>,
    pub source_url: Option<String>,
    pub size_bytes: Option<u64>,
    pub checksum: Option<String>,
    pub updated_at: Option<String>,
}

impl IndexRecord {
    /// Builds the record for a unit directory from whichever documents it
    /// holds. At least one of them must be present.
    pub fn from_documents(
        layout: &UnitLayout,
        manifest: Option<&OperationalManifest>,
        summary: Option<&AnalysisSummary>,
        shard_id: Option<&str>,
    ) -> Result<Self, AlmaError> {
        let mous_uid = summary
            .map(|summary| summary.mous.mous_uid.clone())
            .or_else(|| manifest.map(|manifest| manifest.mous_uid.clone()))
            .ok_or_else(|| {
                AlmaError::Index(format!("no manifest or summary under {}", layout.root()))
            })?;

        let non_empty = |value: &str| Some(value.to_string()).filter(|value| !value.is_empty());
        let project_code = summary
            .and_then(|summary| non_empty(&summary.mous.project_code))
            .or_else(|| manifest.and_then(|manifest| non_empty(&manifest.project_code)));
        let science_goal_uid = summary
            .and_then(|summary| summary.mous.science_goal_uid.clone())
            .or_else(|| manifest.and_then(|manifest| manifest.science_goal_uid.clone()))
            .map(|uid| uid.to_string());
        let group_ous_uid = summary
            .and_then(|summary| summary.mous.group_ous_uid.clone())
            .or_else(|| manifest.and_then(|manifest| manifest.group_ous_uid.clone()))
            .map(|uid| uid.to_string());
        let release_date = summary
            .and_then(|summary| summary.mous.public_release_date.clone())
            .or_else(|| manifest.and_then(|manifest| manifest.release_date.clone()));
        let obs_date = summary
            .and_then(|summary| summary.mous.obs_date.clone())
            .or_else(|| manifest.and_then(|manifest| manifest.obs_date.clone()));
        let bands = summary
            .map(|summary| summary.mous.band.clone())
            .filter(|bands| !bands.is_empty())
            .or_else(|| manifest.map(|manifest| manifest.band_list.clone()))
            .unwrap_or_default();

        let qa2_status = match summary {
            Some(summary) => summary.qa.qa2_status,
            None => QaStatus::from_passed(manifest.and_then(|manifest| manifest.qa2_passed)),
        };
        let qa2_reasons = summary
            .map(|summary| summary.qa.qa2_reasons.clone())
            .filter(|reasons| !reasons.is_empty())
            .or_else(|| manifest.map(|manifest| manifest.qa2_reasons.clone()))
            .unwrap_or_default();

        let mut eb_uids: Vec<String> = summary
            .map(|summary| summary.eb_uids().into_iter().collect())
            .unwrap_or_default();
        if eb_uids.is_empty() {
            eb_uids = manifest
                .map(|manifest| manifest.eb_uids.clone())
                .unwrap_or_default();
        }
        eb_uids.sort();
        eb_uids.dedup();

        let mut artifacts: Vec<IndexedArtifact> = manifest
            .map(|manifest| {
                manifest
                    .artifacts
                    .iter()
                    .map(|record| IndexedArtifact {
                        filename: record.filename.clone(),
                        kind: record.kind.as_str().to_string(),
                        status: record.status.as_str().to_string(),
                        local_path: record.local_path.clone(),
                        source_url: Some(record.url.clone()).filter(|url| !url.is_empty()),
                        size_bytes: record.size_bytes,
                        checksum: record.checksum.clone(),
                        updated_at: record.updated_at.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        artifacts.sort();
        artifacts.dedup_by(|a, b| a.filename == b.filename);

        let (last_error_stage, last_error_message) = manifest
            .and_then(last_error)
            .map(|(stage, message)| (Some(stage), Some(message)))
            .unwrap_or((None, None));

        let provenance_at = [
            manifest.map(|manifest| manifest.updated_at.clone()),
            summary.map(|summary| summary.provenance.summary_generated_at.clone()),
        ]
        .into_iter()
        .flatten()
        .filter(|stamp| !stamp.is_empty())
        .max();

        Ok(Self {
            mous_uid,
            project_code,
            science_goal_uid,
            group_ous_uid,
            release_date,
            obs_date,
            bands,
            qa2_status: qa2_status.as_str().to_string(),
            qa0_status: manifest.and_then(|manifest| manifest.qa0_status.clone()),
            qa2_reasons,
            qa0_reasons: manifest
                .map(|manifest| manifest.qa0_reasons.clone())
                .unwrap_or_default(),
            dr_intervention_suspected: summary
                .is_some_and(|summary| summary.dr.dr_intervention_suspected),
            dr_flag_commands_count: summary
                .map(|summary| summary.dr.dr_flag_commands_count)
                .unwrap_or_default(),
            dr_manual_flag_commands_count: summary
                .map(|summary| summary.dr.dr_manual_flag_commands_count)
                .unwrap_or_default(),
            asa_qa_present: summary.is_some_and(AnalysisSummary::has_qa_evidence),
            local_dir: Some(layout.root().to_string()),
            manifest_path: manifest.map(|_| layout.manifest_path().to_string()),
            summary_path: summary.map(|_| layout.summary_path().to_string()),
            discovered: true,
            downloaded: manifest.is_some_and(|manifest| {
                manifest
                    .artifacts
                    .iter()
                    .any(|record| record.status == ArtifactStatus::Complete)
            }),
            unpacked: manifest.is_some_and(|manifest| {
                !manifest.unpacked.is_empty() || manifest.artifacts.iter().any(|a| a.unpacked)
            }),
            summarized: summary.is_some(),
            last_error_stage,
            last_error_message,
            shard_id: shard_id.map(str::to_string),
            provenance_at,
            eb_uids,
            artifacts,
        })
    }

    /// Loads the documents of one unit directory and projects them.
    pub fn from_unit_dir(
        layout: &UnitLayout,
        shard_id: Option<&str>,
    ) -> Result<Option<Self>, AlmaError> {
        let manifest: Option<OperationalManifest> =
            read_json_document(layout.manifest_path().as_std_path())?;
        let summary: Option<AnalysisSummary> =
            read_json_document(layout.summary_path().as_std_path())?;
        if manifest.is_none() && summary.is_none() {
            return Ok(None);
        }
        Self::from_documents(layout, manifest.as_ref(), summary.as_ref(), shard_id).map(Some)
    }
}

fn last_error(manifest: &OperationalManifest) -> Option<(String, String)> {
    if let Some(failed) = manifest
        .artifacts
        .iter()
        .find(|record| record.status == ArtifactStatus::Failed)
    {
        let message = failed
            .error
            .clone()
            .unwrap_or_else(|| "artifact download failed".to_string());
        return Some(("download".to_string(), message));
    }
    manifest
        .artifacts
        .iter()
        .find_map(|record| record.unpack_error.clone())
        .map(|message| ("unpack".to_string(), message))
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    pub root: String,
    pub units_found: usize,
    pub indexed: usize,
    pub without_documents: usize,
    pub layout_fixed: usize,
    pub errors: Vec<String>,
}

/// Per-run (or central) table of unit records keyed by member uid.
pub struct IndexStore {
    conn: Connection,
    path: PathBuf,
}

impl IndexStore {
    pub fn open(path: &Path) -> Result<Self, AlmaError> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| AlmaError::Filesystem(err.to_string()))?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(
            r#"
BEGIN;
CREATE TABLE IF NOT EXISTS meta (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS mous (
  mous_uid TEXT PRIMARY KEY,
  project_code TEXT,
  science_goal_uid TEXT,
  group_ous_uid TEXT,
  release_date TEXT,
  obs_date TEXT,
  band_json TEXT NOT NULL,
  qa2_status TEXT NOT NULL,
  qa0_status TEXT,
  qa2_reasons_json TEXT NOT NULL,
  qa0_reasons_json TEXT NOT NULL,
  dr_intervention_suspected INTEGER NOT NULL DEFAULT 0,
  dr_flag_commands_count INTEGER NOT NULL DEFAULT 0,
  dr_manual_flag_commands_count INTEGER NOT NULL DEFAULT 0,
  asa_qa_present INTEGER NOT NULL DEFAULT 0,
  local_dir TEXT,
  manifest_path TEXT,
  summary_path TEXT,
  discovered INTEGER NOT NULL DEFAULT 0,
  downloaded INTEGER NOT NULL DEFAULT 0,
  unpacked INTEGER NOT NULL DEFAULT 0,
  summarized INTEGER NOT NULL DEFAULT 0,
  indexed INTEGER NOT NULL DEFAULT 1,
  last_error_stage TEXT,
  last_error_message TEXT,
  shard_id TEXT,
  provenance_at TEXT
);

CREATE TABLE IF NOT EXISTS eb (
  mous_uid TEXT NOT NULL,
  eb_uid TEXT NOT NULL,
  PRIMARY KEY (mous_uid, eb_uid),
  FOREIGN KEY (mous_uid) REFERENCES mous(mous_uid) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS artifact (
  mous_uid TEXT NOT NULL,
  filename TEXT NOT NULL,
  kind TEXT NOT NULL,
  status TEXT NOT NULL,
  local_path TEXT,
  source_url TEXT,
  size_bytes INTEGER,
  checksum TEXT,
  updated_at TEXT,
  PRIMARY KEY (mous_uid, filename),
  FOREIGN KEY (mous_uid) REFERENCES mous(mous_uid) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS artifact_status_idx ON artifact(status);
COMMIT;
"#,
        )?;
        conn.execute(
            "INSERT INTO meta (key, value) VALUES ('schema_version', ?1)
             ON CONFLICT(key) DO NOTHING",
            params![INDEX_SCHEMA_VERSION],
        )?;
        let schema: Option<String> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        if schema.as_deref() != Some(INDEX_SCHEMA_VERSION) {
            return Err(AlmaError::Index(format!(
                "{} has unsupported schema {:?}",
                path.display(),
                schema
            )));
        }
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    /// Opens an existing table without creating or altering anything.
    pub fn open_read_only(path: &Path) -> Result<Self, AlmaError> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        let schema: Option<String> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        if schema.as_deref() != Some(INDEX_SCHEMA_VERSION) {
            return Err(AlmaError::Index(format!(
                "{} is not an index table (schema {:?})",
                path.display(),
                schema
            )));
        }
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replaces the unit's row and its child rows with `record`.
    pub fn upsert(&mut self, record: &IndexRecord) -> Result<(), AlmaError> {
        let tx = self.conn.transaction()?;
        upsert_in(&tx, record)?;
        tx.commit()?;
        debug!(mous_uid = %record.mous_uid, "index row upserted");
        Ok(())
    }

    /// Upserts many records in one transaction.
    pub fn upsert_all(&mut self, records: &[IndexRecord]) -> Result<(), AlmaError> {
        let tx = self.conn.transaction()?;
        for record in records {
            upsert_in(&tx, record)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get(&self, mous_uid: &Uid) -> Result<Option<IndexRecord>, AlmaError> {
        let mut stmt = self.conn.prepare(&format!("{MOUS_SELECT} WHERE mous_uid = ?1"))?;
        let mut rows = stmt.query(params![mous_uid.as_str()])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        let mut record = record_from_row(row)?;
        self.load_children(&mut record)?;
        Ok(Some(record))
    }

    /// Every record, ordered by member uid.
    pub fn records(&self) -> Result<Vec<IndexRecord>, AlmaError> {
        let mut stmt = self.conn.prepare(&format!("{MOUS_SELECT} ORDER BY mous_uid"))?;
        let mut rows = stmt.query([])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(record_from_row(row)?);
        }
        for record in &mut records {
            self.load_children(record)?;
        }
        Ok(records)
    }

    pub fn count(&self) -> Result<usize, AlmaError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM mous", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }

    fn load_children(&self, record: &mut IndexRecord) -> Result<(), AlmaError> {
        let mut stmt = self
            .conn
            .prepare("SELECT eb_uid FROM eb WHERE mous_uid = ?1 ORDER BY eb_uid")?;
        record.eb_uids = stmt
            .query_map(params![record.mous_uid.as_str()], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;

        let mut stmt = self.conn.prepare(
            "SELECT filename, kind, status, local_path, source_url, size_bytes, checksum, updated_at
             FROM artifact WHERE mous_uid = ?1 ORDER BY filename",
        )?;
        record.artifacts = stmt
            .query_map(params![record.mous_uid.as_str()], |row| {
                Ok(IndexedArtifact {
                    filename: row.get(0)?,
                    kind: row.get(1)?,
                    status: row.get(2)?,
                    local_path: row.get(3)?,
                    source_url: row.get(4)?,
                    size_bytes: row
                        .get::<_, Option<i64>>(5)?
                        .and_then(|size| u64::try_from(size).ok()),
                    checksum: row.get(6)?,
                    updated_at: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(())
    }

    /// Rebuilds rows from the manifests and summaries found under `root`.
    /// Source documents are only read. With `fix_layout`, missing `delivered/`
    /// and `run1/` directories are created.
    pub fn scan_and_populate(
        &mut self,
        root: &Utf8Path,
        shard_id: Option<&str>,
        fix_layout: bool,
    ) -> Result<ScanReport, AlmaError> {
        let mut report = ScanReport {
            root: root.to_string(),
            ..ScanReport::default()
        };
        let unit_dirs = find_unit_dirs(root)?;
        report.units_found = unit_dirs.len();

        for dir in unit_dirs {
            let layout = UnitLayout::new(dir);
            if fix_layout && !layout.missing_subdirs().is_empty() {
                layout.ensure()?;
                report.layout_fixed += 1;
            }
            match IndexRecord::from_unit_dir(&layout, shard_id) {
                Ok(Some(record)) => {
                    self.upsert(&record)?;
                    report.indexed += 1;
                }
                Ok(None) => report.without_documents += 1,
                Err(err @ (AlmaError::DocumentCorruption { .. } | AlmaError::Index(_))) => {
                    warn!(dir = %layout.root(), error = %err, "skipping unit");
                    report.errors.push(format!("{}: {err}", layout.root()));
                }
                Err(err) => return Err(err),
            }
        }
        info!(
            root = %root,
            found = report.units_found,
            indexed = report.indexed,
            "scan finished"
        );
        Ok(report)
    }

    pub fn vacuum(&self) -> Result<(), AlmaError> {
        self.conn.execute_batch("VACUUM")?;
        Ok(())
    }

    pub fn integrity_check(&self) -> Result<String, AlmaError> {
        let result: String = self
            .conn
            .query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        Ok(result)
    }
}

const MOUS_SELECT: &str = "SELECT mous_uid, project_code, science_goal_uid, group_ous_uid, \
     release_date, obs_date, band_json, qa2_status, qa0_status, qa2_reasons_json, \
     qa0_reasons_json, dr_intervention_suspected, dr_flag_commands_count, \
     dr_manual_flag_commands_count, asa_qa_present, local_dir, manifest_path, summary_path, \
     discovered, downloaded, unpacked, summarized, last_error_stage, last_error_message, \
     shard_id, provenance_at FROM mous";

fn upsert_in(conn: &Connection, record: &IndexRecord) -> Result<(), AlmaError> {
    let mous_uid = record.mous_uid.as_str();
    conn.execute(
        r#"
INSERT INTO mous (
  mous_uid, project_code, science_goal_uid, group_ous_uid, release_date, obs_date,
  band_json, qa2_status, qa0_status, qa2_reasons_json, qa0_reasons_json,
  dr_intervention_suspected, dr_flag_commands_count, dr_manual_flag_commands_count,
  asa_qa_present, local_dir, manifest_path, summary_path,
  discovered, downloaded, unpacked, summarized, indexed,
  last_error_stage, last_error_message, shard_id, provenance_at
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18,
          ?19, ?20, ?21, ?22, 1, ?23, ?24, ?25, ?26)
ON CONFLICT(mous_uid) DO UPDATE SET
  project_code=excluded.project_code,
  science_goal_uid=excluded.science_goal_uid,
  group_ous_uid=excluded.group_ous_uid,
  release_date=excluded.release_date,
  obs_date=excluded.obs_date,
  band_json=excluded.band_json,
  qa2_status=excluded.qa2_status,
  qa0_status=excluded.qa0_status,
  qa2_reasons_json=excluded.qa2_reasons_json,
  qa0_reasons_json=excluded.qa0_reasons_json,
  dr_intervention_suspected=excluded.dr_intervention_suspected,
  dr_flag_commands_count=excluded.dr_flag_commands_count,
  dr_manual_flag_commands_count=excluded.dr_manual_flag_commands_count,
  asa_qa_present=excluded.asa_qa_present,
  local_dir=excluded.local_dir,
  manifest_path=excluded.manifest_path,
  summary_path=excluded.summary_path,
  discovered=excluded.discovered,
  downloaded=excluded.downloaded,
  unpacked=excluded.unpacked,
  summarized=excluded.summarized,
  indexed=excluded.indexed,
  last_error_stage=excluded.last_error_stage,
  last_error_message=excluded.last_error_message,
  shard_id=excluded.shard_id,
  provenance_at=excluded.provenance_at
"#,
        params![
            mous_uid,
            record.project_code,
            record.science_goal_uid,
            record.group_ous_uid,
            record.release_date,
            record.obs_date,
            to_json(&record.bands)?,
            record.qa2_status,
            record.qa0_status,
            to_json(&record.qa2_reasons)?,
            to_json(&record.qa0_reasons)?,
            record.dr_intervention_suspected,
            to_i64(record.dr_flag_commands_count),
            to_i64(record.dr_manual_flag_commands_count),
            record.asa_qa_present,
            record.local_dir,
            record.manifest_path,
            record.summary_path,
            record.discovered,
            record.downloaded,
            record.unpacked,
            record.summarized,
            record.last_error_stage,
            record.last_error_message,
            record.shard_id,
            record.provenance_at,
        ],
    )?;

    conn.execute("DELETE FROM eb WHERE mous_uid = ?1", params![mous_uid])?;
    for eb_uid in &record.eb_uids {
        conn.execute(
            "INSERT OR REPLACE INTO eb (mous_uid, eb_uid) VALUES (?1, ?2)",
            params![mous_uid, eb_uid],
        )?;
    }

    conn.execute("DELETE FROM artifact WHERE mous_uid = ?1", params![mous_uid])?;
    for artifact in &record.artifacts {
        conn.execute(
            r#"
INSERT OR REPLACE INTO artifact (
  mous_uid, filename, kind, status, local_path, source_url, size_bytes, checksum, updated_at
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
"#,
            params![
                mous_uid,
                artifact.filename,
                artifact.kind,
                artifact.status,
                artifact.local_path,
                artifact.source_url,
                artifact.size_bytes.map(to_i64),
                artifact.checksum,
                artifact.updated_at,
            ],
        )?;
    }
    Ok(())
}

fn record_from_row(row: &rusqlite::Row<'_>) -> Result<IndexRecord, AlmaError> {
    let raw_uid: String = row.get(0)?;
    Ok(IndexRecord {
        mous_uid: raw_uid.parse()?,
        project_code: row.get(1)?,
        science_goal_uid: row.get(2)?,
        group_ous_uid: row.get(3)?,
        release_date: row.get(4)?,
        obs_date: row.get(5)?,
        bands: from_json(&row.get::<_, String>(6)?)?,
        qa2_status: row.get(7)?,
        qa0_status: row.get(8)?,
        qa2_reasons: from_json(&row.get::<_, String>(9)?)?,
        qa0_reasons: from_json(&row.get::<_, String>(10)?)?,
        dr_intervention_suspected: row.get(11)?,
        dr_flag_commands_count: from_i64(row.get(12)?),
        dr_manual_flag_commands_count: from_i64(row.get(13)?),
        asa_qa_present: row.get(14)?,
        local_dir: row.get(15)?,
        manifest_path: row.get(16)?,
        summary_path: row.get(17)?,
        discovered: row.get(18)?,
        downloaded: row.get(19)?,
        unpacked: row.get(20)?,
        summarized: row.get(21)?,
        last_error_stage: row.get(22)?,
        last_error_message: row.get(23)?,
        shard_id: row.get(24)?,
        provenance_at: row.get(25)?,
        eb_uids: Vec::new(),
        artifacts: Vec::new(),
    })
}

fn to_json(values: &[String]) -> Result<String, AlmaError> {
    serde_json::to_string(values).map_err(|err| AlmaError::Index(err.to_string()))
}

fn from_json(raw: &str) -> Result<Vec<String>, AlmaError> {
    serde_json::from_str(raw).map_err(|err| AlmaError::Index(format!("bad json column: {err}")))
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_i64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}
