#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use flate2::Compression;
use flate2::write::GzEncoder;

use alma_bulk_manager::archive::{ArchiveClient, Deliverable, TapRow, TransferOutcome};
use alma_bulk_manager::config::{Config, ConfigLoader, ConfigOverrides, ResolvedConfig};
use alma_bulk_manager::domain::{ArtifactKind, Uid, UnitCandidate, UnitIdentity};
use alma_bulk_manager::error::AlmaError;

/// In-memory archive. Files are served by URL; `interrupt` makes the first
/// transfer of a URL stop after N bytes.
#[derive(Default)]
pub struct MockArchive {
    pub rows: Vec<TapRow>,
    pub listings: BTreeMap<Uid, Vec<Deliverable>>,
    pub files: BTreeMap<String, Vec<u8>>,
    pub failing: BTreeSet<String>,
    pub interrupt: Mutex<BTreeMap<String, usize>>,
    pub transfers: Mutex<Vec<(String, u64)>>,
}

impl MockArchive {
    pub fn serve(&mut self, mous_uid: &Uid, kind: ArtifactKind, filename: &str, content: Vec<u8>) {
        let url = url_for(filename);
        self.listings
            .entry(mous_uid.clone())
            .or_default()
            .push(Deliverable {
                kind,
                filename: filename.to_string(),
                url: url.clone(),
                size_bytes: Some(content.len() as u64),
                checksum: None,
                semantics: None,
                description: None,
                content_type: None,
            });
        self.files.insert(url, content);
    }

    pub fn transfer_count(&self, filename: &str) -> usize {
        let url = url_for(filename);
        self.transfers
            .lock()
            .unwrap()
            .iter()
            .filter(|(seen, _)| *seen == url)
            .count()
    }

    pub fn offsets(&self, filename: &str) -> Vec<u64> {
        let url = url_for(filename);
        self.transfers
            .lock()
            .unwrap()
            .iter()
            .filter(|(seen, _)| *seen == url)
            .map(|(_, offset)| *offset)
            .collect()
    }
}

impl ArchiveClient for MockArchive {
    fn query_tap(&self, _adql: &str) -> Result<Vec<TapRow>, AlmaError> {
        Ok(self.rows.clone())
    }

    fn list_deliverables(&self, mous_uid: &Uid) -> Result<Vec<Deliverable>, AlmaError> {
        Ok(self.listings.get(mous_uid).cloned().unwrap_or_default())
    }

    fn download(
        &self,
        url: &str,
        destination: &Path,
        offset: u64,
    ) -> Result<TransferOutcome, AlmaError> {
        self.transfers
            .lock()
            .unwrap()
            .push((url.to_string(), offset));
        if self.failing.contains(url) {
            return Err(AlmaError::transient(url, "connection reset"));
        }
        let content = self.files.get(url).ok_or(AlmaError::ArchiveStatus {
            status: 404,
            message: url.to_string(),
        })?;

        let start = offset as usize;
        let cut = self.interrupt.lock().unwrap().remove(url);
        let end = cut.unwrap_or(content.len()).min(content.len());
        let mut file = OpenOptions::new()
            .create(true)
            .append(offset > 0)
            .write(true)
            .truncate(offset == 0)
            .open(destination)
            .map_err(|err| AlmaError::Filesystem(err.to_string()))?;
        file.write_all(&content[start..end])
            .map_err(|err| AlmaError::Filesystem(err.to_string()))?;
        if cut.is_some() {
            return Err(AlmaError::transient(url, "stream interrupted"));
        }
        Ok(TransferOutcome {
            resumed: offset > 0,
            bytes_written: (end - start) as u64,
        })
    }
}

/// `project/science_goal/group/member` prefix of the unit's archives.
pub fn unit_prefix(n: u32) -> String {
    format!(
        "2019.1.00001.S/science_goal.uid___A001_X1a2_Xa0/group.uid___A001_X1a2_Xa1/member.{}",
        mous(n).path_segment()
    )
}

pub fn url_for(filename: &str) -> String {
    format!("https://archive.test/dataPortal/{filename}")
}

pub fn config(dest: &Path) -> ResolvedConfig {
    let mut config = Config::default();
    config.paths.dest = Some(dest.display().to_string());
    config.download.retry_backoff_ms = 0;
    config.download.max_workers = 2;
    config.download.unit_workers = 2;
    ConfigLoader::resolve_config(config, &ConfigOverrides::default()).unwrap()
}

pub fn mous(n: u32) -> Uid {
    format!("uid://A001/X1a2/X{n:x}").parse().unwrap()
}

pub fn candidate(n: u32) -> UnitCandidate {
    let mut identity = UnitIdentity::new("2019.1.00001.S", mous(n));
    identity.science_goal_uid = Some("uid://A001/X1a2/Xa0".parse().unwrap());
    identity.group_ous_uid = Some("uid://A001/X1a2/Xa1".parse().unwrap());
    let mut candidate = UnitCandidate::new(identity);
    candidate.band_list = vec!["6".to_string()];
    candidate.release_date = Some("2021-03-01".to_string());
    candidate.eb_uids = vec![format!("uid://A002/Xf00/X{n:x}")];
    candidate.qa2_passed = Some(true);
    candidate
}

/// Gzipped tar built entry by entry.
pub struct Tgz {
    builder: tar::Builder<GzEncoder<Vec<u8>>>,
}

impl Tgz {
    pub fn new() -> Self {
        Self {
            builder: tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default())),
        }
    }

    pub fn file(mut self, name: &str, content: &[u8]) -> Self {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        self.builder.append_data(&mut header, name, content).unwrap();
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.builder.into_inner().unwrap().finish().unwrap()
    }
}
