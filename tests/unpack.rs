mod common;

use std::fs;
use std::time::{Duration, SystemTime};

use alma_bulk_manager::config::UnpackPolicy;
use alma_bulk_manager::domain::{ArtifactKind, ArtifactStatus};
use alma_bulk_manager::layout::UnitLayout;
use alma_bulk_manager::manifest::{ArtifactRecord, ManifestStore};
use alma_bulk_manager::unpack::UnpackController;

use common::{Tgz, candidate, config, unit_prefix, url_for};

fn unit(dir: &std::path::Path, manifests: &ManifestStore) -> UnitLayout {
    let layout =
        UnitLayout::new(camino::Utf8PathBuf::from_path_buf(dir.join("member.unit")).unwrap());
    layout.ensure().unwrap();
    manifests.initialize(&layout, &candidate(16)).unwrap();
    layout
}

/// Writes `content` into `delivered/` and records it as a complete download.
fn delivered_archive(
    layout: &UnitLayout,
    manifests: &ManifestStore,
    kind: ArtifactKind,
    filename: &str,
    content: &[u8],
    modified: Option<SystemTime>,
) {
    let path = layout.delivered().join(filename);
    fs::write(&path, content).unwrap();
    if let Some(modified) = modified {
        fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(modified)
            .unwrap();
    }
    manifests
        .update(layout, |manifest| {
            let mut record = ArtifactRecord::new(kind, filename, &url_for(filename));
            record.status = ArtifactStatus::Complete;
            record.local_path = Some(path.to_string());
            record.size_bytes = Some(content.len() as u64);
            manifest.upsert_artifact(record);
            Ok(())
        })
        .unwrap();
}

fn policy(dir: &std::path::Path) -> UnpackPolicy {
    config(dir).unpack
}

#[test]
fn newest_archive_per_kind_wins_and_rerun_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let manifests = ManifestStore::new();
    let layout = unit(dir.path(), &manifests);
    let prefix = unit_prefix(16);
    let old = Tgz::new()
        .file(&format!("{prefix}/qa/weblog/html/index.html"), b"old")
        .finish();
    let new = Tgz::new()
        .file(&format!("{prefix}/qa/weblog/html/index.html"), b"new")
        .finish();
    let long_ago = SystemTime::UNIX_EPOCH + Duration::from_secs(1_600_000_000);
    delivered_archive(
        &layout,
        &manifests,
        ArtifactKind::Weblog,
        "weblog_a.tgz",
        &old,
        Some(long_ago),
    );
    delivered_archive(&layout, &manifests, ArtifactKind::Weblog, "weblog_b.tgz", &new, None);

    let policy = policy(dir.path());
    let controller = UnpackController::new(&manifests, &policy);
    let report = controller.unpack_unit(&layout).unwrap();

    assert_eq!(report.unpacked, vec!["weblog_b.tgz".to_string()]);
    assert_eq!(report.rejected.len(), 1);
    assert_eq!(report.rejected[0].filename, "weblog_a.tgz");
    assert_eq!(
        fs::read_to_string(layout.delivered().join("qa/weblog/html/index.html")).unwrap(),
        "new"
    );

    let manifest = manifests.load(&layout).unwrap().unwrap();
    let event = manifest
        .history
        .iter()
        .find(|event| event.decision == "unpacked")
        .unwrap();
    assert_eq!(event.detail["rejected"][0]["filename"], "weblog_a.tgz");
    let record = manifest.artifact(ArtifactKind::Weblog, "weblog_b.tgz").unwrap();
    assert!(record.unpacked);
    assert_eq!(record.strip_prefix.as_deref(), Some(prefix.as_str()));

    let history_len = manifest.history.len();
    let again = controller.unpack_unit(&layout).unwrap();
    assert!(!again.did_work());
    assert_eq!(manifests.load(&layout).unwrap().unwrap().history.len(), history_len);
    assert_eq!(
        fs::read_to_string(layout.delivered().join("qa/weblog/html/index.html")).unwrap(),
        "new"
    );
}

#[test]
fn nested_flag_backups_are_never_expanded() {
    let dir = tempfile::tempdir().unwrap();
    let manifests = ManifestStore::new();
    let layout = unit(dir.path(), &manifests);
    let caltables = Tgz::new()
        .file("calibration/cal.tbl/table.dat", b"table")
        .finish();
    let flags = Tgz::new().file("calibration/flags/FLAG_0", b"flags").finish();
    let outer = Tgz::new()
        .file("calibration/uid___A002_Xf00_X10.caltables.tgz", &caltables)
        .file("calibration/uid___A002_Xf00_X10.ms.flagversions.tgz", &flags)
        .finish();
    delivered_archive(&layout, &manifests, ArtifactKind::Auxiliary, "aux.tgz", &outer, None);

    let mut policy = policy(dir.path());
    policy.recursive_patterns = vec!["*.tgz".to_string()];
    policy.recursive_exclude_patterns = Vec::new();
    let report = UnpackController::new(&manifests, &policy)
        .unpack_unit(&layout)
        .unwrap();

    assert_eq!(report.recursive.unpacked_count, 1);
    assert_eq!(report.recursive.excluded.len(), 1);
    assert!(report.recursive.excluded[0].ends_with("flagversions.tgz"));
    let calibration = layout.delivered().join("calibration");
    assert!(calibration.join("cal.tbl/table.dat").is_file());
    assert!(!calibration.join("uid___A002_Xf00_X10.caltables.tgz").exists());
    assert!(calibration.join("uid___A002_Xf00_X10.ms.flagversions.tgz").is_file());
    assert!(!calibration.join("flags").exists());
}

#[test]
fn foreign_member_prefix_is_kept() {
    let dir = tempfile::tempdir().unwrap();
    let manifests = ManifestStore::new();
    let layout = unit(dir.path(), &manifests);
    let foreign = unit_prefix(99);
    let archive = Tgz::new()
        .file(&format!("{foreign}/README"), b"other unit")
        .finish();
    delivered_archive(&layout, &manifests, ArtifactKind::Readme, "readme.tgz", &archive, None);

    let policy = policy(dir.path());
    let report = UnpackController::new(&manifests, &policy)
        .unpack_unit(&layout)
        .unwrap();
    assert_eq!(report.unpacked.len(), 1);
    assert!(layout.delivered().join(&foreign).join("README").is_file());
}

#[test]
fn broken_archive_is_recorded_and_kept() {
    let dir = tempfile::tempdir().unwrap();
    let manifests = ManifestStore::new();
    let layout = unit(dir.path(), &manifests);
    delivered_archive(&layout, &manifests, ArtifactKind::Auxiliary, "aux.tgz", b"not gzip", None);

    let policy = policy(dir.path());
    let report = UnpackController::new(&manifests, &policy)
        .unpack_unit(&layout)
        .unwrap();
    assert_eq!(report.errors.len(), 1);
    assert!(layout.delivered().join("aux.tgz").is_file());
    let manifest = manifests.load(&layout).unwrap().unwrap();
    let record = manifest.artifact(ArtifactKind::Auxiliary, "aux.tgz").unwrap();
    assert!(record.unpack_error.is_some());
    assert!(!record.unpacked);
}
