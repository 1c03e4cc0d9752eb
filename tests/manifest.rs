mod common;

use std::fs;

use assert_matches::assert_matches;
use serde_json::{Value, json};

use alma_bulk_manager::domain::{UnitCandidate, UnitIdentity};
use alma_bulk_manager::error::AlmaError;
use alma_bulk_manager::layout::UnitLayout;
use alma_bulk_manager::manifest::{HistoryEvent, ManifestStore};

use common::{candidate, mous};

fn unit(dir: &std::path::Path) -> UnitLayout {
    UnitLayout::new(camino::Utf8PathBuf::from_path_buf(dir.join("member.unit")).unwrap())
}

#[test]
fn unknown_fields_survive_updates() {
    let dir = tempfile::tempdir().unwrap();
    let layout = unit(dir.path());
    let manifests = ManifestStore::new();
    manifests.initialize(&layout, &candidate(16)).unwrap();

    let path = layout.manifest_path();
    let mut raw: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    raw["operator_note"] = json!({ "ticket": 42 });
    fs::write(&path, serde_json::to_string(&raw).unwrap()).unwrap();

    manifests
        .append_history(&layout, HistoryEvent::new("download", "fetched", json!({})))
        .unwrap();

    let raw: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(raw["operator_note"]["ticket"], 42);
    assert_eq!(raw["history"].as_array().unwrap().len(), 2);
}

#[test]
fn history_cannot_be_rewritten() {
    let dir = tempfile::tempdir().unwrap();
    let layout = unit(dir.path());
    let manifests = ManifestStore::new();
    manifests.initialize(&layout, &candidate(16)).unwrap();

    let err = manifests
        .update(&layout, |manifest| {
            manifest.history.clear();
            Ok(())
        })
        .unwrap_err();
    assert_matches!(err, AlmaError::PolicyViolation { .. });
    let manifest = manifests.load(&layout).unwrap().unwrap();
    assert_eq!(manifest.history.len(), 1);
}

#[test]
fn identity_fields_are_immutable_once_set() {
    let dir = tempfile::tempdir().unwrap();
    let layout = unit(dir.path());
    let manifests = ManifestStore::new();
    manifests.initialize(&layout, &candidate(16)).unwrap();

    let err = manifests
        .update(&layout, |manifest| {
            manifest.project_code = "2020.1.99999.S".to_string();
            Ok(())
        })
        .unwrap_err();
    assert_matches!(err, AlmaError::PolicyViolation { .. });

    let other = UnitCandidate::new(UnitIdentity::new("2019.1.00001.S", mous(17)));
    assert_matches!(
        manifests.initialize(&layout, &other),
        Err(AlmaError::PolicyViolation { .. })
    );
}

#[test]
fn unchanged_update_does_not_touch_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let layout = unit(dir.path());
    let manifests = ManifestStore::new();
    manifests.initialize(&layout, &candidate(16)).unwrap();
    let before = fs::read_to_string(layout.manifest_path()).unwrap();

    manifests.initialize(&layout, &candidate(16)).unwrap();
    manifests.update(&layout, |_| Ok(())).unwrap();

    assert_eq!(fs::read_to_string(layout.manifest_path()).unwrap(), before);
}

#[test]
fn corrupt_manifest_is_reported_not_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let layout = unit(dir.path());
    layout.ensure().unwrap();
    fs::write(layout.manifest_path(), "{ not json").unwrap();

    let manifests = ManifestStore::new();
    assert_matches!(
        manifests.initialize(&layout, &candidate(16)),
        Err(AlmaError::DocumentCorruption { .. })
    );
    assert_eq!(fs::read_to_string(layout.manifest_path()).unwrap(), "{ not json");
}

#[test]
fn older_history_entries_load_and_survive_appends() {
    let dir = tempfile::tempdir().unwrap();
    let layout = unit(dir.path());
    layout.ensure().unwrap();
    let older = json!({
        "timestamp": "2024-01-01T00:00:00Z",
        "event": "download",
        "message": "No missing artifacts",
        "selected_kinds": ["auxiliary"],
    });
    let document = json!({
        "project_code": "2019.1.00001.S",
        "mous_uid": mous(16).as_str(),
        "history": [older.clone()],
    });
    fs::write(layout.manifest_path(), serde_json::to_string_pretty(&document).unwrap()).unwrap();

    let manifests = ManifestStore::new();
    let loaded = manifests.load(&layout).unwrap().unwrap();
    assert_eq!(loaded.history.len(), 1);
    assert_eq!(loaded.history[0].extra["event"], "download");

    manifests
        .append_history(&layout, HistoryEvent::new("unpack", "unpacked", json!({})))
        .unwrap();

    let raw: Value =
        serde_json::from_str(&fs::read_to_string(layout.manifest_path()).unwrap()).unwrap();
    let history = raw["history"].as_array().unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0], older);
    assert_eq!(history[1]["decision"], "unpacked");
}
