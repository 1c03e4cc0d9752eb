mod common;

use std::fs;
use std::path::Path;

use alma_bulk_manager::domain::Uid;
use alma_bulk_manager::index::{IndexRecord, IndexStore};
use alma_bulk_manager::merge::{IndexMerger, MergeOptions};

fn record(mous: &Uid, qa2: &str, shard: &str, at: Option<&str>) -> IndexRecord {
    IndexRecord {
        mous_uid: mous.clone(),
        project_code: Some("2019.1.00001.S".to_string()),
        science_goal_uid: None,
        group_ous_uid: None,
        release_date: Some("2021-03-01".to_string()),
        obs_date: None,
        bands: vec!["6".to_string()],
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
        downloaded: true,
        unpacked: true,
        summarized: true,
        last_error_stage: None,
        last_error_message: None,
        shard_id: Some(shard.to_string()),
        provenance_at: at.map(str::to_string),
        eb_uids: Vec::new(),
        artifacts: Vec::new(),
    }
}

fn shard(dir: &Path, name: &str, records: &[IndexRecord]) -> IndexStore {
    let mut store = IndexStore::open(&dir.join(format!("{name}.sqlite"))).unwrap();
    store.upsert_all(records).unwrap();
    store
}

#[test]
fn merge_result_does_not_depend_on_shard_order() {
    let temp = tempfile::tempdir().unwrap();
    let mous = common::mous(16);
    let a = shard(
        temp.path(),
        "part-0001",
        &[record(&mous, "PASS", "part-0001", Some("2024-01-01T00:00:00Z"))],
    );
    let b = shard(
        temp.path(),
        "part-0002",
        &[record(&mous, "FAIL", "part-0002", Some("2024-02-01T00:00:00Z"))],
    );
    let merger = IndexMerger::new(MergeOptions::default());

    let mut forward = IndexStore::open(&temp.path().join("forward.db")).unwrap();
    merger.merge(&mut forward, &[&a, &b]).unwrap();
    let mut backward = IndexStore::open(&temp.path().join("backward.db")).unwrap();
    merger.merge(&mut backward, &[&b, &a]).unwrap();

    let forward = forward.records().unwrap();
    assert_eq!(forward, backward.records().unwrap());
    assert_eq!(forward[0].qa2_status, "FAIL");
}

#[test]
fn repeated_merge_is_a_noop() {
    let temp = tempfile::tempdir().unwrap();
    let a = shard(
        temp.path(),
        "part-0001",
        &[
            record(&common::mous(16), "PASS", "part-0001", Some("2024-01-01T00:00:00Z")),
            record(&common::mous(17), "SEMIPASS", "part-0001", Some("2024-01-01T00:00:00Z")),
        ],
    );
    let merger = IndexMerger::new(MergeOptions::default());
    let mut central = IndexStore::open(&temp.path().join("central.db")).unwrap();

    let first = merger.merge(&mut central, &[&a]).unwrap();
    assert_eq!(first.applied, 2);
    let snapshot = central.records().unwrap();

    let second = merger.merge(&mut central, &[&a]).unwrap();
    assert_eq!(second.applied, 0);
    assert_eq!(second.unchanged, 2);
    assert_eq!(central.records().unwrap(), snapshot);
}

#[test]
fn undated_disagreement_is_reported_and_not_applied() {
    let temp = tempfile::tempdir().unwrap();
    let mous = common::mous(16);
    let a = shard(temp.path(), "part-0001", &[record(&mous, "PASS", "part-0001", None)]);
    let b = shard(temp.path(), "part-0002", &[record(&mous, "FAIL", "part-0002", None)]);
    let mut central = IndexStore::open(&temp.path().join("central.db")).unwrap();

    let report = IndexMerger::new(MergeOptions::default())
        .merge(&mut central, &[&a, &b])
        .unwrap();
    assert_eq!(report.applied, 0);
    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.conflicts[0].mous_uid, mous.to_string());
    assert!(central.get(&mous).unwrap().is_none());
}

#[test]
fn unreadable_shard_tables_are_skipped() {
    let temp = tempfile::tempdir().unwrap();
    let shards = temp.path().join("shards");
    fs::create_dir_all(&shards).unwrap();
    let mous = common::mous(16);
    drop(shard(
        &shards,
        "part-0001",
        &[record(&mous, "PASS", "part-0001", Some("2024-01-01T00:00:00Z"))],
    ));
    fs::write(shards.join("part-0002.sqlite"), b"not a database").unwrap();

    let central_path = temp.path().join("alma_index.sqlite");
    let report = IndexMerger::new(MergeOptions {
        vacuum: true,
        integrity_check: true,
    })
    .merge_from_shards(&shards, &central_path)
    .unwrap();

    assert_eq!(report.shard_tables, 1);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.applied, 1);
    assert_eq!(report.integrity, "ok");
    let central = IndexStore::open(&central_path).unwrap();
    assert_eq!(central.get(&mous).unwrap().unwrap().qa2_status, "PASS");
}

#[test]
fn sequential_merges_converge_whatever_the_order() {
    let temp = tempfile::tempdir().unwrap();
    let mous = common::mous(16);
    let a = shard(
        temp.path(),
        "part-0001",
        &[record(&mous, "PASS", "part-0001", Some("2024-01-01T00:00:00Z"))],
    );
    let b = shard(
        temp.path(),
        "part-0002",
        &[record(&mous, "FAIL", "part-0002", Some("2024-02-01T00:00:00Z"))],
    );
    let merger = IndexMerger::new(MergeOptions::default());

    let mut a_then_b = IndexStore::open(&temp.path().join("a_then_b.db")).unwrap();
    merger.merge(&mut a_then_b, &[&a]).unwrap();
    merger.merge(&mut a_then_b, &[&b]).unwrap();

    let mut b_then_a = IndexStore::open(&temp.path().join("b_then_a.db")).unwrap();
    merger.merge(&mut b_then_a, &[&b]).unwrap();
    let late = merger.merge(&mut b_then_a, &[&a]).unwrap();
    assert_eq!(late.applied, 0);

    let a_then_b = a_then_b.records().unwrap();
    assert_eq!(a_then_b, b_then_a.records().unwrap());
    assert_eq!(a_then_b[0].qa2_status, "FAIL");
    assert_eq!(a_then_b[0].shard_id.as_deref(), Some("part-0002"));
}
