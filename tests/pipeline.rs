mod common;

use std::path::Path;

use alma_bulk_manager::app::{App, NoProgress, RunBudget, ScanOptions, SummarizeOptions};
use alma_bulk_manager::domain::{ArtifactKind, ArtifactStatus, QaStatus, UnitCandidate};
use alma_bulk_manager::index::{INDEX_FILENAME, IndexStore};
use alma_bulk_manager::layout::{PathResolver, UnitLayout};
use alma_bulk_manager::manifest::ManifestStore;
use alma_bulk_manager::merge::MergeOptions;
use alma_bulk_manager::query::write_candidates_jsonl;
use alma_bulk_manager::summary::AnalysisSummary;

use common::{MockArchive, Tgz, candidate, config, mous, unit_prefix, url_for};

const FLAG_TEMPLATE: &str = "calibration/uid___A002_Xf00_X10.hifa_flagtemplate.txt";

fn auxiliary_archive(n: u32) -> Vec<u8> {
    let prefix = unit_prefix(n);
    Tgz::new()
        .file(
            &format!("{prefix}/{FLAG_TEMPLATE}"),
            b"mode='manual' antenna='DA41' reason='RFI'\n",
        )
        .file(&format!("{prefix}/README"), b"readme\n")
        .finish()
}

fn archive_with_units(ns: &[u32]) -> MockArchive {
    let mut archive = MockArchive::default();
    for n in ns {
        archive.serve(
            &mous(*n),
            ArtifactKind::Auxiliary,
            &format!("member_{n}_auxiliary.tgz"),
            auxiliary_archive(*n),
        );
    }
    archive
}

fn write_input(dir: &Path, candidates: &[UnitCandidate]) -> std::path::PathBuf {
    let path = dir.join("discovered.jsonl");
    write_candidates_jsonl(&path, candidates).unwrap();
    path
}

fn layout_for(dest: &Path, n: u32) -> UnitLayout {
    PathResolver::new(camino::Utf8PathBuf::from_path_buf(dest.to_path_buf()).unwrap())
        .resolve(&candidate(n).identity)
}

#[test]
fn full_pipeline_populates_unit_and_index() {
    let dest = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let input = write_input(work.path(), &[candidate(16)]);
    let app = App::new(config(dest.path()), archive_with_units(&[16]));

    let download = app.download(Some(&input), &NoProgress).unwrap();
    assert_eq!(download.processed, 1);
    assert_eq!(download.failed, 0);
    assert_eq!(download.units[0].fetch.as_ref().unwrap().downloaded, 1);

    let unpack = app.unpack(&NoProgress).unwrap();
    assert_eq!(unpack.units[0].unpack.as_ref().unwrap().unpacked.len(), 1);

    let summarize = app.summarize(&SummarizeOptions::default(), &NoProgress).unwrap();
    assert_eq!(summarize.units[0].summary_written, Some(true));

    let layout = layout_for(dest.path(), 16);
    assert!(layout.delivered().join(FLAG_TEMPLATE).is_file());
    assert!(!layout.delivered().join("member_16_auxiliary.tgz").exists());

    let manifest = ManifestStore::new().load(&layout).unwrap().unwrap();
    let record = &manifest.artifacts[0];
    assert_eq!(record.status, ArtifactStatus::Complete);
    assert!(record.unpacked);
    assert!(record.archive_removed_after_unpack);

    let summary: AnalysisSummary =
        serde_json::from_str(&std::fs::read_to_string(layout.summary_path()).unwrap()).unwrap();
    assert_eq!(summary.qa.qa2_status, QaStatus::Pass);
    assert_eq!(summary.dr.dr_manual_flag_commands_count, 1);
    assert!(summary.has_delivered_products);

    let index = IndexStore::open(&dest.path().join(INDEX_FILENAME)).unwrap();
    let row = index.get(&mous(16)).unwrap().unwrap();
    assert!(row.downloaded && row.unpacked && row.summarized);
    assert_eq!(row.qa2_status, "PASS");

    let status = app.status(10).unwrap();
    assert_eq!(status.counts.summarized, 1);
    assert_eq!(status.todo.failed_downloads, 0);
}

#[test]
fn rerunning_every_stage_changes_nothing() {
    let dest = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let input = write_input(work.path(), &[candidate(16)]);
    let app = App::new(config(dest.path()), archive_with_units(&[16]));

    app.download(Some(&input), &NoProgress).unwrap();
    app.unpack(&NoProgress).unwrap();
    app.summarize(&SummarizeOptions::default(), &NoProgress).unwrap();

    let layout = layout_for(dest.path(), 16);
    let before = std::fs::read_to_string(layout.manifest_path()).unwrap();
    let summary_before = std::fs::read_to_string(layout.summary_path()).unwrap();

    app.download(Some(&input), &NoProgress).unwrap();
    let unpack = app.unpack(&NoProgress).unwrap();
    let summarize = app.summarize(&SummarizeOptions::default(), &NoProgress).unwrap();

    assert!(!unpack.units[0].unpack.as_ref().unwrap().did_work());
    assert_eq!(summarize.units[0].summary_written, Some(false));
    assert_eq!(std::fs::read_to_string(layout.manifest_path()).unwrap(), before);
    assert_eq!(std::fs::read_to_string(layout.summary_path()).unwrap(), summary_before);
}

#[test]
fn failed_artifact_does_not_block_the_rest_of_the_unit() {
    let dest = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let input = write_input(work.path(), &[candidate(16)]);
    let mut archive = archive_with_units(&[16]);
    archive.serve(&mous(16), ArtifactKind::Readme, "member_16.README", b"notes".to_vec());
    archive.failing.insert(url_for("member_16.README"));
    let app = App::new(config(dest.path()), archive);

    let result = app.download(Some(&input), &NoProgress).unwrap();
    let fetch = result.units[0].fetch.as_ref().unwrap();
    assert_eq!(fetch.downloaded, 1);
    assert_eq!(fetch.failed, 1);
    assert!(result.units[0].error.is_none());

    let layout = layout_for(dest.path(), 16);
    let manifest = ManifestStore::new().load(&layout).unwrap().unwrap();
    let readme = manifest
        .artifact(ArtifactKind::Readme, "member_16.README")
        .unwrap();
    assert_eq!(readme.status, ArtifactStatus::Failed);
    assert!(readme.error.is_some());
    assert!(
        manifest
            .history
            .iter()
            .any(|event| event.decision == "artifact_failed")
    );

    let index = IndexStore::open(&dest.path().join(INDEX_FILENAME)).unwrap();
    let row = index.get(&mous(16)).unwrap().unwrap();
    assert_eq!(row.last_error_stage.as_deref(), Some("download"));
}

#[test]
fn exhausted_budget_leaves_units_for_the_next_run() {
    let dest = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let input = write_input(work.path(), &[candidate(16), candidate(17)]);
    let budget = RunBudget::unlimited();
    budget.cancel();
    let app = App::new(config(dest.path()), archive_with_units(&[16, 17])).with_budget(budget);

    let result = app.download(Some(&input), &NoProgress).unwrap();
    assert_eq!(result.processed, 0);
    assert!(result.stopped_early);
    assert!(!layout_for(dest.path(), 16).manifest_path().exists());
}

#[test]
fn sharded_runs_merge_into_the_central_index() {
    let dest = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let shards_dir = work.path().join("shards");
    let input = write_input(
        work.path(),
        &[candidate(18), candidate(16), candidate(17)],
    );
    let app = App::new(config(dest.path()), archive_with_units(&[16, 17, 18]));

    let plan = app.plan(&input, &shards_dir, 2).unwrap();
    assert_eq!(plan.total_records, 3);
    assert_eq!(plan.shards.len(), 2);
    assert!(plan.shards[0].ends_with("part-0001.jsonl"));
    assert!(shards_dir.join("plan.json").is_file());

    for shard in &plan.shards {
        let result = app.run_shard(Path::new(shard), true, &NoProgress).unwrap();
        assert_eq!(result.failed, 0);
    }
    let first = IndexStore::open(&shards_dir.join("part-0001.sqlite")).unwrap();
    assert_eq!(first.count().unwrap(), 2);
    let row = first.get(&mous(16)).unwrap().unwrap();
    assert_eq!(row.shard_id.as_deref(), Some("part-0001"));
    assert!(row.summarized);
    drop(first);

    let merged = app
        .merge_index(&shards_dir, MergeOptions::default(), &NoProgress)
        .unwrap();
    assert_eq!(merged.shard_tables, 2);
    assert_eq!(merged.applied, 3);
    assert!(merged.conflicts.is_empty());

    let again = app
        .merge_index(&shards_dir, MergeOptions::default(), &NoProgress)
        .unwrap();
    assert_eq!(again.applied, 0);
    assert_eq!(again.unchanged, 3);

    let central = IndexStore::open(&dest.path().join(INDEX_FILENAME)).unwrap();
    assert_eq!(central.count().unwrap(), 3);
}

#[test]
fn scan_rebuilds_the_index_from_unit_documents() {
    let dest = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let input = write_input(work.path(), &[candidate(16), candidate(17)]);
    let app = App::new(config(dest.path()), archive_with_units(&[16, 17]));
    app.download(Some(&input), &NoProgress).unwrap();
    app.unpack(&NoProgress).unwrap();
    app.summarize(&SummarizeOptions::default(), &NoProgress).unwrap();

    let index_path = dest.path().join(INDEX_FILENAME);
    let before = IndexStore::open(&index_path).unwrap().records().unwrap();
    std::fs::remove_dir_all(layout_for(dest.path(), 17).run1()).unwrap();

    let options = ScanOptions {
        fix_layout: true,
        rebuild_db: true,
        index_db: None,
    };
    let report = app.scan(&options, &NoProgress).unwrap();
    assert_eq!(report.units_found, 2);
    assert_eq!(report.indexed, 2);
    assert_eq!(report.layout_fixed, 1);
    assert!(layout_for(dest.path(), 17).run1().is_dir());
    assert_eq!(IndexStore::open(&index_path).unwrap().records().unwrap(), before);
}

#[test]
fn status_without_index_is_an_error() {
    let dest = tempfile::tempdir().unwrap();
    let app = App::new(config(dest.path()), MockArchive::default());
    assert!(app.status(10).is_err());
}
