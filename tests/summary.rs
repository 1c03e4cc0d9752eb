mod common;

use std::fs;

use alma_bulk_manager::domain::QaStatus;
use alma_bulk_manager::layout::UnitLayout;
use alma_bulk_manager::manifest::ManifestStore;
use alma_bulk_manager::summary::{AnalysisSummary, Qa0Source, SummaryBuilder};

const PPREQUEST: &str = r#"<?xml version="1.0"?>
<prp:ProcessingRequest xmlns:prp="Alma/PipelineProcessingRequest">
  <prp:ProcessingProcedure>
    <prp:Intents><prp:Keyword>SESSION_1</prp:Keyword><prp:Value>uid://A002/Xf00/X11</prp:Value></prp:Intents>
  </prp:ProcessingProcedure>
</prp:ProcessingRequest>"#;

const AQUAREPORT: &str = r#"<?xml version="1.0"?>
<QaSummary>
  <QaPerTopic Topic="Calibration" Score="0.5" Reason="phase rms high"/>
</QaSummary>"#;

fn write(layout: &UnitLayout, relative: &str, content: &str) {
    let path = layout.root().join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

fn prepared_unit(dir: &std::path::Path, manifests: &ManifestStore) -> UnitLayout {
    let layout =
        UnitLayout::new(camino::Utf8PathBuf::from_path_buf(dir.join("member.unit")).unwrap());
    layout.ensure().unwrap();
    manifests.initialize(&layout, &common::candidate(16)).unwrap();
    write(
        &layout,
        "delivered/calibration/uid___A002_Xf00_X10.hifa_flagtemplate.txt",
        "# antenna DA41 bad\nmode='manual' antenna='DA41'\nmode='clip'\n",
    );
    write(&layout, "delivered/script/member.pprequest.xml", PPREQUEST);
    write(&layout, "delivered/qa/pipeline_aquareport.xml", AQUAREPORT);
    write(&layout, "delivered/qa/weblog/html/index.html", "<html></html>");
    write(&layout, "run1/uid___A002_Xf00_X12.ms/table.dat", "x");
    layout
}

#[test]
fn summary_combines_manifest_and_unpacked_content() {
    let temp = tempfile::tempdir().unwrap();
    let manifests = ManifestStore::new();
    let layout = prepared_unit(temp.path(), &manifests);

    let outcome = SummaryBuilder::new(true)
        .summarize_unit(&manifests, &layout)
        .unwrap();
    assert!(outcome.written);
    let summary = outcome.summary;

    assert_eq!(summary.qa.qa2_status, QaStatus::Pass);
    assert_eq!(summary.qa.qa2_reasons, vec!["phase rms high".to_string()]);
    assert!(summary.has_delivered_products);
    assert!(summary.has_run1_products);
    assert!(summary.has_qa_evidence());

    let ebs: Vec<(&str, QaStatus, Qa0Source)> = summary
        .qa
        .eb_in_asa
        .iter()
        .map(|eb| (eb.eb_uid.as_str(), eb.qa0_status, eb.qa0_status_source))
        .collect();
    assert_eq!(
        ebs,
        vec![
            ("uid://A002/Xf00/X10", QaStatus::Pass, Qa0Source::InferredFromDeliveredPresence),
            ("uid://A002/Xf00/X11", QaStatus::Pass, Qa0Source::InferredFromDeliveredPresence),
            ("uid://A002/Xf00/X12", QaStatus::SemiPass, Qa0Source::InferredFromRun1OnlyPresence),
        ]
    );

    assert_eq!(summary.dr.dr_flag_commands_count, 2);
    assert_eq!(summary.dr.dr_manual_flag_commands_count, 1);
    assert!(summary.dr.dr_intervention_suspected);

    let delivered = &summary.runs["delivered"];
    assert!(
        delivered
            .weblog_landing_page
            .as_deref()
            .is_some_and(|page| page.ends_with("html/index.html"))
    );
    assert_eq!(delivered.pprequest[0].eb_uids, vec!["uid://A002/Xf00/X11".to_string()]);

    let on_disk: AnalysisSummary =
        serde_json::from_str(&fs::read_to_string(layout.summary_path()).unwrap()).unwrap();
    assert!(on_disk.same_content(&summary));
    assert!(layout.summary_markdown_path().is_file());

    let manifest = manifests.load(&layout).unwrap().unwrap();
    assert!(
        manifest
            .history
            .iter()
            .any(|event| event.decision == "summary_written")
    );
}

#[test]
fn explicit_archive_values_override_inference() {
    let temp = tempfile::tempdir().unwrap();
    let manifests = ManifestStore::new();
    let layout = prepared_unit(temp.path(), &manifests);
    manifests
        .update(&layout, |manifest| {
            manifest
                .extra
                .insert("qa2_status".to_string(), serde_json::json!("SEMIPASS"));
            manifest.extra.insert(
                "qa0_by_eb".to_string(),
                serde_json::json!({ "uid://A002/Xf00/X12": "FAIL" }),
            );
            Ok(())
        })
        .unwrap();

    let summary = SummaryBuilder::new(false)
        .summarize_unit(&manifests, &layout)
        .unwrap()
        .summary;
    assert_eq!(summary.qa.qa2_status, QaStatus::SemiPass);
    let explicit = summary
        .qa
        .eb_in_asa
        .iter()
        .find(|eb| eb.eb_uid == "uid://A002/Xf00/X12")
        .unwrap();
    assert_eq!(explicit.qa0_status, QaStatus::Fail);
    assert_eq!(explicit.qa0_status_source, Qa0Source::ArchiveExplicit);
    assert!(!explicit.qa0_status_suggested);
    assert!(!layout.summary_markdown_path().exists());
}

#[test]
fn unchanged_unit_keeps_its_summary_file() {
    let temp = tempfile::tempdir().unwrap();
    let manifests = ManifestStore::new();
    let layout = prepared_unit(temp.path(), &manifests);
    let builder = SummaryBuilder::new(false);

    assert!(builder.summarize_unit(&manifests, &layout).unwrap().written);
    let before = fs::read_to_string(layout.summary_path()).unwrap();
    let history = manifests.load(&layout).unwrap().unwrap().history.len();

    assert!(!builder.summarize_unit(&manifests, &layout).unwrap().written);
    assert_eq!(fs::read_to_string(layout.summary_path()).unwrap(), before);
    assert_eq!(manifests.load(&layout).unwrap().unwrap().history.len(), history);

    write(&layout, "delivered/qa/extra.txt", "new evidence");
    assert!(builder.summarize_unit(&manifests, &layout).unwrap().written);
}
