use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::archive::compile;
use crate::domain::{ArtifactKind, ArtifactStatus, QaStatus, Uid};
use crate::error::AlmaError;
use crate::layout::{DELIVERED_DIR, RUN1_DIR, UnitLayout};
use crate::manifest::{HistoryEvent, ManifestStore, OperationalManifest};
use crate::store::{now_utc, read_json_document, walk_files, write_bytes_atomic, write_json_atomic};

pub const SUMMARY_SCHEMA_VERSION: u32 = 2;

const TOP_REASONS: usize = 20;
const COMMENT_KEYWORDS: [&str; 5] = ["reason", "flag", "rfi", "bad", "manual"];

/// Analysis-oriented view of one unit, derived from its manifest and the
/// unpacked content. Never edited by hand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSummary {
    pub schema_version: u32,
    pub mous: MousBlock,
    #[serde(default)]
    pub qa: QaBlock,
    #[serde(default)]
    pub has_delivered_products: bool,
    #[serde(default)]
    pub has_run1_products: bool,
    #[serde(default)]
    pub runs: BTreeMap<String, RunSummary>,
    #[serde(default)]
    pub dr: DrBlock,
    #[serde(default)]
    pub artifacts_present: Vec<ArtifactPresence>,
    #[serde(default)]
    pub provenance: Provenance,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MousBlock {
    #[serde(default)]
    pub project_code: String,
    #[serde(default)]
    pub public_release_date: Option<String>,
    pub mous_uid: Uid,
    #[serde(default)]
    pub group_ous_uid: Option<Uid>,
    #[serde(default)]
    pub science_goal_uid: Option<Uid>,
    #[serde(default)]
    pub eb_uid_list: Vec<String>,
    #[serde(default)]
    pub band: Vec<String>,
    #[serde(default)]
    pub obs_date: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QaBlock {
    pub qa2_status: QaStatus,
    pub qa2_reasons: Vec<String>,
    pub eb_in_asa: Vec<EbQa0>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EbQa0 {
    pub eb_uid: String,
    pub qa0_status: QaStatus,
    pub qa0_status_suggested: bool,
    pub qa0_status_source: Qa0Source,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Qa0Source {
    ArchiveExplicit,
    InferredFromDeliveredPresence,
    InferredFromRun1OnlyPresence,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSummary {
    pub path: String,
    pub has_contents: bool,
    pub file_count: usize,
    pub pprequest_files: Vec<String>,
    pub pprequest: Vec<PprequestEntry>,
    pub pipeline_aquareport_files: Vec<String>,
    pub applycalqa_outliers_files: Vec<String>,
    pub weblog_landing_page: Option<String>,
    pub weblog_landing_candidates: Vec<String>,
    pub flag_templates: Vec<FlagTemplateSummary>,
    pub dr_action_evidence: bool,
    pub dr_flag_commands_count: u64,
    pub dr_manual_flag_commands_count: u64,
    pub dr_flag_reason_summary: Vec<ReasonCount>,
    pub qa_report_files: Vec<String>,
    pub qa_files: Vec<String>,
    pub aqua_reports: Vec<AquaReportEntry>,
    pub eb_uids_detected: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PprequestEntry {
    pub path: String,
    pub eb_uids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AquaReportEntry {
    pub path: String,
    pub qa_reasons: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parsed: Option<AquaReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AquaReport {
    pub qa_per_topic: Vec<QaTopic>,
    pub qa_per_stage: Vec<QaStage>,
    pub qa_reasons: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QaTopic {
    pub topic: Option<String>,
    pub score: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QaStage {
    pub tag: String,
    pub name: Option<String>,
    pub score: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlagTemplateSummary {
    pub path: String,
    pub dr_flag_commands_count: u64,
    pub dr_manual_flag_commands_count: u64,
    pub dr_action_evidence: bool,
    pub dr_intervention_suspected: bool,
    pub flag_reasons: Vec<ReasonCount>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasonCount {
    pub reason: String,
    pub count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DrBlock {
    pub dr_intervention_suspected: bool,
    pub dr_flag_commands_count: u64,
    pub dr_manual_flag_commands_count: u64,
    pub dr_flag_reason_summary: Vec<ReasonCount>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactPresence {
    pub kind: ArtifactKind,
    pub filename: String,
    pub local_path: Option<String>,
    pub url: String,
    pub size_bytes: Option<u64>,
    pub checksum: Option<String>,
    pub status: ArtifactStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Provenance {
    pub query_timestamp: Option<String>,
    pub tool_version: String,
    pub manifest_path: String,
    pub summary_generated_at: String,
}

impl AnalysisSummary {
    /// Equality ignoring the generation timestamp.
    pub fn same_content(&self, other: &Self) -> bool {
        let strip = |summary: &Self| {
            let mut copy = summary.clone();
            copy.provenance.summary_generated_at.clear();
            copy
        };
        strip(self) == strip(other)
    }

    pub fn has_qa_evidence(&self) -> bool {
        self.runs
            .values()
            .any(|run| !run.pipeline_aquareport_files.is_empty())
    }

    pub fn eb_uids(&self) -> BTreeSet<String> {
        let mut out: BTreeSet<String> = self.mous.eb_uid_list.iter().cloned().collect();
        out.extend(self.qa.eb_in_asa.iter().map(|eb| eb.eb_uid.clone()));
        out
    }

    fn render_markdown(&self) -> String {
        let lines = [
            format!("# {}", self.mous.mous_uid),
            String::new(),
            format!("- Project code: {}", self.mous.project_code),
            format!(
                "- Public release date: {}",
                self.mous.public_release_date.as_deref().unwrap_or("unknown")
            ),
            format!("- Bands: {}", self.mous.band.join(", ")),
            format!("- QA2 status: {}", self.qa.qa2_status),
            format!("- Has delivered products: {}", self.has_delivered_products),
            format!("- Has run1 products: {}", self.has_run1_products),
            format!(
                "- DR intervention suspected: {}",
                self.dr.dr_intervention_suspected
            ),
            format!("- Artifacts present: {}", self.artifacts_present.len()),
        ];
        let mut text = lines.join("\n");
        text.push('\n');
        text
    }
}

#[derive(Debug, Clone)]
pub struct SummaryOutcome {
    pub summary: AnalysisSummary,
    pub written: bool,
}

pub struct SummaryBuilder {
    tool_version: String,
    write_markdown: bool,
}

impl SummaryBuilder {
    pub fn new(write_markdown: bool) -> Self {
        Self {
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            write_markdown,
        }
    }

    /// Rebuilds the unit's summary from its manifest and content. The file is
    /// rewritten only when something other than the generation time changed.
    pub fn summarize_unit(
        &self,
        manifests: &ManifestStore,
        layout: &UnitLayout,
    ) -> Result<SummaryOutcome, AlmaError> {
        let manifest = manifests.load(layout)?.ok_or_else(|| {
            AlmaError::Filesystem(format!("no manifest at {}", layout.manifest_path()))
        })?;
        let summary = self.build(layout, &manifest)?;
        let summary_path = layout.summary_path();

        let previous: Option<AnalysisSummary> = read_json_document(summary_path.as_std_path())?;
        if let Some(previous) = previous.filter(|previous| previous.same_content(&summary)) {
            debug!(mous_uid = %manifest.mous_uid, "summary unchanged");
            self.write_markdown_file(layout, &previous)?;
            return Ok(SummaryOutcome {
                summary: previous,
                written: false,
            });
        }

        write_json_atomic(summary_path.as_std_path(), &summary)?;
        self.write_markdown_file(layout, &summary)?;
        manifests.append_history(
            layout,
            HistoryEvent::new(
                "summarize",
                "summary_written",
                serde_json::json!({
                    "schema_version": SUMMARY_SCHEMA_VERSION,
                    "qa2_status": summary.qa.qa2_status,
                    "eb_count": summary.qa.eb_in_asa.len(),
                }),
            ),
        )?;
        info!(mous_uid = %manifest.mous_uid, qa2 = %summary.qa.qa2_status, "summary written");
        Ok(SummaryOutcome {
            summary,
            written: true,
        })
    }

    fn write_markdown_file(
        &self,
        layout: &UnitLayout,
        summary: &AnalysisSummary,
    ) -> Result<(), AlmaError> {
        if !self.write_markdown {
            return Ok(());
        }
        let path = layout.summary_markdown_path();
        let text = summary.render_markdown();
        if fs::read_to_string(&path).ok().as_deref() == Some(text.as_str()) {
            return Ok(());
        }
        write_bytes_atomic(path.as_std_path(), text.as_bytes())
    }

    pub fn build(
        &self,
        layout: &UnitLayout,
        manifest: &OperationalManifest,
    ) -> Result<AnalysisSummary, AlmaError> {
        let patterns = Patterns::new()?;
        let delivered = summarize_run(&patterns, layout.delivered().as_std_path())?;
        let run1 = summarize_run(&patterns, layout.run1().as_std_path())?;

        let explicit = explicit_qa0_by_eb(manifest);
        let mut all_ebs: BTreeSet<String> = manifest.eb_uids.iter().cloned().collect();
        all_ebs.extend(delivered.eb_uids_detected.iter().cloned());
        all_ebs.extend(run1.eb_uids_detected.iter().cloned());
        all_ebs.extend(explicit.keys().cloned());

        let eb_in_asa = all_ebs
            .iter()
            .map(|eb_uid| {
                let (status, suggested, source) = if let Some(status) = explicit.get(eb_uid) {
                    (*status, false, Qa0Source::ArchiveExplicit)
                } else if delivered.eb_uids_detected.contains(eb_uid) {
                    (QaStatus::Pass, true, Qa0Source::InferredFromDeliveredPresence)
                } else if run1.eb_uids_detected.contains(eb_uid) {
                    (QaStatus::SemiPass, true, Qa0Source::InferredFromRun1OnlyPresence)
                } else {
                    (QaStatus::Unknown, false, Qa0Source::Unknown)
                };
                EbQa0 {
                    eb_uid: eb_uid.clone(),
                    qa0_status: status,
                    qa0_status_suggested: suggested,
                    qa0_status_source: source,
                }
            })
            .collect();

        let mut qa2_reasons: BTreeSet<String> = manifest.qa2_reasons.iter().cloned().collect();
        for run in [&delivered, &run1] {
            for report in &run.aqua_reports {
                qa2_reasons.extend(report.qa_reasons.iter().cloned());
            }
        }

        let mut dr_reasons = BTreeMap::new();
        for run in [&delivered, &run1] {
            for item in &run.dr_flag_reason_summary {
                *dr_reasons.entry(item.reason.clone()).or_insert(0) += item.count;
            }
        }
        let dr = DrBlock {
            dr_intervention_suspected: delivered.dr_action_evidence || run1.dr_action_evidence,
            dr_flag_commands_count: delivered.dr_flag_commands_count + run1.dr_flag_commands_count,
            dr_manual_flag_commands_count: delivered.dr_manual_flag_commands_count
                + run1.dr_manual_flag_commands_count,
            dr_flag_reason_summary: most_common(dr_reasons),
        };

        let artifacts_present = manifest
            .artifacts
            .iter()
            .filter(|record| record.status == ArtifactStatus::Complete)
            .map(|record| ArtifactPresence {
                kind: record.kind,
                filename: record.filename.clone(),
                local_path: record.local_path.clone(),
                url: record.url.clone(),
                size_bytes: record.size_bytes,
                checksum: record.checksum.clone(),
                status: record.status,
            })
            .collect();

        let has_delivered_products = delivered.has_contents;
        let has_run1_products = run1.has_contents;
        let mut runs = BTreeMap::new();
        runs.insert(DELIVERED_DIR.to_string(), delivered);
        runs.insert(RUN1_DIR.to_string(), run1);

        Ok(AnalysisSummary {
            schema_version: SUMMARY_SCHEMA_VERSION,
            mous: MousBlock {
                project_code: manifest.project_code.clone(),
                public_release_date: manifest.release_date.clone(),
                mous_uid: manifest.mous_uid.clone(),
                group_ous_uid: manifest.group_ous_uid.clone(),
                science_goal_uid: manifest.science_goal_uid.clone(),
                eb_uid_list: all_ebs.into_iter().collect(),
                band: manifest.band_list.clone(),
                obs_date: manifest.obs_date.clone(),
            },
            qa: QaBlock {
                qa2_status: qa2_status(manifest),
                qa2_reasons: qa2_reasons.into_iter().collect(),
                eb_in_asa,
            },
            has_delivered_products,
            has_run1_products,
            runs,
            dr,
            artifacts_present,
            provenance: Provenance {
                query_timestamp: manifest.query_timestamp.clone(),
                tool_version: self.tool_version.clone(),
                manifest_path: layout.manifest_path().to_string(),
                summary_generated_at: now_utc(),
            },
        })
    }
}

struct Patterns {
    eb_segment: regex::Regex,
    eb_uri: regex::Regex,
    flag_reason: regex::Regex,
    xml_tag: regex::Regex,
    xml_attr: regex::Regex,
}

impl Patterns {
    fn new() -> Result<Self, AlmaError> {
        Ok(Self {
            eb_segment: compile(r"(?i)uid___A002_X[0-9A-Za-z]+_X[0-9A-Za-z]+")?,
            eb_uri: compile(r"uid://A002/X[0-9A-Za-z]+/X[0-9A-Za-z]+")?,
            flag_reason: compile(r#"(?i)(?:reason|comment)\s*=\s*['"]([^'"]+)['"]"#)?,
            xml_tag: compile(r"<(/?)([A-Za-z_][\w.:-]*)([^<>]*?)(/?)>")?,
            xml_attr: compile(r#"([A-Za-z_][\w.:-]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#)?,
        })
    }

    /// EB uids mentioned in free text, in canonical form.
    fn eb_uids_in<'a>(&self, values: impl IntoIterator<Item = &'a str>) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        for value in values {
            if value.contains("uid://A002/") {
                for found in self.eb_uri.find_iter(value) {
                    if !continues_token(value, found.end()) {
                        out.insert(found.as_str().to_string());
                    }
                }
            }
            for found in self.eb_segment.find_iter(value) {
                if continues_token(value, found.end()) {
                    continue;
                }
                if let Some(uid) = eb_segment_to_uri(found.as_str()) {
                    out.insert(uid);
                }
            }
        }
        out
    }
}

/// The uid patterns stop at the last alphanumeric; an underscore right after
/// means the match is a prefix of a longer token.
fn continues_token(value: &str, end: usize) -> bool {
    value[end..].starts_with('_')
}

fn eb_segment_to_uri(segment: &str) -> Option<String> {
    let token = segment.trim();
    let token = if token.len() >= 6 && token[..6].eq_ignore_ascii_case("uid___") {
        &token[6..]
    } else {
        token
    };
    let parts: Vec<&str> = token.split('_').collect();
    if parts.len() != 3 || !parts[0].eq_ignore_ascii_case("A002") {
        return None;
    }
    if !parts[1].starts_with('X') || !parts[2].starts_with('X') {
        return None;
    }
    Some(format!("uid://{}/{}/{}", parts[0], parts[1], parts[2]))
}

#[derive(Default)]
struct RunFiles {
    aquareports: Vec<String>,
    applycalqa_outliers: Vec<String>,
    flag_templates: Vec<String>,
    pprequests: Vec<String>,
    qa_files: Vec<String>,
    qa_reports: Vec<String>,
    weblog_landing: Vec<String>,
}

fn classify_run_files(run_dir: &Path, files: &[std::path::PathBuf]) -> RunFiles {
    let mut out = RunFiles::default();
    for path in files {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        let rel_parts: Vec<String> = path
            .strip_prefix(run_dir)
            .unwrap_or(path)
            .components()
            .map(|part| part.as_os_str().to_string_lossy().to_lowercase())
            .collect();
        let text = path.to_string_lossy().to_string();

        if name == "pipeline_aquareport.xml" {
            out.aquareports.push(text.clone());
        }
        if name == "applycalqa_outliers.txt" {
            out.applycalqa_outliers.push(text.clone());
        }
        if name.contains("flagtemplate") && name.ends_with(".txt") {
            out.flag_templates.push(text.clone());
        }
        if name.ends_with(".pprequest.xml") {
            out.pprequests.push(text.clone());
        }
        if rel_parts.iter().any(|part| part == "qa") {
            out.qa_files.push(text.clone());
        }
        if name.ends_with(".qa0_report.pdf") || name.ends_with(".qa2_report.pdf") {
            out.qa_reports.push(text.clone());
        }
        if rel_parts.iter().any(|part| part == "html")
            && (name == "index.html" || name == "t1-1.html")
        {
            out.weblog_landing.push(text);
        }
    }
    out
}

fn choose_weblog_landing(candidates: &[String]) -> Option<String> {
    let mut sorted = candidates.to_vec();
    sorted.sort();
    let pick = |suffix: &str| {
        sorted
            .iter()
            .find(|path| path.to_lowercase().ends_with(suffix))
            .cloned()
    };
    pick("/index.html")
        .or_else(|| pick("/t1-1.html"))
        .or_else(|| sorted.first().cloned())
}

fn summarize_run(patterns: &Patterns, run_dir: &Path) -> Result<RunSummary, AlmaError> {
    let files = walk_files(run_dir)?;
    let found = classify_run_files(run_dir, &files);

    let mut pprequest = Vec::new();
    let mut ppr_ebs = BTreeSet::new();
    for item in &found.pprequests {
        match fs::read(item)
            .map_err(|err| err.to_string())
            .and_then(|bytes| parse_pprequest(patterns, &String::from_utf8_lossy(&bytes)))
        {
            Ok(eb_uids) => {
                ppr_ebs.extend(eb_uids.iter().cloned());
                pprequest.push(PprequestEntry {
                    path: item.clone(),
                    eb_uids,
                    error: None,
                });
            }
            Err(err) => {
                warn!(path = %item, error = %err, "failed parsing pprequest");
                pprequest.push(PprequestEntry {
                    path: item.clone(),
                    eb_uids: Vec::new(),
                    error: Some(err),
                });
            }
        }
    }

    let mut flag_templates = Vec::new();
    let mut reason_counts = BTreeMap::new();
    for item in &found.flag_templates {
        match fs::read(item) {
            Ok(bytes) => {
                let parsed = parse_flag_template(patterns, item, &String::from_utf8_lossy(&bytes));
                for reason in &parsed.flag_reasons {
                    *reason_counts.entry(reason.reason.clone()).or_insert(0) += reason.count;
                }
                flag_templates.push(parsed);
            }
            Err(err) => warn!(path = %item, error = %err, "failed reading flag template"),
        }
    }

    let mut aqua_reports = Vec::new();
    for item in &found.aquareports {
        match fs::read(item)
            .map_err(|err| err.to_string())
            .and_then(|bytes| parse_aqua_report(patterns, &String::from_utf8_lossy(&bytes)))
        {
            Ok(parsed) => aqua_reports.push(AquaReportEntry {
                path: item.clone(),
                qa_reasons: parsed.qa_reasons.clone(),
                parsed: Some(parsed),
                error: None,
            }),
            Err(err) => {
                warn!(path = %item, error = %err, "failed parsing aqua report");
                aqua_reports.push(AquaReportEntry {
                    path: item.clone(),
                    qa_reasons: Vec::new(),
                    parsed: None,
                    error: Some(err),
                });
            }
        }
    }

    let file_paths: Vec<String> = files
        .iter()
        .map(|path| path.to_string_lossy().to_string())
        .collect();
    let mut eb_uids_detected = ppr_ebs;
    eb_uids_detected.extend(patterns.eb_uids_in(file_paths.iter().map(String::as_str)));

    let mut weblog_landing_candidates = found.weblog_landing.clone();
    weblog_landing_candidates.sort();

    Ok(RunSummary {
        path: run_dir.to_string_lossy().to_string(),
        has_contents: !files.is_empty(),
        file_count: files.len(),
        pprequest_files: sorted(found.pprequests),
        pprequest,
        pipeline_aquareport_files: sorted(found.aquareports),
        applycalqa_outliers_files: sorted(found.applycalqa_outliers),
        weblog_landing_page: choose_weblog_landing(&weblog_landing_candidates),
        weblog_landing_candidates,
        dr_action_evidence: flag_templates.iter().any(|item| item.dr_action_evidence),
        dr_flag_commands_count: flag_templates
            .iter()
            .map(|item| item.dr_flag_commands_count)
            .sum(),
        dr_manual_flag_commands_count: flag_templates
            .iter()
            .map(|item| item.dr_manual_flag_commands_count)
            .sum(),
        flag_templates,
        dr_flag_reason_summary: most_common(reason_counts),
        qa_report_files: sorted(found.qa_reports),
        qa_files: sorted(found.qa_files),
        aqua_reports,
        eb_uids_detected: eb_uids_detected.into_iter().collect(),
    })
}

fn sorted(mut values: Vec<String>) -> Vec<String> {
    values.sort();
    values
}

/// Highest counts first, ties by reason text.
fn most_common(counts: BTreeMap<String, u64>) -> Vec<ReasonCount> {
    let mut items: Vec<ReasonCount> = counts
        .into_iter()
        .map(|(reason, count)| ReasonCount { reason, count })
        .collect();
    items.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.reason.cmp(&b.reason)));
    items.truncate(TOP_REASONS);
    items
}

fn parse_flag_template(patterns: &Patterns, path: &str, text: &str) -> FlagTemplateSummary {
    let mut commands = 0;
    let mut manual = 0;
    let mut reasons: BTreeMap<String, u64> = BTreeMap::new();
    let mut recent_comments: Vec<String> = Vec::new();

    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with('#') {
            let comment = line.trim_start_matches('#').trim();
            if !comment.is_empty() {
                recent_comments.push(comment.to_string());
                if recent_comments.len() > 3 {
                    recent_comments.remove(0);
                }
            }
            continue;
        }

        commands += 1;
        let lower = line.to_lowercase();
        if lower.contains("mode='manual'") || lower.contains("mode=\"manual\"") {
            manual += 1;
        }
        if let Some(found) = patterns.flag_reason.captures(line) {
            *reasons.entry(found[1].trim().to_string()).or_insert(0) += 1;
        } else {
            for comment in recent_comments.drain(..) {
                let lower = comment.to_lowercase();
                if COMMENT_KEYWORDS.iter().any(|keyword| lower.contains(keyword)) {
                    *reasons.entry(comment).or_insert(0) += 1;
                }
            }
        }
    }

    FlagTemplateSummary {
        path: path.to_string(),
        dr_flag_commands_count: commands,
        dr_manual_flag_commands_count: manual,
        dr_action_evidence: manual > 0,
        dr_intervention_suspected: manual > 0,
        flag_reasons: most_common(reasons),
    }
}

#[derive(Debug)]
struct XmlElement {
    name: String,
    attrs: BTreeMap<String, String>,
    text: String,
    parent: Option<usize>,
}

impl XmlElement {
    fn attr(&self, names: &[&str]) -> Option<String> {
        names
            .iter()
            .find_map(|name| self.attrs.get(*name))
            .filter(|value| !value.is_empty())
            .cloned()
    }
}

/// Flat element list with parent links. Enough structure for the report
/// formats read here; not a validating parser.
fn xml_elements(patterns: &Patterns, xml: &str) -> Result<Vec<XmlElement>, String> {
    let mut elements: Vec<XmlElement> = Vec::new();
    let mut stack: Vec<usize> = Vec::new();
    for found in patterns.xml_tag.captures_iter(xml) {
        let whole = found.get(0).map(|m| m.end()).unwrap_or_default();
        let name = local_name(&found[2]);
        if &found[1] == "/" {
            if let Some(pos) = stack.iter().rposition(|idx| elements[*idx].name == name) {
                stack.truncate(pos);
            }
            continue;
        }
        let attrs = patterns
            .xml_attr
            .captures_iter(&found[3])
            .map(|attr| {
                let value = attr
                    .get(2)
                    .or_else(|| attr.get(3))
                    .map(|m| m.as_str())
                    .unwrap_or_default();
                (local_name(&attr[1]), unescape(value))
            })
            .collect();
        let self_closing = &found[4] == "/";
        let text = if self_closing {
            String::new()
        } else {
            let rest = &xml[whole..];
            unescape(rest[..rest.find('<').unwrap_or(rest.len())].trim())
        };
        elements.push(XmlElement {
            name,
            attrs,
            text,
            parent: stack.last().copied(),
        });
        if !self_closing {
            stack.push(elements.len() - 1);
        }
    }
    if elements.is_empty() {
        return Err("no XML elements found".to_string());
    }
    Ok(elements)
}

fn local_name(tag: &str) -> String {
    tag.rsplit(':').next().unwrap_or(tag).to_string()
}

fn unescape(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn parse_aqua_report(patterns: &Patterns, xml: &str) -> Result<AquaReport, String> {
    let elements = xml_elements(patterns, xml)?;
    let mut report = AquaReport::default();
    for element in &elements {
        let lower = element.name.to_lowercase();
        if lower.contains("qapertopic") {
            let mut topic = QaTopic {
                topic: element.attr(&["Topic", "topic", "name"]),
                score: element.attr(&["Score", "score"]),
                reason: element.attr(&["Reason", "reason"]),
            };
            if topic.reason.is_none() && !element.text.is_empty() {
                topic.reason = Some(element.text.clone());
            }
            report.qa_per_topic.push(topic);
        }
        if lower.contains("qaperstage")
            || lower.contains("representativescore")
            || lower.contains("subscore")
        {
            report.qa_per_stage.push(QaStage {
                tag: element.name.clone(),
                name: element.attr(&["Name", "name"]),
                score: element.attr(&["Score", "score"]),
                reason: element.attr(&["Reason", "reason"]),
            });
        }
    }
    let reasons: BTreeSet<String> = report
        .qa_per_topic
        .iter()
        .filter_map(|topic| topic.reason.as_deref())
        .map(str::trim)
        .filter(|reason| !reason.is_empty())
        .map(str::to_string)
        .collect();
    report.qa_reasons = reasons.into_iter().collect();
    Ok(report)
}

/// EB uids named by `SESSION_*` intents.
fn parse_pprequest(patterns: &Patterns, xml: &str) -> Result<Vec<String>, String> {
    let elements = xml_elements(patterns, xml)?;
    let mut eb_uids = BTreeSet::new();
    for (idx, element) in elements.iter().enumerate() {
        if !element.name.eq_ignore_ascii_case("intents") {
            continue;
        }
        let mut keyword = None;
        let mut value = None;
        for child in elements.iter().filter(|child| child.parent == Some(idx)) {
            match child.name.to_lowercase().as_str() {
                "keyword" => keyword = Some(child.text.as_str()),
                "value" => value = Some(child.text.as_str()),
                _ => {}
            }
        }
        if let (Some(keyword), Some(value)) = (keyword, value) {
            if keyword.to_uppercase().starts_with("SESSION_") && value.starts_with("uid://A002/") {
                eb_uids.insert(value.to_string());
            }
        }
    }
    Ok(eb_uids.into_iter().collect())
}

fn qa2_status(manifest: &OperationalManifest) -> QaStatus {
    manifest
        .extra
        .get("qa2_status")
        .and_then(Value::as_str)
        .and_then(QaStatus::from_text)
        .unwrap_or_else(|| QaStatus::from_passed(manifest.qa2_passed))
}

/// Per-EB QA0 values the archive reported, either as an `{eb: status}` map
/// or a list of `{eb_uid, qa0_status}` objects.
fn explicit_qa0_by_eb(manifest: &OperationalManifest) -> BTreeMap<String, QaStatus> {
    let mut out = BTreeMap::new();
    let raw = manifest
        .extra
        .get("qa0_by_eb")
        .or_else(|| manifest.extra.get("eb_qa0_status"));
    match raw {
        Some(Value::Object(map)) => {
            for (eb_uid, status) in map {
                out.insert(eb_uid.clone(), qa0_from_value(status));
            }
        }
        Some(Value::Array(items)) => {
            for item in items {
                let Some(object) = item.as_object() else {
                    continue;
                };
                let eb_uid = ["eb_uid", "uid", "asdm_uid"]
                    .iter()
                    .find_map(|key| object.get(*key).and_then(Value::as_str))
                    .filter(|uid| !uid.is_empty());
                let Some(eb_uid) = eb_uid else {
                    continue;
                };
                let status = object
                    .get("qa0_status")
                    .or_else(|| object.get("status"))
                    .unwrap_or(&Value::Null);
                out.insert(eb_uid.to_string(), qa0_from_value(status));
            }
        }
        _ => {}
    }
    out
}

fn qa0_from_value(value: &Value) -> QaStatus {
    match value {
        Value::Bool(passed) => QaStatus::from_passed(Some(*passed)),
        Value::String(text) => QaStatus::from_text(text).unwrap_or_default(),
        Value::Number(number) => QaStatus::from_text(&number.to_string()).unwrap_or_default(),
        _ => QaStatus::Unknown,
    }
}
