use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::AlmaError;
use crate::index::IndexStore;

pub const DEFAULT_TOP_ERRORS: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatusCounts {
    pub discovered: u64,
    pub downloaded: u64,
    pub unpacked: u64,
    pub summarized: u64,
    pub indexed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorCount {
    pub message: String,
    pub count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TodoBlock {
    pub missing_qa: u64,
    pub missing_summary: u64,
    pub failed_downloads: u64,
    pub failed_auxiliary_downloads: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatusReport {
    pub counts: StatusCounts,
    pub failure_by_stage: BTreeMap<String, u64>,
    pub top_errors: Vec<ErrorCount>,
    pub band_coverage: BTreeMap<String, u64>,
    pub release_date_bins: BTreeMap<String, u64>,
    pub todo: TodoBlock,
}

impl StatusReport {
    pub fn build(store: &IndexStore, top_errors: usize) -> Result<Self, AlmaError> {
        let conn = store.connection();
        let count = |sql: &str| -> Result<u64, AlmaError> {
            let value: i64 = conn.query_row(sql, [], |row| row.get(0))?;
            Ok(u64::try_from(value).unwrap_or_default())
        };

        let counts = StatusCounts {
            discovered: count("SELECT COUNT(*) FROM mous WHERE discovered = 1")?,
            downloaded: count("SELECT COUNT(*) FROM mous WHERE downloaded = 1")?,
            unpacked: count("SELECT COUNT(*) FROM mous WHERE unpacked = 1")?,
            summarized: count("SELECT COUNT(*) FROM mous WHERE summarized = 1")?,
            indexed: count("SELECT COUNT(*) FROM mous WHERE indexed = 1")?,
        };

        let mut failure_by_stage = BTreeMap::new();
        let mut messages: BTreeMap<String, u64> = BTreeMap::new();
        let mut band_coverage = BTreeMap::new();
        let mut release_date_bins = BTreeMap::new();

        let mut stmt = conn.prepare(
            "SELECT last_error_stage, last_error_message, band_json, release_date FROM mous",
        )?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let stage: Option<String> = row.get(0)?;
            let message: Option<String> = row.get(1)?;
            let band_json: String = row.get(2)?;
            let release_date: Option<String> = row.get(3)?;

            if let Some(stage) = stage.filter(|stage| !stage.is_empty()) {
                *failure_by_stage.entry(stage).or_insert(0) += 1;
            }
            if let Some(message) = message.filter(|message| !message.is_empty()) {
                *messages.entry(message).or_insert(0) += 1;
            }
            let bands: Vec<String> = serde_json::from_str(&band_json).unwrap_or_default();
            if bands.is_empty() {
                *band_coverage.entry("unknown".to_string()).or_insert(0) += 1;
            }
            for band in bands {
                *band_coverage.entry(band).or_insert(0) += 1;
            }
            *release_date_bins
                .entry(month_bin(release_date.as_deref()))
                .or_insert(0) += 1;
        }

        let mut top: Vec<ErrorCount> = messages
            .into_iter()
            .map(|(message, count)| ErrorCount { message, count })
            .collect();
        top.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.message.cmp(&b.message)));
        top.truncate(top_errors);

        let todo = TodoBlock {
            missing_qa: count(
                "SELECT COUNT(*) FROM mous WHERE summarized = 1 AND asa_qa_present = 0",
            )?,
            missing_summary: count("SELECT COUNT(*) FROM mous WHERE summarized = 0")?,
            failed_downloads: count(
                "SELECT COUNT(*) FROM artifact WHERE status IN ('failed', 'error')",
            )?,
            failed_auxiliary_downloads: count(
                "SELECT COUNT(*) FROM artifact WHERE status IN ('failed', 'error') \
                 AND kind = 'auxiliary'",
            )?,
        };

        Ok(Self {
            counts,
            failure_by_stage,
            top_errors: top,
            band_coverage,
            release_date_bins,
            todo,
        })
    }

    pub fn render_text(&self) -> String {
        let mut lines = vec![
            "ALMA Bulk Status".to_string(),
            "================".to_string(),
            format!(
                "Counts: discovered={} downloaded={} unpacked={} summarized={} indexed={}",
                self.counts.discovered,
                self.counts.downloaded,
                self.counts.unpacked,
                self.counts.summarized,
                self.counts.indexed
            ),
        ];

        lines.push(String::new());
        lines.push("Failures by stage:".to_string());
        if self.failure_by_stage.is_empty() {
            lines.push("- none".to_string());
        } else {
            let mut stages: Vec<_> = self.failure_by_stage.iter().collect();
            stages.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
            for (stage, count) in stages {
                lines.push(format!("- {stage}: {count}"));
            }
        }

        lines.push(String::new());
        lines.push("Top error messages:".to_string());
        if self.top_errors.is_empty() {
            lines.push("- none".to_string());
        }
        for item in &self.top_errors {
            lines.push(format!("- ({}) {}", item.count, item.message));
        }

        lines.push(String::new());
        lines.push("Coverage by band:".to_string());
        for (band, count) in &self.band_coverage {
            lines.push(format!("- {band}: {count}"));
        }

        lines.push(String::new());
        lines.push("Coverage by release month:".to_string());
        for (month, count) in &self.release_date_bins {
            lines.push(format!("- {month}: {count}"));
        }

        lines.push(String::new());
        lines.push("To do next:".to_string());
        lines.push(format!("- missing_qa: {}", self.todo.missing_qa));
        lines.push(format!("- missing_summary: {}", self.todo.missing_summary));
        lines.push(format!("- failed_downloads: {}", self.todo.failed_downloads));
        lines.push(format!(
            "- failed_auxiliary_downloads: {}",
            self.todo.failed_auxiliary_downloads
        ));

        let mut text = lines.join("\n");
        text.push('\n');
        text
    }
}

/// `YYYY-MM` of an ISO date, or `unknown`.
fn month_bin(date: Option<&str>) -> String {
    match date.map(str::trim) {
        Some(date) if date.len() >= 7 && date.is_char_boundary(7) => date[..7].to_string(),
        _ => "unknown".to_string(),
    }
}
