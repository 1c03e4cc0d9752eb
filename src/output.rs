use std::io::{self, Write};

use serde::Serialize;

use crate::app::{DiscoverResult, PlanResult, ProgressEvent, ProgressSink, StageResult};
use crate::index::ScanReport;
use crate::merge::MergeReport;
use crate::status::StatusReport;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_discover(result: &DiscoverResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_stage(result: &StageResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_plan(result: &PlanResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_scan(result: &ScanReport) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_merge(result: &MergeReport) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_status(result: &StatusReport) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Human-readable progress on stderr and short summaries on stdout.
pub struct TextOutput;

impl TextOutput {
    pub fn print_discover(result: &DiscoverResult) {
        println!(
            "Discovered {} units from {} rows -> {}",
            result.candidates, result.rows, result.output
        );
    }

    pub fn print_stage(result: &StageResult) {
        println!(
            "{}: {}/{} units processed, {} failed, {} indexed",
            result.stage, result.processed, result.total, result.failed, result.indexed
        );
        if result.stopped_early {
            println!("Run budget exhausted; rerun to continue.");
        }
        for unit in &result.units {
            let uid = unit.mous_uid.as_deref().unwrap_or("?");
            if let Some(error) = &unit.error {
                println!("- {uid}: {} failed: {}", error.stage, error.message);
            } else if let Some(reason) = &unit.skipped {
                println!("- {uid}: skipped ({reason})");
            }
        }
    }

    pub fn print_plan(result: &PlanResult) {
        println!(
            "Planned {} records into {} shards under {}",
            result.total_records,
            result.shards.len(),
            result.out_dir
        );
    }

    pub fn print_scan(result: &ScanReport) {
        println!(
            "Scanned {}: {} units, {} indexed, {} without documents, {} layouts fixed",
            result.root,
            result.units_found,
            result.indexed,
            result.without_documents,
            result.layout_fixed
        );
        for error in &result.errors {
            println!("- {error}");
        }
    }

    pub fn print_merge(result: &MergeReport) {
        println!(
            "Merged {} shard tables and {} summaries into {}: {} applied, {} unchanged",
            result.shard_tables,
            result.summary_files,
            result.central,
            result.applied,
            result.unchanged
        );
        for conflict in &result.conflicts {
            println!("- conflict {}: {}", conflict.mous_uid, conflict.message);
        }
        println!("Integrity: {}", result.integrity);
    }

    pub fn print_status(result: &StatusReport) {
        print!("{}", result.render_text());
    }
}

impl ProgressSink for TextOutput {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => eprintln!("{} ({:.1}s)", event.message, elapsed.as_secs_f64()),
            None => eprintln!("{}", event.message),
        }
    }
}
