use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::archive::ArchiveClient;
use crate::config::ResolvedConfig;
use crate::domain::UnitCandidate;
use crate::error::AlmaError;
use crate::fetch::{ArtifactFetcher, FetchReport};
use crate::index::{INDEX_FILENAME, IndexRecord, IndexStore, ScanReport};
use crate::layout::{PathResolver, UnitLayout, find_unit_dirs};
use crate::manifest::{HistoryEvent, ManifestStore};
use crate::merge::{IndexMerger, MergeOptions, MergeReport};
use crate::query::{discover, read_candidates_jsonl, write_candidates_jsonl};
use crate::status::StatusReport;
use crate::store::{now_utc, write_json_atomic};
use crate::summary::SummaryBuilder;
use crate::unpack::{UnpackController, UnpackReport};

pub const DEFAULT_SHARD_SIZE: usize = 200;
pub const PLAN_FILENAME: &str = "plan.json";

/// Wall-clock limit plus a cancel flag, checked between units and between
/// files. Work that has not started when the budget runs out stays resumable.
#[derive(Debug, Clone)]
pub struct RunBudget {
    deadline: Option<Instant>,
    cancelled: Arc<AtomicBool>,
}

impl RunBudget {
    pub fn unlimited() -> Self {
        Self {
            deadline: None,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn new(max_runtime_min: Option<u64>) -> Self {
        let deadline = max_runtime_min
            .map(|minutes| Instant::now() + Duration::from_secs(minutes.saturating_mul(60)));
        Self {
            deadline,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn exhausted(&self) -> bool {
        self.is_cancelled() || self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }
}

impl Default for RunBudget {
    fn default() -> Self {
        Self::unlimited()
    }
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink: Send + Sync {
    fn event(&self, event: ProgressEvent);
}

/// Discards every event.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn event(&self, _event: ProgressEvent) {}
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoverResult {
    pub adql: String,
    pub rows: usize,
    pub candidates: usize,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitFailure {
    pub stage: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitResult {
    pub mous_uid: Option<String>,
    pub local_dir: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetch: Option<FetchReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unpack: Option<UnpackReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary_written: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<UnitFailure>,
    #[serde(skip)]
    record: Option<IndexRecord>,
}

impl UnitResult {
    fn new(layout: &UnitLayout) -> Self {
        Self {
            mous_uid: None,
            local_dir: layout.root().to_string(),
            fetch: None,
            unpack: None,
            summary_written: None,
            skipped: None,
            error: None,
            record: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageResult {
    pub stage: String,
    pub index: Option<String>,
    pub total: usize,
    pub processed: usize,
    pub failed: usize,
    pub indexed: usize,
    pub stopped_early: bool,
    pub units: Vec<UnitResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanResult {
    pub created_at: String,
    pub out_dir: String,
    pub total_records: usize,
    pub shard_size: usize,
    pub shards: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SummarizeOptions {
    pub write_markdown: bool,
    pub shard_id: Option<String>,
    pub index_db: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    pub fix_layout: bool,
    pub rebuild_db: bool,
    pub index_db: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Stages {
    fetch: bool,
    unpack: bool,
    summarize: bool,
    write_markdown: bool,
}

struct UnitWork {
    layout: UnitLayout,
    candidate: Option<UnitCandidate>,
}

struct PoolOutcome {
    units: Vec<UnitResult>,
    stopped_early: bool,
}

/// Pipeline driver. Units are processed by at most `unit_workers` threads
/// with exactly one owner per unit; index rows are written afterwards by the
/// calling thread only.
pub struct App<A: ArchiveClient> {
    config: ResolvedConfig,
    client: A,
    manifests: ManifestStore,
    budget: RunBudget,
}

impl<A: ArchiveClient> App<A> {
    pub fn new(config: ResolvedConfig, client: A) -> Self {
        let budget = RunBudget::new(config.max_runtime_min);
        Self {
            config,
            client,
            manifests: ManifestStore::new(),
            budget,
        }
    }

    pub fn with_budget(mut self, budget: RunBudget) -> Self {
        self.budget = budget;
        self
    }

    pub fn budget(&self) -> &RunBudget {
        &self.budget
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn discover(
        &self,
        start: &str,
        end: &str,
        out: &Path,
        sink: &dyn ProgressSink,
    ) -> Result<DiscoverResult, AlmaError> {
        let started = Instant::now();
        sink.event(ProgressEvent {
            message: format!("phase=Discover; window {start}..{end}"),
            elapsed: None,
        });
        let discovery = discover(&self.client, start, end, &self.config.filters)?;
        write_candidates_jsonl(out, &discovery.candidates)?;
        info!(
            candidates = discovery.candidates.len(),
            out = %out.display(),
            "discovery written"
        );
        sink.event(ProgressEvent {
            message: format!("phase=Done; {} units", discovery.candidates.len()),
            elapsed: Some(started.elapsed()),
        });
        Ok(DiscoverResult {
            adql: discovery.adql,
            rows: discovery.rows,
            candidates: discovery.candidates.len(),
            output: out.display().to_string(),
        })
    }

    /// Downloads the units listed in `input`, or every unit that already has
    /// a manifest below the destination.
    pub fn download(
        &self,
        input: Option<&Path>,
        sink: &dyn ProgressSink,
    ) -> Result<StageResult, AlmaError> {
        let work = match input {
            Some(input) => self.units_from_candidates(read_candidates_jsonl(input)?)?,
            None => self.units_from_tree()?,
        };
        let stages = Stages {
            fetch: true,
            ..Stages::default()
        };
        let index = self.default_index_path()?;
        self.run_stage("download", work, stages, None, &index, sink)
    }

    pub fn unpack(&self, sink: &dyn ProgressSink) -> Result<StageResult, AlmaError> {
        let work = self.units_from_tree()?;
        let stages = Stages {
            unpack: true,
            ..Stages::default()
        };
        let index = self.default_index_path()?;
        self.run_stage("unpack", work, stages, None, &index, sink)
    }

    pub fn summarize(
        &self,
        options: &SummarizeOptions,
        sink: &dyn ProgressSink,
    ) -> Result<StageResult, AlmaError> {
        let work = self.units_from_tree()?;
        let stages = Stages {
            summarize: true,
            write_markdown: options.write_markdown,
            ..Stages::default()
        };
        let index = match &options.index_db {
            Some(path) => path.clone(),
            None => self.default_index_path()?,
        };
        self.run_stage(
            "summarize",
            work,
            stages,
            options.shard_id.as_deref(),
            &index,
            sink,
        )
    }

    /// Rebuilds index rows from the documents below the destination.
    pub fn scan(
        &self,
        options: &ScanOptions,
        sink: &dyn ProgressSink,
    ) -> Result<ScanReport, AlmaError> {
        let started = Instant::now();
        let dest = self.config.require_dest()?;
        let index = match &options.index_db {
            Some(path) => path.clone(),
            None => self.default_index_path()?,
        };
        if options.rebuild_db && index.exists() {
            info!(index = %index.display(), "removing index before rebuild");
            fs::remove_file(&index).map_err(|err| AlmaError::Filesystem(err.to_string()))?;
        }
        sink.event(ProgressEvent {
            message: format!("phase=Scan; root {dest}"),
            elapsed: None,
        });
        let mut store = IndexStore::open(&index)?;
        let report = store.scan_and_populate(&dest, None, options.fix_layout)?;
        sink.event(ProgressEvent {
            message: format!("phase=Done; {} units indexed", report.indexed),
            elapsed: Some(started.elapsed()),
        });
        Ok(report)
    }

    /// Splits a discovery file into fixed-size shard files ordered by member
    /// uid, plus a `plan.json` describing them.
    pub fn plan(
        &self,
        input: &Path,
        out_dir: &Path,
        shard_size: usize,
    ) -> Result<PlanResult, AlmaError> {
        if shard_size == 0 {
            return Err(AlmaError::InvalidSelection(
                "shard size must be at least 1".to_string(),
            ));
        }
        let mut candidates = read_candidates_jsonl(input)?;
        candidates.sort_by(|a, b| a.identity.mous_uid.cmp(&b.identity.mous_uid));

        let mut shards = Vec::new();
        for (idx, chunk) in candidates.chunks(shard_size).enumerate() {
            let path = out_dir.join(format!("part-{:04}.jsonl", idx + 1));
            write_candidates_jsonl(&path, chunk)?;
            shards.push(path.display().to_string());
        }

        let plan = PlanResult {
            created_at: now_utc(),
            out_dir: out_dir.display().to_string(),
            total_records: candidates.len(),
            shard_size,
            shards,
        };
        write_json_atomic(&out_dir.join(PLAN_FILENAME), &plan)?;
        info!(shards = plan.shards.len(), total = plan.total_records, "plan written");
        Ok(plan)
    }

    /// Runs the whole per-unit pipeline for one shard file. Rows go to a
    /// table next to the shard file, labelled with the shard file stem.
    pub fn run_shard(
        &self,
        shard: &Path,
        download_missing: bool,
        sink: &dyn ProgressSink,
    ) -> Result<StageResult, AlmaError> {
        let shard_id = shard
            .file_stem()
            .and_then(|stem| stem.to_str())
            .ok_or_else(|| {
                AlmaError::InvalidSelection(format!("invalid shard path {}", shard.display()))
            })?
            .to_string();
        let index = shard.with_extension("sqlite");
        let work = self.units_from_candidates(read_candidates_jsonl(shard)?)?;
        let stages = Stages {
            fetch: download_missing,
            unpack: true,
            summarize: true,
            write_markdown: false,
        };
        self.run_stage("run-shard", work, stages, Some(&shard_id), &index, sink)
    }

    pub fn merge_index(
        &self,
        shards_root: &Path,
        options: MergeOptions,
        sink: &dyn ProgressSink,
    ) -> Result<MergeReport, AlmaError> {
        let started = Instant::now();
        let central = self.default_index_path()?;
        sink.event(ProgressEvent {
            message: format!("phase=Merge; shards {}", shards_root.display()),
            elapsed: None,
        });
        let report = IndexMerger::new(options).merge_from_shards(shards_root, &central)?;
        sink.event(ProgressEvent {
            message: format!(
                "phase=Done; applied={} conflicts={}",
                report.applied,
                report.conflicts.len()
            ),
            elapsed: Some(started.elapsed()),
        });
        Ok(report)
    }

    pub fn status(&self, top_errors: usize) -> Result<StatusReport, AlmaError> {
        let index = self.default_index_path()?;
        if !index.is_file() {
            return Err(AlmaError::Index(format!(
                "index not found at {}",
                index.display()
            )));
        }
        let store = IndexStore::open_read_only(&index)?;
        StatusReport::build(&store, top_errors)
    }

    fn default_index_path(&self) -> Result<PathBuf, AlmaError> {
        Ok(self
            .config
            .require_dest()?
            .join(INDEX_FILENAME)
            .into_std_path_buf())
    }

    fn units_from_candidates(
        &self,
        candidates: Vec<UnitCandidate>,
    ) -> Result<Vec<UnitWork>, AlmaError> {
        let resolver = PathResolver::new(self.config.require_dest()?);
        Ok(candidates
            .into_iter()
            .map(|candidate| UnitWork {
                layout: resolver.resolve(&candidate.identity),
                candidate: Some(candidate),
            })
            .collect())
    }

    fn units_from_tree(&self) -> Result<Vec<UnitWork>, AlmaError> {
        let dest: Utf8PathBuf = self.config.require_dest()?;
        Ok(find_unit_dirs(&dest)?
            .into_iter()
            .map(|dir| UnitWork {
                layout: UnitLayout::new(dir),
                candidate: None,
            })
            .collect())
    }

    fn run_stage(
        &self,
        stage: &str,
        work: Vec<UnitWork>,
        stages: Stages,
        shard_id: Option<&str>,
        index: &Path,
        sink: &dyn ProgressSink,
    ) -> Result<StageResult, AlmaError> {
        let started = Instant::now();
        let total = work.len();
        sink.event(ProgressEvent {
            message: format!("phase={stage}; {total} units"),
            elapsed: None,
        });

        let outcome = self.run_pool(work, |unit| self.process_unit(unit, stages, shard_id))?;
        let mut units = outcome.units;

        let records: Vec<IndexRecord> = units
            .iter_mut()
            .filter_map(|unit| unit.record.take())
            .collect();
        if !records.is_empty() {
            let mut store = IndexStore::open(index)?;
            store.upsert_all(&records)?;
        }

        let failed = units.iter().filter(|unit| unit.error.is_some()).count();
        if outcome.stopped_early {
            warn!(
                stage,
                done = units.len(),
                total,
                "run budget exhausted; remaining units left for the next run"
            );
        }
        sink.event(ProgressEvent {
            message: format!("phase=Done; {}/{total} units, {failed} failed", units.len()),
            elapsed: Some(started.elapsed()),
        });
        Ok(StageResult {
            stage: stage.to_string(),
            index: Some(index.display().to_string()),
            total,
            processed: units.len(),
            failed,
            indexed: records.len(),
            stopped_early: outcome.stopped_early,
            units,
        })
    }

    /// Bounded unit pool. A fatal error stops every worker; the budget is
    /// checked before a worker takes the next unit.
    fn run_pool<F>(&self, work: Vec<UnitWork>, process: F) -> Result<PoolOutcome, AlmaError>
    where
        F: Fn(UnitWork) -> Result<UnitResult, AlmaError> + Sync,
    {
        if work.is_empty() {
            return Ok(PoolOutcome {
                units: Vec::new(),
                stopped_early: false,
            });
        }
        let workers = self.config.unit_workers.clamp(1, work.len());
        let queue = Mutex::new(work.into_iter().enumerate().collect::<VecDeque<_>>());
        let results = Mutex::new(Vec::new());
        let fatal: Mutex<Option<AlmaError>> = Mutex::new(None);
        let stopped = AtomicBool::new(false);

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    loop {
                        if self.budget.exhausted() {
                            stopped.store(true, Ordering::SeqCst);
                            break;
                        }
                        let next = match queue.lock() {
                            Ok(mut queue) => queue.pop_front(),
                            Err(_) => None,
                        };
                        let Some((idx, unit)) = next else {
                            break;
                        };
                        match process(unit) {
                            Ok(result) => {
                                if let Ok(mut results) = results.lock() {
                                    results.push((idx, result));
                                }
                            }
                            Err(err) => {
                                if let Ok(mut fatal) = fatal.lock() {
                                    fatal.get_or_insert(err);
                                }
                                if let Ok(mut queue) = queue.lock() {
                                    queue.clear();
                                }
                                break;
                            }
                        }
                    }
                });
            }
        });

        if let Some(err) = fatal
            .into_inner()
            .map_err(|_| AlmaError::Filesystem("unit worker poisoned".to_string()))?
        {
            return Err(err);
        }
        let remaining = queue
            .into_inner()
            .map_err(|_| AlmaError::Filesystem("unit worker poisoned".to_string()))?
            .len();
        let mut results = results
            .into_inner()
            .map_err(|_| AlmaError::Filesystem("unit worker poisoned".to_string()))?;
        results.sort_by_key(|(idx, _)| *idx);
        Ok(PoolOutcome {
            units: results.into_iter().map(|(_, result)| result).collect(),
            stopped_early: stopped.load(Ordering::SeqCst) && remaining > 0,
        })
    }

    /// Runs the selected stages for one unit. Unit-scoped failures are
    /// recorded in the manifest history and the result; policy and index
    /// errors abort the whole run.
    fn process_unit(
        &self,
        unit: UnitWork,
        stages: Stages,
        shard_id: Option<&str>,
    ) -> Result<UnitResult, AlmaError> {
        let layout = unit.layout;
        let mut result = UnitResult::new(&layout);

        if let Err((stage, err)) =
            self.run_unit_stages(&layout, unit.candidate.as_ref(), stages, &mut result)
        {
            if matches!(err, AlmaError::PolicyViolation { .. } | AlmaError::Index(_)) {
                return Err(err);
            }
            warn!(dir = %layout.root(), stage, error = %err, "unit stage failed");
            let corrupt = matches!(err, AlmaError::DocumentCorruption { .. });
            if !corrupt && layout.manifest_path().is_file() {
                let event = HistoryEvent::new(
                    stage,
                    "stage_failed",
                    json!({ "error": err.to_string() }),
                );
                if let Err(history_err) = self.manifests.append_history(&layout, event) {
                    warn!(dir = %layout.root(), error = %history_err, "could not record failure");
                }
            }
            result.error = Some(UnitFailure {
                stage: stage.to_string(),
                message: err.to_string(),
            });
        }

        if result.skipped.is_some() {
            return Ok(result);
        }
        match IndexRecord::from_unit_dir(&layout, shard_id) {
            Ok(Some(mut record)) => {
                if let Some(failure) = &result.error {
                    if record.last_error_stage.is_none() {
                        record.last_error_stage = Some(failure.stage.clone());
                        record.last_error_message = Some(failure.message.clone());
                    }
                }
                result.record = Some(record);
            }
            Ok(None) => {}
            Err(AlmaError::Index(message)) => return Err(AlmaError::Index(message)),
            Err(err) => {
                if result.error.is_none() {
                    result.error = Some(UnitFailure {
                        stage: "index".to_string(),
                        message: err.to_string(),
                    });
                }
            }
        }
        Ok(result)
    }

    fn run_unit_stages(
        &self,
        layout: &UnitLayout,
        candidate: Option<&UnitCandidate>,
        stages: Stages,
        result: &mut UnitResult,
    ) -> Result<(), (&'static str, AlmaError)> {
        let at = |stage: &'static str| move |err: AlmaError| (stage, err);

        if let Some(candidate) = candidate {
            result.mous_uid = Some(candidate.identity.mous_uid.to_string());
            layout.ensure().map_err(at("discover"))?;
            self.manifests
                .initialize(layout, candidate)
                .map_err(at("discover"))?;
        }
        let Some(manifest) = self.manifests.load(layout).map_err(at("manifest"))? else {
            result.skipped = Some("no manifest".to_string());
            return Ok(());
        };
        result.mous_uid = Some(manifest.mous_uid.to_string());

        if stages.fetch {
            layout.ensure().map_err(at("download"))?;
            let fetcher = ArtifactFetcher::new(
                &self.client,
                &self.manifests,
                &self.config.fetch,
                &self.budget,
            );
            let report = fetcher
                .fetch_unit(layout, &manifest.mous_uid)
                .map_err(at("download"))?;
            result.fetch = Some(report);
        }
        if self.budget.exhausted() {
            return Ok(());
        }

        if stages.unpack {
            let controller = UnpackController::new(&self.manifests, &self.config.unpack);
            let report = controller.unpack_unit(layout).map_err(at("unpack"))?;
            result.unpack = Some(report);
        }
        if self.budget.exhausted() {
            return Ok(());
        }

        if stages.summarize {
            let outcome = SummaryBuilder::new(stages.write_markdown)
                .summarize_unit(&self.manifests, layout)
                .map_err(at("summarize"))?;
            result.summary_written = Some(outcome.written);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_with_zero_minutes_is_exhausted() {
        assert!(RunBudget::new(Some(0)).exhausted());
        assert!(!RunBudget::new(None).exhausted());
    }

    #[test]
    fn cancel_is_shared_between_clones() {
        let budget = RunBudget::unlimited();
        let clone = budget.clone();
        clone.cancel();
        assert!(budget.exhausted());
    }
}
