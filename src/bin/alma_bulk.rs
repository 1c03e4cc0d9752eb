use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use alma_bulk_manager::app::{App, DEFAULT_SHARD_SIZE, ScanOptions, SummarizeOptions};
use alma_bulk_manager::archive::AlmaHttpClient;
use alma_bulk_manager::config::{ConfigLoader, ConfigOverrides, DateField, ResolvedConfig};
use alma_bulk_manager::error::AlmaError;
use alma_bulk_manager::merge::MergeOptions;
use alma_bulk_manager::output::{JsonOutput, OutputMode, TextOutput};
use alma_bulk_manager::status::DEFAULT_TOP_ERRORS;

#[derive(Parser)]
#[command(name = "alma-bulk")]
#[command(about = "Restartable bulk retrieval and indexing of ALMA archive deliverables")]
#[command(version, author)]
struct Cli {
    /// Print machine-readable JSON instead of text summaries.
    #[arg(long, global = true)]
    non_interactive: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Query the archive and write unit candidates as JSON lines")]
    Discover(DiscoverArgs),
    #[command(about = "Download deliverables for discovered or already known units")]
    Download(DownloadArgs),
    #[command(about = "Extract downloaded archives into each unit directory")]
    Unpack(CommonArgs),
    #[command(about = "Write analysis summaries for every unit with a manifest")]
    Summarize(SummarizeArgs),
    #[command(about = "Rebuild index rows from the documents on disk")]
    Scan(ScanArgs),
    #[command(about = "Split a discovery file into shard files")]
    Plan(PlanArgs),
    #[command(about = "Run the full pipeline for one shard file")]
    RunShard(RunShardArgs),
    #[command(about = "Merge shard tables and summaries into the central index")]
    MergeIndex(MergeIndexArgs),
    #[command(about = "Report progress and failures from the central index")]
    Status(StatusArgs),
}

#[derive(Args, Clone, Default)]
struct CommonArgs {
    #[arg(long)]
    config: Option<String>,
    #[arg(long)]
    dest: Option<String>,
    #[arg(long)]
    max_runtime_min: Option<u64>,
    #[arg(long)]
    unit_workers: Option<usize>,
}

#[derive(Args)]
struct DiscoverArgs {
    #[command(flatten)]
    common: CommonArgs,
    #[arg(long)]
    start: String,
    #[arg(long)]
    end: String,
    #[arg(long, value_parser = parse_date_field)]
    date_field: Option<DateField>,
    #[arg(long)]
    exclude_tp: bool,
    #[arg(long)]
    exclude_7m: bool,
    /// `include:3,6` or `exclude:9,10`.
    #[arg(long)]
    bands: Option<String>,
    #[arg(long)]
    project_code_include: Option<String>,
    #[arg(long)]
    project_code_exclude: Option<String>,
    #[arg(long)]
    out: PathBuf,
}

#[derive(Args)]
struct DownloadArgs {
    #[command(flatten)]
    common: CommonArgs,
    /// Discovery JSON lines; defaults to the manifests below the destination.
    #[arg(long)]
    input: Option<PathBuf>,
    /// Selection such as `default,+raw,-weblog` or `all-nonimage`.
    #[arg(long)]
    artifacts: Option<String>,
    #[arg(long)]
    max_workers: Option<usize>,
}

#[derive(Args)]
struct SummarizeArgs {
    #[command(flatten)]
    common: CommonArgs,
    #[arg(long)]
    write_markdown: bool,
    #[arg(long)]
    shard_id: Option<String>,
    #[arg(long)]
    index_db: Option<PathBuf>,
}

#[derive(Args)]
struct ScanArgs {
    #[command(flatten)]
    common: CommonArgs,
    #[arg(long)]
    fix_layout: bool,
    #[arg(long)]
    rebuild_db: bool,
    #[arg(long)]
    index_db: Option<PathBuf>,
}

#[derive(Args)]
struct PlanArgs {
    #[command(flatten)]
    common: CommonArgs,
    #[arg(long)]
    input: PathBuf,
    #[arg(long)]
    out: PathBuf,
    #[arg(long, default_value_t = DEFAULT_SHARD_SIZE)]
    shard_size: usize,
}

#[derive(Args)]
struct RunShardArgs {
    #[command(flatten)]
    common: CommonArgs,
    #[arg(long)]
    shard: PathBuf,
    #[arg(long)]
    download_missing: bool,
    #[arg(long)]
    max_workers: Option<usize>,
}

#[derive(Args)]
struct MergeIndexArgs {
    #[command(flatten)]
    common: CommonArgs,
    #[arg(long)]
    shards: PathBuf,
    #[arg(long)]
    vacuum: bool,
    #[arg(long)]
    integrity_check: bool,
}

#[derive(Args)]
struct StatusArgs {
    #[command(flatten)]
    common: CommonArgs,
    #[arg(long, default_value_t = DEFAULT_TOP_ERRORS)]
    top_n_errors: usize,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(alma) = report.downcast_ref::<AlmaError>() {
            return ExitCode::from(map_exit_code(alma));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &AlmaError) -> u8 {
    match error {
        AlmaError::InvalidUid(_)
        | AlmaError::InvalidKind(_)
        | AlmaError::InvalidSelection(_)
        | AlmaError::InvalidDate(_)
        | AlmaError::MissingDestination
        | AlmaError::ConfigRead(_)
        | AlmaError::ConfigParse(_) => 2,
        AlmaError::ArchiveHttp(_)
        | AlmaError::ArchiveStatus { .. }
        | AlmaError::TransientTransfer { .. } => 3,
        AlmaError::DocumentCorruption { .. }
        | AlmaError::PolicyViolation { .. }
        | AlmaError::AmbiguousProvenance { .. } => 4,
        _ => 1,
    }
}

fn parse_date_field(value: &str) -> Result<DateField, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "release" => Ok(DateField::Release),
        "observation" | "obs" => Ok(DateField::Observation),
        other => Err(format!("unknown date field `{other}` (release|observation)")),
    }
}

fn overrides(common: &CommonArgs) -> ConfigOverrides {
    ConfigOverrides {
        dest: common.dest.clone(),
        max_runtime_min: common.max_runtime_min,
        unit_workers: common.unit_workers,
        ..ConfigOverrides::default()
    }
}

fn init_tracing(config: &ResolvedConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load(common: &CommonArgs, overrides: ConfigOverrides) -> miette::Result<App<AlmaHttpClient>> {
    let config = ConfigLoader::resolve(common.config.as_deref(), &overrides)?;
    init_tracing(&config);
    let client = AlmaHttpClient::new(&config.archive)?;
    Ok(App::new(config, client))
}

fn run() -> miette::Result<()> {
    let cli = Cli::parse();
    let mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    match cli.command {
        Commands::Discover(args) => {
            let overrides = ConfigOverrides {
                date_field: args.date_field,
                exclude_tp: args.exclude_tp,
                exclude_7m: args.exclude_7m,
                bands: args.bands.clone(),
                project_codes_include: args.project_code_include.clone(),
                project_codes_exclude: args.project_code_exclude.clone(),
                ..overrides(&args.common)
            };
            let app = load(&args.common, overrides)?;
            match mode {
                OutputMode::NonInteractive => {
                    let result = app.discover(&args.start, &args.end, &args.out, &JsonOutput)?;
                    JsonOutput::print_discover(&result).into_diagnostic()?;
                }
                OutputMode::Interactive => {
                    let result = app.discover(&args.start, &args.end, &args.out, &TextOutput)?;
                    TextOutput::print_discover(&result);
                }
            }
        }
        Commands::Download(args) => {
            let overrides = ConfigOverrides {
                artifacts: args.artifacts.clone(),
                max_workers: args.max_workers,
                ..overrides(&args.common)
            };
            let app = load(&args.common, overrides)?;
            let result = match mode {
                OutputMode::NonInteractive => app.download(args.input.as_deref(), &JsonOutput)?,
                OutputMode::Interactive => app.download(args.input.as_deref(), &TextOutput)?,
            };
            print_stage(mode, &result)?;
        }
        Commands::Unpack(common) => {
            let app = load(&common, overrides(&common))?;
            let result = match mode {
                OutputMode::NonInteractive => app.unpack(&JsonOutput)?,
                OutputMode::Interactive => app.unpack(&TextOutput)?,
            };
            print_stage(mode, &result)?;
        }
        Commands::Summarize(args) => {
            let app = load(&args.common, overrides(&args.common))?;
            let options = SummarizeOptions {
                write_markdown: args.write_markdown,
                shard_id: args.shard_id,
                index_db: args.index_db,
            };
            let result = match mode {
                OutputMode::NonInteractive => app.summarize(&options, &JsonOutput)?,
                OutputMode::Interactive => app.summarize(&options, &TextOutput)?,
            };
            print_stage(mode, &result)?;
        }
        Commands::Scan(args) => {
            let app = load(&args.common, overrides(&args.common))?;
            let options = ScanOptions {
                fix_layout: args.fix_layout,
                rebuild_db: args.rebuild_db,
                index_db: args.index_db,
            };
            match mode {
                OutputMode::NonInteractive => {
                    let result = app.scan(&options, &JsonOutput)?;
                    JsonOutput::print_scan(&result).into_diagnostic()?;
                }
                OutputMode::Interactive => {
                    let result = app.scan(&options, &TextOutput)?;
                    TextOutput::print_scan(&result);
                }
            }
        }
        Commands::Plan(args) => {
            let app = load(&args.common, overrides(&args.common))?;
            let result = app.plan(&args.input, &args.out, args.shard_size)?;
            match mode {
                OutputMode::NonInteractive => JsonOutput::print_plan(&result).into_diagnostic()?,
                OutputMode::Interactive => TextOutput::print_plan(&result),
            }
        }
        Commands::RunShard(args) => {
            let overrides = ConfigOverrides {
                max_workers: args.max_workers,
                ..overrides(&args.common)
            };
            let app = load(&args.common, overrides)?;
            let result = match mode {
                OutputMode::NonInteractive => {
                    app.run_shard(&args.shard, args.download_missing, &JsonOutput)?
                }
                OutputMode::Interactive => {
                    app.run_shard(&args.shard, args.download_missing, &TextOutput)?
                }
            };
            print_stage(mode, &result)?;
        }
        Commands::MergeIndex(args) => {
            let app = load(&args.common, overrides(&args.common))?;
            let options = MergeOptions {
                vacuum: args.vacuum,
                integrity_check: args.integrity_check,
            };
            match mode {
                OutputMode::NonInteractive => {
                    let result = app.merge_index(&args.shards, options, &JsonOutput)?;
                    JsonOutput::print_merge(&result).into_diagnostic()?;
                }
                OutputMode::Interactive => {
                    let result = app.merge_index(&args.shards, options, &TextOutput)?;
                    TextOutput::print_merge(&result);
                }
            }
        }
        Commands::Status(args) => {
            let app = load(&args.common, overrides(&args.common))?;
            let result = app.status(args.top_n_errors)?;
            match mode {
                OutputMode::NonInteractive => JsonOutput::print_status(&result).into_diagnostic()?,
                OutputMode::Interactive => TextOutput::print_status(&result),
            }
        }
    }
    Ok(())
}

fn print_stage(
    mode: OutputMode,
    result: &alma_bulk_manager::app::StageResult,
) -> miette::Result<()> {
    match mode {
        OutputMode::NonInteractive => JsonOutput::print_stage(result).into_diagnostic(),
        OutputMode::Interactive => {
            TextOutput::print_stage(result);
            Ok(())
        }
    }
}
