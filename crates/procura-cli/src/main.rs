use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use procura_core::DataLayout;
use procura_sync::{parquet_columns, Pipeline, PipelineConfig};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

const LOG_TARGETS: [&str; 5] = [
    "procura",
    "procura_core",
    "procura_storage",
    "procura_adapters",
    "procura_sync",
];

#[derive(Debug, Parser)]
#[command(name = "procura")]
#[command(about = "Procurement archive ingestion pipeline", version)]
struct Cli {
    /// Config file; falls back to $PROCURA_CONFIG, then ./config.yaml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Crawl all sources; prints changed ids as a JSON array.
    Download {
        #[arg(long)]
        window_days: Option<i64>,
    },
    /// Normalize the given ids, or every extracted id when none are given.
    Normalize {
        ids: Vec<String>,
        /// Read a JSON array of ids from stdin.
        #[arg(long, conflicts_with = "ids")]
        stdin: bool,
    },
    /// Rebuild final per-table artifacts from fragments.
    Consolidate,
    /// Download, normalize and consolidate in one go.
    Run {
        #[arg(long)]
        window_days: Option<i64>,
    },
    /// List the columns of every Parquet file in a directory.
    Columns {
        dir: PathBuf,
        #[arg(long)]
        recursive: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run { window_days: None }) {
        Commands::Columns { dir, recursive } => {
            let _guard = init_tracing(cli.verbose, cli.log_format, None)?;
            print_columns(&dir, recursive)?;
        }
        Commands::Download { window_days } => {
            let (pipeline, _guard) = open_pipeline(cli.config, cli.verbose, cli.log_format).await?;
            let window = window_days.unwrap_or(pipeline.config().window_days);
            let summary = pipeline.download(window).await?;
            println!("{}", serde_json::to_string(&summary.changed_ids)?);
            fail_on_source_errors(summary.failed_sources.len())?;
        }
        Commands::Normalize { ids, stdin } => {
            let (pipeline, _guard) = open_pipeline(cli.config, cli.verbose, cli.log_format).await?;
            let ids = if stdin {
                Some(read_ids_from_stdin()?)
            } else if ids.is_empty() {
                None
            } else {
                Some(ids)
            };
            let summary = pipeline.normalize(ids.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Consolidate => {
            let (pipeline, _guard) = open_pipeline(cli.config, cli.verbose, cli.log_format).await?;
            let reports = pipeline.consolidate().await?;
            println!("{}", serde_json::to_string_pretty(&reports)?);
        }
        Commands::Run { window_days } => {
            let (pipeline, _guard) = open_pipeline(cli.config, cli.verbose, cli.log_format).await?;
            let progress = |percent: u8, message: &str| info!(percent, "{message}");
            let summary = pipeline.run_flow(window_days, &progress).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            fail_on_source_errors(summary.download.failed_sources.len())?;
        }
    }

    Ok(())
}

/// Load config, start logging under its root, and open the pipeline.
async fn open_pipeline(
    config: Option<PathBuf>,
    verbose: u8,
    format: LogFormat,
) -> Result<(Pipeline, Option<WorkerGuard>)> {
    let config_path = config.unwrap_or_else(PipelineConfig::path_from_env);
    let config = PipelineConfig::load(&config_path)?;
    let guard = init_tracing(verbose, format, Some(&DataLayout::new(&config.root_dir).logs_dir()))?;
    info!(config = %config_path.display(), "configuration loaded");
    Ok((Pipeline::new(config).await?, guard))
}

fn fail_on_source_errors(failed: usize) -> Result<()> {
    if failed > 0 {
        bail!("{failed} source(s) failed to crawl; see log for details");
    }
    Ok(())
}

fn read_ids_from_stdin() -> Result<Vec<String>> {
    let mut raw = String::new();
    std::io::stdin()
        .read_to_string(&mut raw)
        .context("reading ids from stdin")?;
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(&raw).context("stdin must be a JSON array of ids")
}

fn print_columns(dir: &Path, recursive: bool) -> Result<()> {
    let listing = parquet_columns(dir, recursive)
        .with_context(|| format!("listing parquet files in {}", dir.display()))?;
    if listing.is_empty() {
        println!("no parquet files in {}", dir.display());
    }
    for (path, columns) in listing {
        match columns {
            Ok(columns) => println!("{}: {}", path.display(), columns.join(", ")),
            Err(err) => println!("{}: unreadable ({err})", path.display()),
        }
    }
    Ok(())
}

fn env_filter(verbose: u8) -> EnvFilter {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(
            LOG_TARGETS
                .iter()
                .map(|target| format!("{target}={level}"))
                .collect::<Vec<_>>()
                .join(","),
        )
    })
}

/// Console logs go to stderr so stdout stays machine-readable. With a log
/// directory, a daily rolling file is written as well.
fn init_tracing(verbose: u8, format: LogFormat, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    let console: Box<dyn Layer<Registry> + Send + Sync> = match format {
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_filter(env_filter(verbose))
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_filter(env_filter(verbose))
            .boxed(),
    };
    layers.push(console);

    let mut guard = None;
    if let Some(dir) = log_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating log directory {}", dir.display()))?;
        let appender = tracing_appender::rolling::daily(dir, "procura.log");
        let (writer, worker_guard) = tracing_appender::non_blocking(appender);
        guard = Some(worker_guard);
        layers.push(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(env_filter(verbose))
                .boxed(),
        );
    }

    tracing_subscriber::registry().with(layers).init();
    Ok(guard)
}
