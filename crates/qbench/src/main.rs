use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use qbench_core::{
    error_stream, open_input, run_benchmark, Config, MockOperation, Overrides, PostgresOperation,
    QueryOperation, RunError, RunSettings, RunSummary, TaskSource,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "qbench")]
#[command(about = "Replay host/time-range queries against Postgres and report latency statistics")]
struct Args {
    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// CSV input path for query parameters (stdin when omitted)
    #[arg(long)]
    file: Option<PathBuf>,

    /// Worker count
    #[arg(long)]
    workers: Option<usize>,

    /// Tasks buffered per worker before dispatch blocks
    #[arg(long)]
    queue_depth: Option<usize>,

    /// Database host
    #[arg(long)]
    host: Option<String>,

    /// Database port
    #[arg(long)]
    port: Option<u16>,

    /// Database user
    #[arg(long)]
    user: Option<String>,

    /// Database password
    #[arg(long)]
    password: Option<String>,

    /// Database name
    #[arg(long)]
    db: Option<String>,

    /// Database SSL mode
    #[arg(long)]
    ssl: Option<bool>,

    /// Operation to time
    #[arg(long, value_enum, default_value_t = Mode::Postgres)]
    mode: Mode,

    /// Simulated latency per call in mock mode
    #[arg(long, default_value_t = 5)]
    mock_delay_ms: u64,

    /// Fraction of mock calls that fail (0.0 - 1.0)
    #[arg(long, default_value_t = 0.0)]
    mock_failure_rate: f64,

    /// Seed deciding which mock calls fail
    #[arg(long, default_value_t = 42)]
    mock_seed: u64,

    /// Also write the summary as JSON to this path
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Postgres,
    Mock,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            worker_count: self.workers,
            queue_depth: self.queue_depth,
            file: self.file.clone(),
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            password: self.password.clone(),
            db: self.db.clone(),
            ssl: self.ssl,
        }
    }
}

#[derive(Debug, Serialize)]
struct RunRecord<'a> {
    timestamp: String,
    mode: &'static str,
    worker_count: usize,
    #[serde(flatten)]
    summary: &'a RunSummary,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries the report.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config = Config::load(args.config.as_deref(), &args.overrides()).with_context(|| {
        match &args.config {
            Some(path) => format!("invalid config {:?}", path),
            None => "invalid configuration".to_string(),
        }
    })?;

    let input = open_input(config.file.as_deref())?;
    let source = TaskSource::new(input).context("invalid csv input")?;

    let (op, pg): (Arc<dyn QueryOperation>, Option<Arc<PostgresOperation>>) = match args.mode {
        Mode::Mock => {
            let mock: Arc<dyn QueryOperation> = Arc::new(
                MockOperation::new(args.mock_delay_ms)
                    .with_failures(args.mock_failure_rate, args.mock_seed),
            );
            (mock, None)
        }
        Mode::Postgres => {
            let pg =
                Arc::new(PostgresOperation::connect(&config.postgres, config.worker_count).await?);
            let op: Arc<dyn QueryOperation> = pg.clone();
            (op, Some(pg))
        }
    };

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_ctrl_c(cancel.clone()));

    let (errors, mut error_rx) = error_stream();
    let error_logger = tokio::spawn(async move {
        while let Some(err) = error_rx.recv().await {
            log_run_error(&err);
        }
    });

    let summary = run_benchmark(
        RunSettings::from(&config),
        source,
        Arc::clone(&op),
        errors,
        cancel,
    )
    .await?;

    // Every error sender is gone once the run returns.
    error_logger.await.ok();

    if let Some(pg) = pg {
        pg.close().await;
    }

    if summary.cancelled {
        warn!(
            skipped = summary.skipped,
            "run was cancelled, statistics cover completed queries only"
        );
    }

    if let Some(path) = &args.output {
        let record = RunRecord {
            timestamp: chrono::Utc::now().to_rfc3339(),
            mode: op.name(),
            worker_count: config.worker_count,
            summary: &summary,
        };
        write_record(path, &record)?;
        info!("Results written to {}", path.display());
    }

    print!("{}", summary.report());

    Ok(())
}

async fn cancel_on_ctrl_c(cancel: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        warn!("interrupt received, stopping workers");
        cancel.cancel();
    }
}

fn log_run_error(err: &RunError) {
    match err {
        RunError::Parse(e) => warn!(line = e.line(), "{}", e),
        RunError::Query { host, worker, .. } => warn!(%host, worker, "{}", err),
    }
}

fn write_record(path: &Path, record: &RunRecord<'_>) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("could not create {}", dir.display()))?;
    }
    let json = serde_json::to_string_pretty(record)?;
    std::fs::write(path, json).with_context(|| format!("could not write {}", path.display()))?;
    Ok(())
}
