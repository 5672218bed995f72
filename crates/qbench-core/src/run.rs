use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::aggregate::aggregate;
use crate::config::Config;
use crate::dispatch::{DispatchSummary, Dispatcher};
use crate::error::ErrorSink;
use crate::operation::QueryOperation;
use crate::pool::WorkerPool;
use crate::stats::{Report, Stats};
use crate::task::{RecordError, Task};

/// Pool sizing for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSettings {
    pub workers: usize,
    pub queue_depth: usize,
}

impl From<&Config> for RunSettings {
    fn from(config: &Config) -> Self {
        Self {
            workers: config.worker_count,
            queue_depth: config.queue_depth,
        }
    }
}

/// Everything a finished run produced.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub stats: Stats,
    pub parse_failures: u64,
    /// Tasks a worker executed. Always `stats.total()`.
    pub dispatched: u64,
    /// Tasks queued to a worker but dropped unexecuted on cancellation.
    pub skipped: u64,
    pub hosts: usize,
    pub cancelled: bool,
    #[serde(rename = "elapsed_ms", serialize_with = "as_millis")]
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn report(&self) -> Report<'_> {
        Report::new(self.parse_failures, &self.stats)
    }
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u128(d.as_millis())
}

/// Replay `source` through a fresh worker pool and aggregate the results.
///
/// Malformed records and failed operations go to `errors`. Returns an error
/// only for setup failures or a crashed pipeline stage; a cancelled run still
/// returns the statistics gathered so far.
pub async fn run_benchmark<I>(
    settings: RunSettings,
    source: I,
    op: Arc<dyn QueryOperation>,
    errors: ErrorSink,
    cancel: CancellationToken,
) -> Result<RunSummary>
where
    I: IntoIterator<Item = Result<Task, RecordError>> + Send + 'static,
{
    let started = Instant::now();

    let pool = WorkerPool::start(
        settings.workers,
        settings.queue_depth,
        Arc::clone(&op),
        cancel.clone(),
    )?;
    let (queues, results, workers) = pool.into_parts();
    let dispatcher = Dispatcher::new(queues, errors.clone(), cancel)?;

    info!(
        workers = settings.workers,
        queue_depth = settings.queue_depth,
        operation = op.name(),
        "workers started"
    );

    let aggregator = tokio::spawn(aggregate(results, errors));

    let dispatch: DispatchSummary = tokio::task::spawn_blocking(move || dispatcher.run(source))
        .await
        .context("dispatcher crashed")?;

    // Finish draining results and errors before surfacing a worker failure.
    let joined = workers.join().await;
    let stats = aggregator.await.context("aggregator crashed")?;
    let exits = joined?;

    let cancelled = dispatch.cancelled || exits.iter().any(|e| e.cancelled);
    let skipped: u64 = exits.iter().map(|e| e.skipped).sum();
    let elapsed = started.elapsed();

    info!(
        executed = stats.exec_count,
        failed = stats.failed_count,
        parse_failures = dispatch.parse_failures,
        skipped,
        cancelled,
        elapsed_ms = elapsed.as_millis() as u64,
        "run finished"
    );

    Ok(RunSummary {
        stats,
        parse_failures: dispatch.parse_failures,
        dispatched: dispatch.dispatched - skipped,
        skipped,
        hosts: dispatch.hosts,
        cancelled,
        elapsed,
    })
}
