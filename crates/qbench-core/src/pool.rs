//! Fixed-size worker pool.
//!
//! Every worker owns one bounded input queue and a clone of the shared result
//! sender. Closing a queue (dropping its sender) is the only stop signal a
//! worker gets besides cancellation. The result channel closes by itself once
//! the last worker has exited and dropped its sender, which is how the
//! aggregator knows no more results will arrive.
//!
//! Once an operation has returned, its result is always published, cancelled
//! or not. Tasks still queued when a worker is cancelled are drained without
//! running and counted in [`WorkerExit::skipped`].

use std::sync::Arc;

use anyhow::{bail, Result};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::operation::QueryOperation;
use crate::task::Task;

/// Outcome of one executed task.
#[derive(Debug)]
pub struct QueryResult {
    pub host: String,
    /// Index of the worker that executed the task.
    pub worker: usize,
    /// Wall-clock time spent in the operation, in milliseconds.
    pub duration_ms: f64,
    pub error: Option<anyhow::Error>,
}

impl QueryResult {
    pub fn is_err(&self) -> bool {
        self.error.is_some()
    }
}

/// How a worker finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    pub worker: usize,
    pub processed: u64,
    /// Queued tasks dropped unexecuted after cancellation.
    pub skipped: u64,
    pub cancelled: bool,
}

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("worker {worker} panicked")]
    Panicked { worker: usize },

    #[error("worker {worker} was aborted")]
    Aborted { worker: usize },
}

/// A started pool: the per-worker queues, the shared result stream and the
/// worker handles.
pub struct WorkerPool {
    queues: Vec<mpsc::Sender<Task>>,
    results: mpsc::Receiver<QueryResult>,
    workers: Workers,
}

impl WorkerPool {
    /// Spawn `workers` tokio tasks, each draining its own queue of
    /// `queue_depth` tasks through `op`.
    pub fn start(
        workers: usize,
        queue_depth: usize,
        op: Arc<dyn QueryOperation>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        if workers == 0 {
            bail!("worker count must be > 0");
        }
        if queue_depth == 0 {
            bail!("queue depth must be > 0");
        }

        let (result_tx, results) = mpsc::channel(workers.saturating_mul(queue_depth));
        let mut queues = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);

        for idx in 0..workers {
            let (tx, rx) = mpsc::channel(queue_depth);
            queues.push(tx);
            handles.push(tokio::spawn(run_worker(
                idx,
                rx,
                result_tx.clone(),
                Arc::clone(&op),
                cancel.clone(),
            )));
        }

        // Only the workers hold result senders from here on.
        drop(result_tx);

        Ok(Self {
            queues,
            results,
            workers: Workers { handles },
        })
    }

    pub fn into_parts(self) -> (Vec<mpsc::Sender<Task>>, mpsc::Receiver<QueryResult>, Workers) {
        (self.queues, self.results, self.workers)
    }
}

/// Join handles of a running pool.
pub struct Workers {
    handles: Vec<JoinHandle<WorkerExit>>,
}

impl Workers {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every worker to exit, even after one has failed. Returns the
    /// first failure, if any.
    pub async fn join(self) -> Result<Vec<WorkerExit>, PoolError> {
        let mut exits = Vec::with_capacity(self.handles.len());
        let mut first_err = None;

        for (worker, handle) in self.handles.into_iter().enumerate() {
            match handle.await {
                Ok(exit) => exits.push(exit),
                Err(e) => {
                    let err = if e.is_panic() {
                        PoolError::Panicked { worker }
                    } else {
                        PoolError::Aborted { worker }
                    };
                    warn!(%err, "worker failed");
                    first_err.get_or_insert(err);
                }
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(exits),
        }
    }
}

async fn run_worker(
    worker: usize,
    mut queue: mpsc::Receiver<Task>,
    results: mpsc::Sender<QueryResult>,
    op: Arc<dyn QueryOperation>,
    cancel: CancellationToken,
) -> WorkerExit {
    let mut processed = 0u64;

    let cancelled = loop {
        let task = tokio::select! {
            biased;
            _ = cancel.cancelled() => break true,
            next = queue.recv() => match next {
                Some(task) => task,
                None => break false,
            },
        };

        let start = Instant::now();
        let outcome = op.execute(&task).await;
        let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
        processed += 1;

        let result = QueryResult {
            host: task.host,
            worker,
            duration_ms,
            error: outcome.err(),
        };
        if result.is_err() {
            trace!(worker, host = %result.host, "operation failed");
        }

        // Sent even when cancelled; the aggregator drains until every worker is gone.
        if results.send(result).await.is_err() {
            // Nobody is reading results anymore.
            break false;
        }
    };

    let mut skipped = 0u64;
    if cancelled {
        queue.close();
        while queue.recv().await.is_some() {
            skipped += 1;
        }
    }

    debug!(worker, processed, skipped, cancelled, "worker exited");

    WorkerExit {
        worker,
        processed,
        skipped,
        cancelled,
    }
}
