use anyhow::Result;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{report, ErrorSink, RunError};
use crate::router::Router;
use crate::task::{RecordError, Task};

/// What the dispatcher did with its input.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatchSummary {
    /// Tasks handed to a worker queue.
    pub dispatched: u64,
    /// Malformed records, reported and dropped.
    pub parse_failures: u64,
    /// Distinct hosts seen.
    pub hosts: usize,
    /// Stopped early because the run was cancelled.
    pub cancelled: bool,
}

/// Single owner of the router and of every worker queue sender.
pub struct Dispatcher {
    router: Router,
    queues: Vec<mpsc::Sender<Task>>,
    errors: ErrorSink,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        queues: Vec<mpsc::Sender<Task>>,
        errors: ErrorSink,
        cancel: CancellationToken,
    ) -> Result<Self> {
        Ok(Self {
            router: Router::new(queues.len())?,
            queues,
            errors,
            cancel,
        })
    }

    /// Route every task from `source` to its worker, blocking while a queue is
    /// full. Consumes the dispatcher, so every queue is closed on return.
    ///
    /// Must run on a blocking thread, not inside an async task.
    pub fn run<I>(mut self, source: I) -> DispatchSummary
    where
        I: IntoIterator<Item = Result<Task, RecordError>>,
    {
        let mut summary = DispatchSummary::default();

        for item in source {
            if self.cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }

            let task = match item {
                Ok(task) => task,
                Err(e) => {
                    summary.parse_failures += 1;
                    report(&self.errors, RunError::Parse(e));
                    continue;
                }
            };

            let worker = self.router.assign(&task.host);
            if self.queues[worker].blocking_send(task).is_err() {
                // Workers only drop their queue on cancellation.
                debug!(worker, "worker queue closed, stopping dispatch");
                summary.cancelled = true;
                break;
            }
            summary.dispatched += 1;
        }

        summary.hosts = self.router.hosts();
        info!(
            workers = self.router.workers(),
            dispatched = summary.dispatched,
            parse_failures = summary.parse_failures,
            hosts = summary.hosts,
            "input exhausted, closing worker queues"
        );

        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::error_stream;
    use crate::task::TaskSource;
    use std::collections::HashMap;

    const INPUT: &str = "hostname,start_time,end_time
host_000001,2017-01-01 08:59:22,2017-01-01 09:59:22
host_000001,2017-01-01 08:59:22,2017-01-01 09:59:22
host_000002,2017-01-01 08:59:22,2017-01-01 09:59:22
host_000001,2017-01-01 08:59:22,2017-01-01 09:59:22
host_000003,2017-01-01 08:59:22,2017-01-01 09:59:22
host_000004,2017-01-01 08:59:22,2017-01-01 09:59:22
host_000004,2017-01-01 08:59:22,2017-01-01 09:59:22
,2017-01-01 08:59:22,2017-01-01 09:59:22
host_000008,2017-01-01:22,2017-01-01 09:59:22
host_000008,2017-01-01:22,2017-01-01 09:59:22,wrong_line
host_000008,2017-01-01 08:59:22,2017-01-01 09:59";

    #[tokio::test]
    async fn test_routes_by_host_and_counts_parse_failures() {
        let mut receivers = Vec::new();
        let mut queues = Vec::new();
        for _ in 0..3 {
            // Large enough that dispatch never blocks in this test.
            let (tx, rx) = mpsc::channel(16);
            queues.push(tx);
            receivers.push(rx);
        }
        let (err_tx, mut err_rx) = error_stream();

        let dispatcher = Dispatcher::new(queues, err_tx, CancellationToken::new()).unwrap();
        let source = TaskSource::new(INPUT.as_bytes()).unwrap();
        let summary = tokio::task::spawn_blocking(move || dispatcher.run(source))
            .await
            .unwrap();

        assert_eq!(summary.dispatched, 7);
        assert_eq!(summary.parse_failures, 4);
        assert_eq!(summary.hosts, 4);
        assert!(!summary.cancelled);

        let mut parse_errors = 0;
        while let Some(err) = err_rx.recv().await {
            assert!(matches!(err, RunError::Parse(_)));
            parse_errors += 1;
        }
        assert_eq!(parse_errors, 4);

        let expected: [HashMap<&str, usize>; 3] = [
            HashMap::from([("host_000001", 3), ("host_000004", 2)]),
            HashMap::from([("host_000002", 1)]),
            HashMap::from([("host_000003", 1)]),
        ];

        for (rx, expected) in receivers.iter_mut().zip(expected) {
            let mut seen: HashMap<&str, usize> = HashMap::new();
            // Queues are closed: recv drains then returns None.
            while let Some(task) = rx.recv().await {
                let host = expected
                    .keys()
                    .find(|h| **h == task.host)
                    .copied()
                    .unwrap_or_else(|| panic!("unexpected host {}", task.host));
                *seen.entry(host).or_default() += 1;
            }
            assert_eq!(seen, expected);
        }
    }

    #[tokio::test]
    async fn test_stops_when_cancelled() {
        let (tx, mut rx) = mpsc::channel(16);
        let (err_tx, _err_rx) = error_stream();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let dispatcher = Dispatcher::new(vec![tx], err_tx, cancel).unwrap();
        let source = TaskSource::new(INPUT.as_bytes()).unwrap();
        let summary = tokio::task::spawn_blocking(move || dispatcher.run(source))
            .await
            .unwrap();

        assert!(summary.cancelled);
        assert_eq!(summary.dispatched, 0);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_stops_when_worker_gone() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let (err_tx, _err_rx) = error_stream();

        let dispatcher = Dispatcher::new(vec![tx], err_tx, CancellationToken::new()).unwrap();
        let source = TaskSource::new(INPUT.as_bytes()).unwrap();
        let summary = tokio::task::spawn_blocking(move || dispatcher.run(source))
            .await
            .unwrap();

        assert!(summary.cancelled);
        assert_eq!(summary.dispatched, 0);
    }

    #[test]
    fn test_needs_at_least_one_queue() {
        let (err_tx, _err_rx) = error_stream();
        assert!(Dispatcher::new(Vec::new(), err_tx, CancellationToken::new()).is_err());
    }
}
