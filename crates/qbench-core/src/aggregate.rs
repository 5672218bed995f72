//! Single-pass reduction of the result stream into [`Stats`].

use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{report, ErrorSink, RunError};
use crate::percentile::percentile;
use crate::pool::QueryResult;
use crate::stats::Stats;

/// Running accumulators for one run.
///
/// Only order-independent state is kept (counts, sum, min, max and the raw
/// samples), so results may arrive in any order. The sample buffer grows with
/// every success; exact percentiles need all of it.
#[derive(Debug)]
pub struct Aggregator {
    exec_count: u64,
    failed_count: u64,
    sum: f64,
    min: f64,
    max: f64,
    samples: Vec<f64>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self {
            exec_count: 0,
            failed_count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            samples: Vec::with_capacity(4096),
        }
    }

    /// Fold one result in. A failed result is counted and its error handed
    /// back for reporting; its duration is ignored.
    pub fn record(&mut self, result: QueryResult) -> Option<RunError> {
        if let Some(source) = result.error {
            self.failed_count += 1;
            return Some(RunError::Query {
                host: result.host,
                worker: result.worker,
                source,
            });
        }

        let d = result.duration_ms;
        self.exec_count += 1;
        self.sum += d;
        self.min = self.min.min(d);
        self.max = self.max.max(d);
        self.samples.push(d);
        None
    }

    pub fn exec_count(&self) -> u64 {
        self.exec_count
    }

    pub fn failed_count(&self) -> u64 {
        self.failed_count
    }

    /// Sort the samples and compute the final summary.
    pub fn finish(mut self) -> Stats {
        self.samples.sort_unstable_by(|a, b| a.total_cmp(b));

        Stats {
            exec_count: self.exec_count,
            failed_count: self.failed_count,
            sum: self.sum,
            min: self.min,
            max: self.max,
            // 0 / 0 is NaN for an empty run.
            mean: self.sum / self.exec_count as f64,
            median: percentile(&self.samples, 50.0),
            p95: percentile(&self.samples, 95.0),
            p99: percentile(&self.samples, 99.0),
        }
    }
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain `results` until every sender is gone, reporting failures to `errors`.
pub async fn aggregate(mut results: mpsc::Receiver<QueryResult>, errors: ErrorSink) -> Stats {
    let mut agg = Aggregator::new();

    while let Some(result) = results.recv().await {
        if let Some(err) = agg.record(result) {
            report(&errors, err);
        }
    }

    debug!(
        executed = agg.exec_count(),
        failed = agg.failed_count(),
        "result stream closed"
    );
    agg.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::error_stream;
    use anyhow::anyhow;

    fn ok(duration_ms: f64) -> QueryResult {
        QueryResult {
            host: "test_host".to_string(),
            worker: 0,
            duration_ms,
            error: None,
        }
    }

    fn failed() -> QueryResult {
        QueryResult {
            host: "test_host".to_string(),
            worker: 1,
            duration_ms: 0.0,
            error: Some(anyhow!("test error")),
        }
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[tokio::test]
    async fn test_aggregate_reference_run() {
        let (tx, rx) = mpsc::channel(8);
        let (err_tx, mut err_rx) = error_stream();

        let handle = tokio::spawn(aggregate(rx, err_tx));

        for r in [ok(10.0), ok(20.0), ok(30.0), failed(), failed()] {
            tx.send(r).await.unwrap();
        }
        drop(tx);

        let stats = handle.await.unwrap();

        let mut reported = 0;
        while let Some(err) = err_rx.recv().await {
            assert!(matches!(err, RunError::Query { worker: 1, .. }));
            reported += 1;
        }
        assert_eq!(reported, 2);

        assert_eq!(stats.exec_count, 3);
        assert_eq!(stats.failed_count, 2);
        assert!(approx(stats.sum, 60.0));
        assert!(approx(stats.min, 10.0));
        assert!(approx(stats.max, 30.0));
        assert!(approx(stats.mean, 20.0));
        assert!(approx(stats.median, 20.0));
        assert!(approx(stats.p95, 29.0));
        assert!(approx(stats.p99, 29.8));
    }

    #[test]
    fn test_order_does_not_matter() {
        let durations = [7.5, 1.0, 99.0, 3.25, 42.0, 18.0];

        let mut forward = Aggregator::new();
        for d in durations {
            forward.record(ok(d));
        }
        let mut backward = Aggregator::new();
        for d in durations.iter().rev() {
            backward.record(ok(*d));
        }

        let a = forward.finish();
        let b = backward.finish();
        assert_eq!(a, b);
        assert!(a.min <= a.median && a.median <= a.p95 && a.p95 <= a.p99 && a.p99 <= a.max);
    }

    #[test]
    fn test_empty_run_keeps_sentinels() {
        let stats = Aggregator::new().finish();

        assert_eq!(stats.exec_count, 0);
        assert_eq!(stats.failed_count, 0);
        assert_eq!(stats.sum, 0.0);
        assert_eq!(stats.min, f64::INFINITY);
        assert_eq!(stats.max, f64::NEG_INFINITY);
        assert!(stats.mean.is_nan());
        assert!(stats.median.is_nan());
        assert!(stats.p95.is_nan());
        assert!(stats.p99.is_nan());
    }

    #[test]
    fn test_single_success_has_no_percentiles() {
        let mut agg = Aggregator::new();
        agg.record(ok(5.0));
        let stats = agg.finish();

        assert_eq!(stats.exec_count, 1);
        assert_eq!(stats.min, 5.0);
        assert_eq!(stats.max, 5.0);
        assert_eq!(stats.mean, 5.0);
        assert!(stats.median.is_nan());
    }

    #[test]
    fn test_failures_do_not_touch_durations() {
        let mut agg = Aggregator::new();
        assert!(agg.record(failed()).is_some());
        assert!(agg.record(ok(12.0)).is_none());

        assert_eq!(agg.failed_count(), 1);
        assert_eq!(agg.exec_count(), 1);

        let stats = agg.finish();
        assert_eq!(stats.sum, 12.0);
        assert_eq!(stats.min, 12.0);
    }

    #[tokio::test]
    async fn test_errors_survive_closed_sink() {
        let (tx, rx) = mpsc::channel(2);
        let (err_tx, err_rx) = error_stream();
        drop(err_rx);

        tx.send(failed()).await.unwrap();
        drop(tx);

        let stats = aggregate(rx, err_tx).await;
        assert_eq!(stats.failed_count, 1);
    }
}
