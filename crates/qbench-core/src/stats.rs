use std::fmt;

use serde::{Deserialize, Serialize};

/// Summary of one benchmark run, produced once the result stream is drained.
///
/// With no successful executions `mean` is NaN and `min`/`max` keep their
/// starting values of +inf and -inf.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub exec_count: u64,
    pub failed_count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub median: f64,
    pub p95: f64,
    pub p99: f64,
}

impl Stats {
    /// Tasks that reached a worker, successful or not.
    pub fn total(&self) -> u64 {
        self.exec_count + self.failed_count
    }
}

/// Text rendering of a run: counters first, then durations in milliseconds.
#[derive(Debug, Clone, Copy)]
pub struct Report<'a> {
    pub parse_failures: u64,
    pub stats: &'a Stats,
}

impl<'a> Report<'a> {
    pub fn new(parse_failures: u64, stats: &'a Stats) -> Self {
        Self {
            parse_failures,
            stats,
        }
    }

    pub fn total_count(&self) -> u64 {
        self.stats.total() + self.parse_failures
    }
}

impl fmt::Display for Report<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.stats;
        writeln!(f, "#summary:")?;
        writeln!(f, "total_count: \t{}", self.total_count())?;
        writeln!(f, "exec_count:\t{}", s.exec_count)?;
        writeln!(f, "sql_failure:\t{}", s.failed_count)?;
        writeln!(f, "parse_failure:\t{}", self.parse_failures)?;
        writeln!(f, "#durations:")?;
        writeln!(f, "total:\t{:.2}ms", s.sum)?;
        writeln!(f, "min:\t{:.2}ms", s.min)?;
        writeln!(f, "max:\t{:.2}ms", s.max)?;
        writeln!(f, "mean:\t{:.2}ms", s.mean)?;
        writeln!(f, "median:\t{:.2}ms", s.median)?;
        writeln!(f, "95th:\t{:.2}ms", s.p95)?;
        writeln!(f, "99th:\t{:.2}ms", s.p99)
    }
}
