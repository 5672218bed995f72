use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::sleep;

use crate::task::Task;

pub type OperationFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// The timed call a worker makes for each task.
///
/// Workers only measure wall-clock time around `execute` and forward the
/// error, if any, verbatim.
pub trait QueryOperation: Send + Sync {
    fn name(&self) -> &'static str;

    fn execute<'a>(&'a self, task: &'a Task) -> OperationFuture<'a>;
}

/// Stand-in operation that sleeps instead of querying.
///
/// A seeded fraction of calls can be made to fail, so error paths are
/// reproducible without a database.
pub struct MockOperation {
    delay: Duration,
    failure_rate: f64,
    rng: Mutex<StdRng>,
}

impl MockOperation {
    pub fn new(delay_ms: u64) -> Self {
        Self {
            delay: Duration::from_millis(delay_ms),
            failure_rate: 0.0,
            rng: Mutex::new(StdRng::seed_from_u64(0)),
        }
    }

    /// Fail roughly `rate` of all calls, deterministically for a given seed.
    pub fn with_failures(mut self, rate: f64, seed: u64) -> Self {
        self.failure_rate = rate.clamp(0.0, 1.0);
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    fn should_fail(&self) -> bool {
        if self.failure_rate <= 0.0 {
            return false;
        }
        match self.rng.lock() {
            Ok(mut rng) => rng.gen_bool(self.failure_rate),
            Err(poisoned) => poisoned.into_inner().gen_bool(self.failure_rate),
        }
    }
}

impl QueryOperation for MockOperation {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn execute<'a>(&'a self, task: &'a Task) -> OperationFuture<'a> {
        Box::pin(async move {
            // Decide before sleeping so the lock is never held across an await.
            let fail = self.should_fail();

            if !self.delay.is_zero() {
                sleep(self.delay).await;
            }

            if fail {
                return Err(anyhow!("mock failure for host {}", task.host));
            }
            Ok(())
        })
    }
}
