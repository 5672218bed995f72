use std::collections::HashMap;

use anyhow::{bail, Result};

/// Sticky host-to-worker assignment.
///
/// The first sighting of a host takes the next worker in round-robin order;
/// every later task for that host goes to the same worker, so one host's
/// queries run in submission order.
#[derive(Debug)]
pub struct Router {
    workers: usize,
    next: usize,
    assignments: HashMap<String, usize>,
}

impl Router {
    pub fn new(workers: usize) -> Result<Self> {
        if workers == 0 {
            bail!("worker count must be > 0");
        }

        Ok(Self {
            workers,
            next: 0,
            assignments: HashMap::new(),
        })
    }

    /// Worker index for `host`, assigning one on first sighting.
    pub fn assign(&mut self, host: &str) -> usize {
        if let Some(&idx) = self.assignments.get(host) {
            return idx;
        }

        let idx = self.next;
        self.assignments.insert(host.to_string(), idx);
        self.next = (self.next + 1) % self.workers;
        idx
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Number of distinct hosts seen so far.
    pub fn hosts(&self) -> usize {
        self.assignments.len()
    }
}
