//! Batch execution policy.
//!
//! Large query and insert batches are split into bounded sub-batches so a
//! single native call never works on an unbounded buffer. Batches above a
//! smaller threshold are pinned to one dedicated worker thread for the whole
//! call, which keeps the engine's thread-local scratch state on one thread.
//!
//! Splitting is invisible in the results: sub-batch outputs are written into
//! disjoint windows of the caller's output buffers, in input order.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{Error, Result};

/// Queries per native search call.
pub const DEFAULT_SEARCH_BATCH_SIZE: usize = 10_000;
/// Vectors per native add call.
pub const DEFAULT_ADD_BATCH_SIZE: usize = 100_000;
/// Batches larger than this run on a pinned worker.
pub const DEFAULT_PIN_THRESHOLD: usize = 100;

/// Splitting and pinning thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub search_batch_size: usize,
    pub add_batch_size: usize,
    pub pin_threshold: usize,
    /// Number of pinned workers; zero disables pinning.
    pub pinned_workers: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            search_batch_size: DEFAULT_SEARCH_BATCH_SIZE,
            add_batch_size: DEFAULT_ADD_BATCH_SIZE,
            pin_threshold: DEFAULT_PIN_THRESHOLD,
            pinned_workers: num_cpus::get().clamp(1, 8),
        }
    }
}

impl BatchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_search_batch_size(mut self, size: usize) -> Self {
        self.search_batch_size = size;
        self
    }

    pub fn with_add_batch_size(mut self, size: usize) -> Self {
        self.add_batch_size = size;
        self
    }

    pub fn with_pin_threshold(mut self, threshold: usize) -> Self {
        self.pin_threshold = threshold;
        self
    }

    pub fn with_pinned_workers(mut self, workers: usize) -> Self {
        self.pinned_workers = workers;
        self
    }

    /// Checks that both batch sizes are positive.
    pub fn validate(&self) -> Result<()> {
        if self.search_batch_size == 0 {
            return Err(Error::InvalidConfig(
                "search_batch_size must be positive".to_string(),
            ));
        }
        if self.add_batch_size == 0 {
            return Err(Error::InvalidConfig(
                "add_batch_size must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Number of native search calls a batch of `nq` queries takes.
    pub fn search_calls(&self, nq: usize) -> usize {
        nq.div_ceil(self.search_batch_size.max(1))
    }

    /// Number of native add calls a batch of `n` vectors takes.
    pub fn add_calls(&self, n: usize) -> usize {
        n.div_ceil(self.add_batch_size.max(1))
    }

    /// Returns true if a batch of `n` items should run pinned.
    pub fn should_pin(&self, n: usize) -> bool {
        self.pinned_workers > 0 && n > self.pin_threshold
    }
}

/// A set of single-thread pools. Each call borrows one pool for its whole
/// duration and gives it back on return, including on error or panic.
pub(crate) struct PinnedPool {
    workers: Vec<Mutex<ThreadPool>>,
    next: AtomicUsize,
}

impl PinnedPool {
    pub(crate) fn new(workers: usize) -> Result<Self> {
        let workers = (0..workers)
            .map(|i| {
                ThreadPoolBuilder::new()
                    .num_threads(1)
                    .thread_name(move |_| format!("vecgate-pinned-{}", i))
                    .build()
                    .map(Mutex::new)
                    .map_err(|e| Error::InvalidConfig(format!("pinned worker {}: {}", i, e)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            workers,
            next: AtomicUsize::new(0),
        })
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.workers.len()
    }

    /// Runs `f` on the first idle worker, starting the scan round-robin.
    /// With every worker busy, `f` runs on the calling thread.
    pub(crate) fn run<R, F>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        let len = self.workers.len();
        if len == 0 {
            return f();
        }
        let start = self.next.fetch_add(1, Ordering::Relaxed) % len;
        for offset in 0..len {
            let slot = (start + offset) % len;
            if let Some(worker) = self.workers[slot].try_lock() {
                trace!(worker = slot, "running pinned");
                return worker.install(f);
            }
        }
        trace!("all pinned workers busy, running inline");
        f()
    }
}
