//! Process-wide operation metrics.
//!
//! Collection is off by default. While disabled, a gateway call pays for a
//! single atomic load and nothing else; when enabled, each successful train,
//! add, search, range search, and reset is timed and counted.
//!
//! # Example
//!
//! ```
//! use vecgate_core::metrics;
//!
//! metrics::enable();
//! // ... run searches ...
//! let snapshot = metrics::snapshot();
//! println!("{} searches, {:.0} qps", snapshot.search.count, snapshot.search.qps());
//! metrics::disable();
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{const_mutex, Mutex};
use serde::Serialize;

/// Operation kinds tracked separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Train,
    Add,
    Search,
    RangeSearch,
    Reset,
}

impl Operation {
    /// Every tracked operation, in snapshot order.
    pub const ALL: [Operation; 5] = [
        Operation::Train,
        Operation::Add,
        Operation::Search,
        Operation::RangeSearch,
        Operation::Reset,
    ];

    fn slot(self) -> usize {
        match self {
            Operation::Train => 0,
            Operation::Add => 1,
            Operation::Search => 2,
            Operation::RangeSearch => 3,
            Operation::Reset => 4,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Counter {
    count: u64,
    total_time: Duration,
    elements: u64,
    results: u64,
}

impl Counter {
    const ZERO: Counter = Counter {
        count: 0,
        total_time: Duration::ZERO,
        elements: 0,
        results: 0,
    };
}

/// Cumulative statistics for one operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct OperationStats {
    /// Number of successful native calls.
    pub count: u64,
    pub total_time: Duration,
    /// Vectors trained or added, or queries run.
    pub elements: u64,
    /// Neighbors returned (search and range search only).
    pub results: u64,
}

impl OperationStats {
    /// Mean latency per call.
    pub fn avg_time(&self) -> Duration {
        if self.count == 0 {
            return Duration::ZERO;
        }
        let nanos = self.total_time.as_nanos() / u128::from(self.count);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    /// Elements processed per second of native time.
    pub fn per_second(&self) -> f64 {
        let secs = self.total_time.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.elements as f64 / secs
    }

    /// Queries per second; the same figure as [`per_second`](Self::per_second)
    /// read for search operations.
    pub fn qps(&self) -> f64 {
        self.per_second()
    }
}

impl From<Counter> for OperationStats {
    fn from(c: Counter) -> Self {
        Self {
            count: c.count,
            total_time: c.total_time,
            elements: c.elements,
            results: c.results,
        }
    }
}

/// Point-in-time copy of all metrics.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct MetricsSnapshot {
    pub train: OperationStats,
    pub add: OperationStats,
    pub search: OperationStats,
    pub range_search: OperationStats,
    pub reset: OperationStats,
}

impl MetricsSnapshot {
    /// Stats for one operation kind.
    pub fn get(&self, op: Operation) -> &OperationStats {
        match op {
            Operation::Train => &self.train,
            Operation::Add => &self.add,
            Operation::Search => &self.search,
            Operation::RangeSearch => &self.range_search,
            Operation::Reset => &self.reset,
        }
    }

    pub fn total_operations(&self) -> u64 {
        Operation::ALL.iter().map(|op| self.get(*op).count).sum()
    }

    pub fn total_time(&self) -> Duration {
        Operation::ALL.iter().map(|op| self.get(*op).total_time).sum()
    }
}

/// A metrics registry. The crate records into [`global`]; separate instances
/// are useful for isolated measurements.
pub struct Metrics {
    enabled: AtomicBool,
    counters: Mutex<[Counter; 5]>,
}

impl Metrics {
    /// Creates a disabled, zeroed registry.
    pub const fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            counters: const_mutex([Counter::ZERO; 5]),
        }
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Clears all counters. Does not change the enabled flag.
    pub fn reset(&self) {
        *self.counters.lock() = [Counter::ZERO; 5];
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = *self.counters.lock();
        MetricsSnapshot {
            train: counters[Operation::Train.slot()].into(),
            add: counters[Operation::Add.slot()].into(),
            search: counters[Operation::Search.slot()].into(),
            range_search: counters[Operation::RangeSearch.slot()].into(),
            reset: counters[Operation::Reset.slot()].into(),
        }
    }

    /// Records one completed call. Ignored while disabled.
    pub fn record(&self, op: Operation, elapsed: Duration, elements: usize, results: usize) {
        if !self.is_enabled() {
            return;
        }
        let mut counters = self.counters.lock();
        let counter = &mut counters[op.slot()];
        counter.count += 1;
        counter.total_time += elapsed;
        counter.elements += elements as u64;
        counter.results += results as u64;
    }

    /// Starts timing a call against this registry.
    #[inline]
    pub fn timer(&self) -> Timer<'_> {
        Timer {
            metrics: self,
            start: self.is_enabled().then(Instant::now),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL: Metrics = Metrics::new();

/// The process-wide registry the gateway records into.
pub fn global() -> &'static Metrics {
    &GLOBAL
}

/// Enables process-wide collection.
pub fn enable() {
    GLOBAL.enable();
}

/// Disables process-wide collection. Collected values are kept.
pub fn disable() {
    GLOBAL.disable();
}

pub fn is_enabled() -> bool {
    GLOBAL.is_enabled()
}

/// Clears process-wide counters.
pub fn reset() {
    GLOBAL.reset();
}

pub fn snapshot() -> MetricsSnapshot {
    GLOBAL.snapshot()
}

/// Times one native call. Holds no clock reading while metrics are disabled.
pub struct Timer<'a> {
    metrics: &'a Metrics,
    start: Option<Instant>,
}

impl Timer<'static> {
    /// Starts timing against the process-wide registry.
    #[inline]
    pub fn start() -> Self {
        GLOBAL.timer()
    }
}

impl Timer<'_> {
    /// Records the call if timing was started.
    pub fn record(self, op: Operation, elements: usize) {
        self.record_with_results(op, elements, 0);
    }

    pub fn record_with_results(self, op: Operation, elements: usize, results: usize) {
        if let Some(start) = self.start {
            self.metrics.record(op, start.elapsed(), elements, results);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_records_nothing() {
        let metrics = Metrics::new();
        metrics.timer().record(Operation::Add, 100);
        metrics.record(Operation::Search, Duration::from_millis(1), 10, 50);
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_record_and_snapshot() {
        let metrics = Metrics::new();
        metrics.enable();
        metrics.record(Operation::Search, Duration::from_millis(10), 100, 1000);
        metrics.record(Operation::Search, Duration::from_millis(30), 100, 1000);
        metrics.record(Operation::Add, Duration::from_millis(5), 500, 0);
        metrics.timer().record(Operation::Reset, 0);

        let snap = metrics.snapshot();
        assert_eq!(snap.search.count, 2);
        assert_eq!(snap.search.elements, 200);
        assert_eq!(snap.search.results, 2000);
        assert_eq!(snap.search.avg_time(), Duration::from_millis(20));
        assert!((snap.search.qps() - 5000.0).abs() < 1e-6);
        assert_eq!(snap.add.elements, 500);
        assert_eq!(snap.reset.count, 1);
        assert_eq!(snap.total_operations(), 4);
        assert!(snap.total_time() >= Duration::from_millis(45));
    }

    #[test]
    fn test_reset_keeps_enabled_flag() {
        let metrics = Metrics::new();
        metrics.enable();
        metrics.record(Operation::Train, Duration::from_millis(1), 10, 0);
        metrics.reset();
        assert!(metrics.is_enabled());
        assert_eq!(metrics.snapshot().train.count, 0);
    }

    #[test]
    fn test_empty_stats() {
        let stats = OperationStats::default();
        assert_eq!(stats.avg_time(), Duration::ZERO);
        assert_eq!(stats.qps(), 0.0);
    }
}
