use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use hdrhistogram::Histogram;
use parking_lot::Mutex;

/// Name of the iteration timing series, as consumed by the run driver and
/// rendered in push exposition.
pub const ITERATION_METRIC: &str = "stampede_iteration";

/// Stage label applied when a sample carries no stage of its own.
pub const DEFAULT_STAGE: &str = "single";

const QUANTILES: [f64; 5] = [0.5, 0.75, 0.9, 0.95, 0.99];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Setup,
    Iteration,
    Teardown,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Setup => "setup",
            Phase::Iteration => "iteration",
            Phase::Teardown => "teardown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Success,
    Fail,
}

impl Outcome {
    pub fn from_failed(failed: bool) -> Self {
        if failed { Outcome::Fail } else { Outcome::Success }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Fail => "fail",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeriesKey {
    pub phase: Phase,
    pub outcome: Outcome,
    pub stage: Arc<str>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quantile {
    pub quantile: f64,
    pub value: Duration,
}

/// Point-in-time view of one (phase, outcome, stage) series.
#[derive(Debug, Clone)]
pub struct SeriesSnapshot {
    pub key: SeriesKey,
    pub count: u64,
    pub sum: Duration,
    pub quantiles: Vec<Quantile>,
}

#[derive(Debug)]
struct Series {
    count: AtomicU64,
    sum_nanos: AtomicU64,
    latency_us: Mutex<Histogram<u64>>,
}

fn new_histogram() -> Histogram<u64> {
    // Microseconds, up to one hour per sample, 3 significant figures.
    Histogram::<u64>::new_with_bounds(1, 3_600_000_000, 3)
        .unwrap_or_else(|err| panic!("failed to init histogram: {err}"))
}

impl Series {
    fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            sum_nanos: AtomicU64::new(0),
            latency_us: Mutex::new(new_histogram()),
        }
    }

    fn record(&self, elapsed: Duration) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_nanos
            .fetch_add(elapsed.as_nanos().min(u64::MAX as u128) as u64, Ordering::Relaxed);

        let us = (elapsed.as_micros().min(u64::MAX as u128) as u64).max(1);
        let mut h = self.latency_us.lock();
        let _ = h.record(us);
    }

    fn snapshot(&self, key: SeriesKey) -> SeriesSnapshot {
        let quantiles = {
            let h = self.latency_us.lock();
            QUANTILES
                .iter()
                .map(|&q| Quantile {
                    quantile: q,
                    value: Duration::from_micros(h.value_at_quantile(q)),
                })
                .collect()
        };

        SeriesSnapshot {
            key,
            count: self.count.load(Ordering::Relaxed),
            sum: Duration::from_nanos(self.sum_nanos.load(Ordering::Relaxed)),
            quantiles,
        }
    }
}

/// One registry of iteration timing series plus a dropped-iterations counter.
#[derive(Debug, Default)]
pub struct Registry {
    series: DashMap<SeriesKey, Arc<Series>>,
    dropped: AtomicU64,
}

impl Registry {
    pub fn record(&self, phase: Phase, outcome: Outcome, stage: &str, elapsed: Duration) {
        let key = SeriesKey {
            phase,
            outcome,
            stage: Arc::from(stage),
        };

        let series = self
            .series
            .entry(key)
            .or_insert_with(|| Arc::new(Series::new()))
            .clone();
        series.record(elapsed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Snapshot every series, sorted for stable rendering.
    pub fn gather(&self) -> Vec<SeriesSnapshot> {
        let mut out: Vec<SeriesSnapshot> = self
            .series
            .iter()
            .map(|entry| entry.value().snapshot(entry.key().clone()))
            .collect();
        out.sort_by(|a, b| {
            (a.key.phase as u8, a.key.outcome as u8, &a.key.stage).cmp(&(
                b.key.phase as u8,
                b.key.outcome as u8,
                &b.key.stage,
            ))
        });
        out
    }

    pub fn reset(&self) {
        self.series.clear();
        self.dropped.store(0, Ordering::Relaxed);
    }
}

/// One drained progress window: every series recorded since the previous
/// drain, plus the drops that landed in the same interval.
#[derive(Debug, Clone)]
pub struct WindowSnapshot {
    pub series: Vec<SeriesSnapshot>,
    pub dropped: u64,
}

/// The pair of registries the engine records into: cumulative totals for the
/// final summary, and a window registry that progress sampling drains.
#[derive(Debug, Default)]
pub struct IterationMetrics {
    totals: Registry,
    window: Registry,
}

impl IterationMetrics {
    pub fn record(&self, phase: Phase, outcome: Outcome, stage: &str, elapsed: Duration) {
        self.totals.record(phase, outcome, stage, elapsed);
        self.window.record(phase, outcome, stage, elapsed);
    }

    pub fn record_dropped(&self) {
        self.totals.record_dropped();
        self.window.record_dropped();
    }

    pub fn dropped_total(&self) -> u64 {
        self.totals.dropped_total()
    }

    pub fn totals(&self) -> &Registry {
        &self.totals
    }

    /// Snapshot the progress window and reset it for the next sample.
    pub fn take_window(&self) -> WindowSnapshot {
        let series = self.window.gather();
        let dropped = self.window.dropped_total();
        self.window.reset();
        WindowSnapshot { series, dropped }
    }

    pub fn reset(&self) {
        self.totals.reset();
        self.window.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_and_gather_series() {
        let reg = Registry::default();
        reg.record(Phase::Iteration, Outcome::Success, "connect", Duration::from_millis(10));
        reg.record(Phase::Iteration, Outcome::Success, "connect", Duration::from_millis(30));
        reg.record(Phase::Iteration, Outcome::Fail, "connect", Duration::from_millis(5));

        let snapshots = reg.gather();
        assert_eq!(snapshots.len(), 2);

        let ok = snapshots
            .iter()
            .find(|s| s.key.outcome == Outcome::Success)
            .unwrap();
        assert_eq!(ok.count, 2);
        assert_eq!(ok.sum, Duration::from_millis(40));
        assert_eq!(ok.quantiles.len(), 5);
        // p99 of {10ms, 30ms} lands on the larger sample.
        let p99 = ok.quantiles.last().unwrap();
        assert!(p99.value >= Duration::from_millis(29), "p99 was {:?}", p99.value);
    }

    #[test]
    fn reset_clears_series_and_dropped() {
        let reg = Registry::default();
        reg.record(Phase::Setup, Outcome::Success, DEFAULT_STAGE, Duration::from_millis(1));
        reg.record_dropped();
        assert_eq!(reg.dropped_total(), 1);

        reg.reset();
        assert!(reg.gather().is_empty());
        assert_eq!(reg.dropped_total(), 0);
    }

    #[test]
    fn window_drains_independently_of_totals() {
        let metrics = IterationMetrics::default();
        metrics.record(Phase::Iteration, Outcome::Success, "a", Duration::from_millis(2));
        metrics.record(Phase::Iteration, Outcome::Success, "a", Duration::from_millis(2));

        let window = metrics.take_window();
        assert_eq!(window.series.len(), 1);
        assert_eq!(window.series[0].count, 2);

        // Second take sees only what was recorded since the first.
        metrics.record(Phase::Iteration, Outcome::Success, "a", Duration::from_millis(2));
        metrics.record_dropped();
        let window = metrics.take_window();
        assert_eq!(window.series[0].count, 1);
        assert_eq!(window.dropped, 1);

        // Totals keep accumulating across window drains.
        assert_eq!(metrics.totals().gather()[0].count, 3);
    }
}
