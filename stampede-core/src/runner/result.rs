use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use stampede_metrics::{Outcome, Quantile};

/// Final timing summary for one (stage, outcome) pair.
#[derive(Debug, Clone, Default)]
pub struct MetricsSummary {
    pub count: u64,
    pub quantiles: Vec<Quantile>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Terminal {
    Completed,
    Interrupted,
    MaxDurationElapsed,
    SetupFailed,
}

impl Terminal {
    fn as_str(self) -> &'static str {
        match self {
            Terminal::Completed => "completed",
            Terminal::Interrupted => "interrupted",
            Terminal::MaxDurationElapsed => "max duration elapsed",
            Terminal::SetupFailed => "setup failed",
        }
    }
}

type SeriesKey = (String, &'static str);

#[derive(Debug, Default)]
struct Inner {
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
    terminal: Option<Terminal>,
    errors: Vec<String>,
    dropped: u64,
    final_metrics: BTreeMap<SeriesKey, MetricsSummary>,
    progress: BTreeMap<SeriesKey, MetricsSummary>,
    progress_window: Duration,
    progress_dropped: u64,
    log_file: Option<PathBuf>,
}

impl Inner {
    fn count_where(&self, outcome: Outcome) -> u64 {
        self.final_metrics
            .iter()
            .filter(|((_, o), _)| *o == outcome.as_str())
            .map(|(_, m)| m.count)
            .sum()
    }
}

/// Accumulates counts, errors, timing summaries, and phase transitions for a
/// run, and renders progress and summary snapshots. All operations are safe
/// to call from any task.
pub struct RunResult {
    inner: Mutex<Inner>,
    ignore_dropped: bool,
}

impl RunResult {
    pub fn new(ignore_dropped: bool) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            ignore_dropped,
        }
    }

    pub fn record_started(&self) -> String {
        self.inner.lock().started_at = Some(Instant::now());
        "Load test started".to_string()
    }

    pub fn record_test_finished(&self) -> String {
        let mut inner = self.inner.lock();
        inner.finished_at = Some(Instant::now());
        if inner.terminal.is_none() {
            inner.terminal = Some(Terminal::Completed);
        }
        "Load test finished".to_string()
    }

    pub fn setup(&self) -> String {
        let inner = self.inner.lock();
        if inner.errors.is_empty() {
            "Setup    ✔".to_string()
        } else {
            "Setup    ✘".to_string()
        }
    }

    pub fn teardown(&self) -> String {
        let inner = self.inner.lock();
        if inner.errors.is_empty() {
            "Teardown ✔".to_string()
        } else {
            "Teardown ✘".to_string()
        }
    }

    pub fn interrupted(&self) -> String {
        let mut inner = self.inner.lock();
        if inner.terminal.is_none() {
            inner.terminal = Some(Terminal::Interrupted);
        }
        "Interrupted - waiting for active iterations to complete".to_string()
    }

    /// Empty when the run was already interrupted: the collapsed deadline
    /// still drives shutdown, but only one transition is announced.
    pub fn max_duration_elapsed(&self) -> String {
        let mut inner = self.inner.lock();
        if inner.terminal.is_none() {
            inner.terminal = Some(Terminal::MaxDurationElapsed);
            return "Max duration elapsed - waiting for active iterations to complete".to_string();
        }
        String::new()
    }

    pub fn record_setup_failed(&self, message: impl fmt::Display) {
        let mut inner = self.inner.lock();
        inner.terminal = Some(Terminal::SetupFailed);
        inner.errors.push(message.to_string());
    }

    pub fn add_error(&self, err: impl fmt::Display) {
        self.inner.lock().errors.push(err.to_string());
    }

    pub fn set_metrics(&self, outcome: Outcome, stage: &str, count: u64, quantiles: Vec<Quantile>) {
        self.inner.lock().final_metrics.insert(
            (stage.to_string(), outcome.as_str()),
            MetricsSummary { count, quantiles },
        );
    }

    pub fn increment_metrics(
        &self,
        window: Duration,
        outcome: Outcome,
        stage: &str,
        count: u64,
        quantiles: Vec<Quantile>,
    ) {
        let mut inner = self.inner.lock();
        inner.progress_window = window;
        let entry = inner
            .progress
            .entry((stage.to_string(), outcome.as_str()))
            .or_default();
        entry.count += count;
        entry.quantiles = quantiles;
    }

    pub fn add_progress_dropped(&self, dropped: u64) {
        self.inner.lock().progress_dropped += dropped;
    }

    pub fn clear_progress_metrics(&self) {
        let mut inner = self.inner.lock();
        inner.progress.clear();
        inner.progress_dropped = 0;
    }

    pub fn set_dropped(&self, dropped: u64) {
        self.inner.lock().dropped = dropped;
    }

    pub fn set_log_file(&self, path: PathBuf) {
        self.inner.lock().log_file = Some(path);
    }

    pub fn log_file(&self) -> Option<PathBuf> {
        self.inner.lock().log_file.clone()
    }

    pub fn successes(&self) -> u64 {
        self.inner.lock().count_where(Outcome::Success)
    }

    pub fn failures(&self) -> u64 {
        self.inner.lock().count_where(Outcome::Fail)
    }

    pub fn dropped(&self) -> u64 {
        self.inner.lock().dropped
    }

    pub fn errors(&self) -> Vec<String> {
        self.inner.lock().errors.clone()
    }

    pub fn is_completed(&self) -> bool {
        self.inner.lock().terminal == Some(Terminal::Completed)
    }

    pub fn is_interrupted(&self) -> bool {
        self.inner.lock().terminal == Some(Terminal::Interrupted)
    }

    pub fn is_max_duration_elapsed(&self) -> bool {
        self.inner.lock().terminal == Some(Terminal::MaxDurationElapsed)
    }

    pub fn is_setup_failed(&self) -> bool {
        self.inner.lock().terminal == Some(Terminal::SetupFailed)
    }

    pub fn elapsed(&self) -> Duration {
        let inner = self.inner.lock();
        match (inner.started_at, inner.finished_at) {
            (Some(start), Some(end)) => end.duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        }
    }

    pub fn failed(&self) -> bool {
        self.failed_inner(&self.inner.lock())
    }

    fn failed_inner(&self, inner: &Inner) -> bool {
        if !inner.errors.is_empty() {
            return true;
        }
        if inner.count_where(Outcome::Fail) > 0 {
            return true;
        }
        !self.ignore_dropped && inner.dropped > 0
    }

    /// Render the per-window progress snapshot.
    pub fn progress(&self) -> String {
        let inner = self.inner.lock();
        let elapsed = inner
            .started_at
            .map(|s| s.elapsed())
            .unwrap_or(Duration::ZERO);

        let mut ok = 0u64;
        let mut fail = 0u64;
        for ((_, outcome), m) in &inner.progress {
            if *outcome == Outcome::Success.as_str() {
                ok += m.count;
            } else {
                fail += m.count;
            }
        }

        let secs = inner.progress_window.as_secs_f64();
        let rate = if secs > 0.0 {
            (ok + fail) as f64 / secs
        } else {
            0.0
        };

        let mut line = format!(
            "[{:>6}] ✔ {ok} ✘ {fail} ↯ {} ({rate:.1}/s)",
            format_duration(elapsed),
            inner.progress_dropped,
        );

        for ((stage, outcome), m) in &inner.progress {
            if let Some(p95) = m.quantiles.iter().find(|q| (q.quantile - 0.95).abs() < 1e-9) {
                if *outcome == Outcome::Success.as_str() {
                    line.push_str(&format!("  {stage} p95 {}", format_duration(p95.value)));
                }
            }
        }
        line
    }
}

impl fmt::Display for RunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();

        let verdict = if self.failed_inner(&inner) {
            "Load Test Failed"
        } else {
            "Load Test Passed"
        };
        let terminal = inner
            .terminal
            .map(Terminal::as_str)
            .unwrap_or("not finished");

        writeln!(f, "{verdict} ({terminal})")?;

        let elapsed = match (inner.started_at, inner.finished_at) {
            (Some(start), Some(end)) => end.duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        };
        writeln!(
            f,
            "Ran for {}  ✔ {} ✘ {} ↯ {}",
            format_duration(elapsed),
            inner.count_where(Outcome::Success),
            inner.count_where(Outcome::Fail),
            inner.dropped,
        )?;

        for ((stage, outcome), m) in &inner.final_metrics {
            write!(f, "{stage} [{outcome}]: {} samples", m.count)?;
            for q in &m.quantiles {
                write!(
                    f,
                    "; p{:.0} {}",
                    q.quantile * 100.0,
                    format_duration(q.value)
                )?;
            }
            writeln!(f)?;
        }

        if !inner.errors.is_empty() {
            writeln!(f, "Errors:")?;
            for err in &inner.errors {
                writeln!(f, "  - {err}")?;
            }
        }

        if let Some(path) = &inner.log_file {
            writeln!(f, "Full logs: {}", path.display())?;
        }

        Ok(())
    }
}

/// Render a duration as a single rounded component in one of: us, ms, s.
pub(crate) fn format_duration(d: Duration) -> String {
    let total_ns: u128 = (d.as_secs() as u128) * 1_000_000_000u128 + (d.subsec_nanos() as u128);

    const NS_PER_US: u128 = 1_000;
    const NS_PER_MS: u128 = 1_000_000;
    const NS_PER_S: u128 = 1_000_000_000;

    fn round_div(value: u128, unit: u128) -> u128 {
        (value + (unit / 2)) / unit
    }

    if total_ns >= NS_PER_S {
        return format!("{}s", round_div(total_ns, NS_PER_S));
    }
    if total_ns >= NS_PER_MS {
        return format!("{}ms", round_div(total_ns, NS_PER_MS));
    }
    format!("{}us", round_div(total_ns, NS_PER_US))
}
