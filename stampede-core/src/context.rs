use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use stampede_metrics::{IterationMetrics, Outcome, Phase};

/// Panic payload used by [`IterationContext::fail_now`] to unwind out of user
/// code without reporting a panic. The stage runner swallows it.
pub(crate) struct FailNow;

/// Per-iteration context handed to every stage, setup, and teardown function.
///
/// Carries the identifiers that tag log lines and timing samples, the shared
/// environment map, and the iteration's failure flag.
#[derive(Debug)]
pub struct IterationContext {
    /// Identifier of the simulated user running this iteration.
    pub virtual_user: String,
    /// Iteration label: "setup", "teardown", or the iteration number.
    pub iteration: String,
    pub scenario: String,
    pub env: Arc<HashMap<String, String>>,
    phase: Phase,
    failed: AtomicBool,
    metrics: Arc<IterationMetrics>,
}

impl IterationContext {
    pub(crate) fn new(
        phase: Phase,
        virtual_user: impl Into<String>,
        iteration: impl Into<String>,
        scenario: impl Into<String>,
        env: Arc<HashMap<String, String>>,
        metrics: Arc<IterationMetrics>,
    ) -> Self {
        Self {
            virtual_user: virtual_user.into(),
            iteration: iteration.into(),
            scenario: scenario.into(),
            env,
            phase,
            failed: AtomicBool::new(false),
            metrics,
        }
    }

    /// Span tagging log lines with the user, iteration, and scenario.
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!(
            "iteration",
            u = %self.virtual_user,
            i = %self.iteration,
            scenario = %self.scenario,
        )
    }

    pub fn fail(&self) {
        self.failed.store(true, Ordering::SeqCst);
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Mark the iteration failed and log the message.
    pub fn error(&self, message: impl std::fmt::Display) {
        self.fail();
        let _guard = self.span().entered();
        tracing::error!("{message}");
    }

    /// Mark the iteration failed and unwind out of the current stage. The
    /// remaining code of the stage does not run; later stages of the same
    /// iteration still do.
    pub fn fail_now(&self) -> ! {
        self.fail();
        std::panic::panic_any(FailNow);
    }

    /// Record the wall-clock duration of `f` as a timing sample named `name`,
    /// labelled with the iteration's failure state at exit.
    pub async fn time<F, Fut>(&self, name: &str, f: F)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        let start = Instant::now();
        f().await;
        self.metrics.record(
            self.phase,
            Outcome::from_failed(self.has_failed()),
            name,
            start.elapsed(),
        );
    }

    pub fn require_true(&self, condition: bool, message: &str) -> bool {
        if !condition {
            self.error(message);
        }
        condition
    }

    pub fn require_eq<T: PartialEq + Debug>(&self, got: &T, want: &T) -> bool {
        if got != want {
            self.error(format_args!("require_eq failed: got {got:?}, want {want:?}"));
            return false;
        }
        true
    }
}
