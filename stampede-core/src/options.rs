use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};

/// Hook invoked with the scenario name before any log redirection, so callers
/// can attach their own subscriber layers or sinks.
pub type LogHookFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Immutable configuration for a single run.
#[derive(Clone)]
pub struct RunOptions {
    pub scenario: String,
    pub env: HashMap<String, String>,
    /// Size of the worker pool. Must be at least 1.
    pub concurrency: usize,
    /// Wall-clock bound for the run. `Duration::ZERO` means unbounded.
    pub max_duration: Duration,
    /// Iteration-count bound for the run. `0` means unbounded.
    pub max_iterations: u64,
    pub verbose: bool,
    /// Stream the redirected log file to stdout when the run fails.
    pub verbose_fail: bool,
    /// Exclude dropped iterations from the failed verdict.
    pub ignore_dropped: bool,
    pub log_hook: Option<LogHookFn>,
}

impl RunOptions {
    pub fn new(scenario: impl Into<String>) -> Self {
        Self {
            scenario: scenario.into(),
            env: HashMap::new(),
            concurrency: 1,
            max_duration: Duration::ZERO,
            max_iterations: 0,
            verbose: false,
            verbose_fail: false,
            ignore_dropped: false,
            log_hook: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(Error::InvalidConcurrency);
        }
        Ok(())
    }
}

impl fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunOptions")
            .field("scenario", &self.scenario)
            .field("env", &self.env)
            .field("concurrency", &self.concurrency)
            .field("max_duration", &self.max_duration)
            .field("max_iterations", &self.max_iterations)
            .field("verbose", &self.verbose)
            .field("verbose_fail", &self.verbose_fail)
            .field("ignore_dropped", &self.ignore_dropped)
            .field("log_hook", &self.log_hook.as_ref().map(|_| "..."))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_concurrency_is_rejected() {
        let mut opts = RunOptions::new("demo");
        assert!(opts.validate().is_ok());

        opts.concurrency = 0;
        assert!(matches!(opts.validate(), Err(Error::InvalidConcurrency)));
    }
}
