use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use stampede_metrics::{IterationMetrics, Phase, Pusher};

use crate::error::{Error, Result};
use crate::logging::LogWriter;
use crate::options::RunOptions;
use crate::runner::rate::{Rate, RateCallback, RateRunner};
use crate::runner::result::{format_duration, RunResult};
use crate::runner::scheduler::run_schedule;
use crate::scenario::{ActiveScenario, ScenarioFn, ScenarioRegistry};
use crate::signal::{InterruptSource, OsSignals};
use crate::trigger::Trigger;

/// Environment variable naming the Prometheus push gateway. When set, metrics
/// are pushed every five seconds and at phase boundaries.
pub const PUSH_GATEWAY_ENV: &str = "PROMETHEUS_PUSH_GATEWAY";

const PUSH_JOB_PREFIX: &str = "stampede";
const PUSH_PERIOD: Duration = Duration::from_secs(5);

fn progress_cadence() -> Vec<Rate> {
    vec![
        Rate::new(Duration::ZERO, Duration::from_secs(1)),
        Rate::new(Duration::from_secs(60), Duration::from_secs(10)),
        Rate::new(Duration::from_secs(300), Duration::from_secs(30)),
        Rate::new(Duration::from_secs(600), Duration::from_secs(60)),
    ]
}

fn gather_progress(metrics: &IterationMetrics, result: &RunResult, window: Duration) {
    let snapshot = metrics.take_window();
    result.clear_progress_metrics();
    for s in snapshot.series {
        if s.key.phase != Phase::Iteration {
            continue;
        }
        result.increment_metrics(window, s.key.outcome, &s.key.stage, s.count, s.quantiles);
    }
    result.add_progress_dropped(snapshot.dropped);
}

fn progress_callback(metrics: Arc<IterationMetrics>, result: Arc<RunResult>) -> RateCallback {
    Arc::new(move |window, _now| {
        gather_progress(&metrics, &result, window);
        println!("{}", result.progress());
    })
}

/// Owns the lifecycle of one run: setup, scheduling, teardown, and the
/// samplers around them.
pub struct Run {
    options: RunOptions,
    trigger: Trigger,
    scenario_fn: ScenarioFn,
    metrics: Arc<IterationMetrics>,
    result: Arc<RunResult>,
    pusher: Option<Pusher>,
    progress: RateRunner,
    interrupts: Arc<dyn InterruptSource>,
    log_writer: LogWriter,
}

impl std::fmt::Debug for Run {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Run").finish_non_exhaustive()
    }
}

impl Run {
    pub fn new(options: RunOptions, trigger: Trigger, scenarios: &ScenarioRegistry) -> Result<Self> {
        options.validate()?;
        let scenario_fn = scenarios
            .get(&options.scenario)
            .ok_or_else(|| Error::UnknownScenario(options.scenario.clone()))?;

        let metrics = Arc::new(IterationMetrics::default());
        let result = Arc::new(RunResult::new(options.ignore_dropped));

        let pusher = std::env::var(PUSH_GATEWAY_ENV)
            .ok()
            .filter(|url| !url.is_empty())
            .map(|url| Pusher::new(&url, &format!("{PUSH_JOB_PREFIX}-{}", options.scenario)));

        // The subscriber is a process singleton, so every run retargets the
        // same shared sink rather than installing its own.
        let log_writer = LogWriter::global();

        let progress = RateRunner::new(
            progress_callback(metrics.clone(), result.clone()),
            progress_cadence(),
        );

        Ok(Self {
            options,
            trigger,
            scenario_fn,
            metrics,
            result,
            pusher,
            progress,
            interrupts: Arc::new(OsSignals::new()),
            log_writer,
        })
    }

    /// Replace the OS signal source, so tests can interrupt synthetically.
    pub fn with_interrupt_source(mut self, interrupts: Arc<dyn InterruptSource>) -> Self {
        self.interrupts = interrupts;
        self
    }

    pub fn result(&self) -> Arc<RunResult> {
        self.result.clone()
    }

    pub fn metrics(&self) -> Arc<IterationMetrics> {
        self.metrics.clone()
    }

    pub async fn execute(mut self) -> Arc<RunResult> {
        println!("{}", self.header());
        self.configure_logging();
        self.metrics.reset();

        let activation = ActiveScenario::activate(
            &self.options.scenario,
            self.options.env.clone(),
            self.scenario_fn.clone(),
            self.metrics.clone(),
        )
        .await;
        self.push_metrics().await;

        let scenario = match activation {
            Ok(scenario) => {
                println!("{}", self.result.setup());
                Arc::new(scenario)
            }
            Err(err) => {
                self.result.record_setup_failed(&err);
                println!("{}", self.result.setup());
                self.print_log_on_failure();
                self.print_summary();
                return self.result;
            }
        };

        // Initial started timestamp so the progress tracker renders a sane
        // elapsed time from its first tick.
        self.result.record_started();
        self.progress.run();
        let push_ticker = self.start_push_ticker();

        run_schedule(
            &self.options,
            scenario.clone(),
            &self.trigger,
            self.metrics.clone(),
            self.result.clone(),
            &self.progress,
            self.interrupts.as_ref(),
        )
        .await;

        self.progress.terminate().await;
        if let Some((stop, handle)) = push_ticker {
            let _ = stop.send(true);
            if let Err(err) = handle.await {
                tracing::error!(error = %Error::Join(err), "metrics push ticker died");
            }
        }

        self.gather_metrics();
        self.run_teardown(&scenario).await;
        self.push_metrics().await;
        println!("{}", self.result.teardown());

        self.print_log_on_failure();
        self.print_summary();
        self.result
    }

    fn header(&self) -> String {
        let bounds = if self.options.max_iterations > 0 {
            format!("up to {} iterations or up to ", self.options.max_iterations)
        } else {
            String::new()
        };
        let duration = if self.options.max_duration > Duration::ZERO {
            format_duration(self.options.max_duration)
        } else {
            "an unlimited duration".to_string()
        };
        format!(
            "Stampede Load Tester\nRunning {} scenario for {bounds}{duration} at a rate of {}.",
            self.options.scenario, self.trigger.description
        )
    }

    fn configure_logging(&self) {
        if let Some(hook) = &self.options.log_hook {
            hook(&self.options.scenario);
        }
        if self.options.verbose {
            return;
        }

        match self.log_writer.redirect_to_file(&self.options.scenario) {
            Ok(path) => {
                tracing::info!("{}", self.header());
                println!("Saving logs to {}\n", path.display());
                self.result.set_log_file(path);
            }
            Err(err) => tracing::error!(error = %err, "unable to redirect logs to file"),
        }
    }

    fn start_push_ticker(&self) -> Option<(watch::Sender<bool>, JoinHandle<()>)> {
        let pusher = self.pusher.clone()?;
        let metrics = self.metrics.clone();
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(PUSH_PERIOD);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick of a tokio interval is immediate; the driver
            // already pushed at the phase boundary.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => return,
                    _ = interval.tick() => {
                        if let Err(err) = pusher.push(metrics.totals()).await {
                            tracing::error!(error = %err, "unable to push metrics to prometheus");
                        }
                    }
                }
            }
        });

        Some((stop_tx, handle))
    }

    async fn push_metrics(&self) {
        let Some(pusher) = &self.pusher else { return };
        if let Err(err) = pusher.push(self.metrics.totals()).await {
            tracing::error!(error = %err, "unable to push metrics to prometheus");
        }
    }

    fn gather_metrics(&self) {
        for s in self.metrics.totals().gather() {
            if s.key.phase != Phase::Iteration {
                continue;
            }
            self.result
                .set_metrics(s.key.outcome, &s.key.stage, s.count, s.quantiles);
        }
        self.result.set_dropped(self.metrics.dropped_total());
    }

    async fn run_teardown(&self, scenario: &Arc<ActiveScenario>) {
        if let Some(auto) = scenario.auto_teardown() {
            auto.cancel();
        }

        match scenario.teardown_fn() {
            Some(f) => {
                if let Err(err) = scenario
                    .run_stage(Phase::Teardown, "teardown", "0", "teardown", &f)
                    .await
                {
                    self.result.add_error(Error::Teardown(err.to_string()));
                }
            }
            None => {
                tracing::info!("nil teardown function for scenario {}", self.options.scenario);
            }
        }
    }

    fn print_summary(&self) {
        let summary = self.result.to_string();
        println!("{summary}");
        if !self.options.verbose {
            tracing::info!("{summary}");
            self.log_writer.restore();
        }
    }

    fn print_log_on_failure(&self) {
        if self.options.verbose || !self.options.verbose_fail || !self.result.failed() {
            return;
        }
        let Some(path) = self.result.log_file() else {
            return;
        };

        match std::fs::File::open(&path) {
            Ok(mut file) => {
                if let Err(err) = std::io::copy(&mut file, &mut std::io::stdout()) {
                    tracing::error!(error = %err, "error printing logs");
                }
            }
            Err(err) => tracing::error!(error = %err, "error opening log file"),
        }
    }
}
