use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};

use stampede_metrics::{IterationMetrics, Outcome, Phase};

use crate::context::{FailNow, IterationContext};
use crate::error::{Error, Result};
use crate::runner::CancelHandle;

pub type StageFn = Arc<dyn Fn(Arc<IterationContext>) -> BoxFuture<'static, ()> + Send + Sync>;

/// One named step of an iteration. Stages run in registration order; a failed
/// stage does not stop the remaining stages of the same iteration.
#[derive(Clone)]
pub struct Stage {
    pub name: String,
    pub run: StageFn,
}

impl Stage {
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Arc<IterationContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            name: name.into(),
            run: Arc::new(move |t| f(t).boxed()),
        }
    }
}

#[derive(Default)]
struct Registered {
    teardown: Option<StageFn>,
    auto_teardown: Option<CancelHandle>,
}

/// Handle passed to a [`ScenarioFn`] during activation. The scenario function
/// uses it to reach the setup iteration context and to register teardown
/// behavior alongside the stages it returns.
#[derive(Clone)]
pub struct ScenarioSetup {
    t: Arc<IterationContext>,
    registered: Arc<Mutex<Registered>>,
}

impl ScenarioSetup {
    /// The "setup"-labelled iteration context.
    pub fn context(&self) -> Arc<IterationContext> {
        self.t.clone()
    }

    /// Register a function to run once, after the pool has drained, labelled
    /// as the "teardown" iteration.
    pub fn set_teardown<F, Fut>(&self, f: F)
    where
        F: Fn(Arc<IterationContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.registered.lock().teardown = Some(Arc::new(move |t| f(t).boxed()));
    }

    /// Register a cancellable the driver fires before running teardown, for
    /// scenarios that arm their own delayed cleanup.
    pub fn set_auto_teardown(&self, handle: CancelHandle) {
        self.registered.lock().auto_teardown = Some(handle);
    }
}

pub type ScenarioFn =
    Arc<dyn Fn(ScenarioSetup) -> BoxFuture<'static, Result<Vec<Stage>>> + Send + Sync>;

/// Named scenarios available to the driver.
#[derive(Default)]
pub struct ScenarioRegistry {
    inner: RwLock<HashMap<String, ScenarioFn>>,
}

impl ScenarioRegistry {
    pub fn register<F, Fut>(&self, name: &str, f: F)
    where
        F: Fn(ScenarioSetup) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<Stage>>> + Send + 'static,
    {
        self.inner
            .write()
            .insert(name.to_string(), Arc::new(move |setup| f(setup).boxed()));
    }

    pub fn get(&self, name: &str) -> Option<ScenarioFn> {
        self.inner.read().get(name).cloned()
    }
}

/// A scenario after successful activation: the stages to run each iteration
/// plus whatever teardown behavior the scenario function registered.
pub struct ActiveScenario {
    pub name: String,
    pub stages: Vec<Stage>,
    env: Arc<HashMap<String, String>>,
    teardown: Option<StageFn>,
    auto_teardown: Option<CancelHandle>,
    metrics: Arc<IterationMetrics>,
}

impl std::fmt::Debug for ActiveScenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveScenario")
            .field("name", &self.name)
            .field("stages", &self.stages.iter().map(|s| &s.name).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl ActiveScenario {
    /// Run the scenario function as the "setup" iteration. Errors, panics,
    /// and a failed setup context all surface as [`Error::Setup`].
    pub async fn activate(
        name: &str,
        env: HashMap<String, String>,
        f: ScenarioFn,
        metrics: Arc<IterationMetrics>,
    ) -> Result<Self> {
        let env = Arc::new(env);
        let t = Arc::new(IterationContext::new(
            Phase::Setup,
            "0",
            "setup",
            name,
            env.clone(),
            metrics.clone(),
        ));
        let setup = ScenarioSetup {
            t: t.clone(),
            registered: Arc::new(Mutex::new(Registered::default())),
        };

        let start = Instant::now();
        let outcome = AssertUnwindSafe(f(setup.clone())).catch_unwind().await;

        let result = match outcome {
            Ok(Ok(stages)) if !t.has_failed() => Ok(stages),
            Ok(Ok(_)) => Err(Error::Setup("setup context marked failed".to_string())),
            Ok(Err(err)) => Err(Error::Setup(err.to_string())),
            Err(payload) => Err(Error::Setup(panic_message(&payload))),
        };

        metrics.record(
            Phase::Setup,
            Outcome::from_failed(result.is_err()),
            stampede_metrics::DEFAULT_STAGE,
            start.elapsed(),
        );

        let stages = result?;
        let registered = std::mem::take(&mut *setup.registered.lock());
        Ok(Self {
            name: name.to_string(),
            stages,
            env,
            teardown: registered.teardown,
            auto_teardown: registered.auto_teardown,
            metrics,
        })
    }

    pub fn teardown_fn(&self) -> Option<StageFn> {
        self.teardown.clone()
    }

    pub fn auto_teardown(&self) -> Option<&CancelHandle> {
        self.auto_teardown.as_ref()
    }

    /// Run one stage function with a fresh iteration context, recording the
    /// timing sample and converting panics into failures. A failed stage is
    /// an error for the caller to log and count; it never unwinds further.
    pub async fn run_stage(
        &self,
        phase: Phase,
        stage: &str,
        virtual_user: &str,
        iteration: &str,
        f: &StageFn,
    ) -> Result<()> {
        let t = Arc::new(IterationContext::new(
            phase,
            virtual_user,
            iteration,
            self.name.clone(),
            self.env.clone(),
            self.metrics.clone(),
        ));

        let start = Instant::now();
        let outcome = AssertUnwindSafe(f(t.clone())).catch_unwind().await;

        let panic = match outcome {
            Ok(()) => None,
            Err(payload) => {
                t.fail();
                // fail_now unwinds with a marker payload; anything else is a
                // real panic and carries its message into the error.
                if payload.downcast_ref::<FailNow>().is_some() {
                    None
                } else {
                    Some(panic_message(&payload))
                }
            }
        };

        let failed = t.has_failed();
        self.metrics.record(
            phase,
            Outcome::from_failed(failed),
            stage,
            start.elapsed(),
        );

        match panic {
            Some(message) => Err(Error::Panic {
                stage: stage.to_string(),
                iteration: iteration.to_string(),
                message,
            }),
            None if failed => Err(Error::Iteration {
                stage: stage.to_string(),
                iteration: iteration.to_string(),
            }),
            None => Ok(()),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn metrics() -> Arc<IterationMetrics> {
        Arc::new(IterationMetrics::default())
    }

    #[tokio::test]
    async fn activation_runs_setup_and_collects_stages() {
        let registry = ScenarioRegistry::default();
        registry.register("demo", |_setup| async {
            Ok(vec![Stage::new("only", |_t| async {})])
        });

        let scenario = ActiveScenario::activate(
            "demo",
            HashMap::new(),
            registry.get("demo").unwrap(),
            metrics(),
        )
        .await
        .unwrap();

        assert_eq!(scenario.stages.len(), 1);
        assert_eq!(scenario.stages[0].name, "only");
    }

    #[tokio::test]
    async fn activation_error_and_panic_become_setup_errors() {
        let m = metrics();
        let registry = ScenarioRegistry::default();
        registry.register("failing", |_setup| async {
            Err(Error::Setup("boom".to_string()))
        });
        registry.register("panicking", |_setup| async {
            panic!("setup exploded");
            #[allow(unreachable_code)]
            Ok(Vec::new())
        });

        let err = ActiveScenario::activate(
            "failing",
            HashMap::new(),
            registry.get("failing").unwrap(),
            m.clone(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Setup(_)));

        let err = ActiveScenario::activate(
            "panicking",
            HashMap::new(),
            registry.get("panicking").unwrap(),
            m,
        )
        .await
        .unwrap_err();
        eprintln!("DEBUG err = {}", err);
        assert!(err.to_string().contains("setup exploded"));
    }

    #[tokio::test]
    async fn stage_panic_is_captured_and_recorded_as_failure() {
        let m = metrics();
        let registry = ScenarioRegistry::default();
        registry.register("demo", |_setup| async {
            Ok(vec![Stage::new("explode", |_t| async { panic!("bad stage") })])
        });
        let scenario =
            ActiveScenario::activate("demo", HashMap::new(), registry.get("demo").unwrap(), m.clone())
                .await
                .unwrap();

        let stage = scenario.stages[0].clone();
        let err = scenario
            .run_stage(Phase::Iteration, &stage.name, "0", "1", &stage.run)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Panic { .. }));

        let snapshots = m.totals().gather();
        let sample = snapshots
            .iter()
            .find(|s| &*s.key.stage == "explode" && s.key.phase == Phase::Iteration)
            .unwrap();
        assert_eq!(sample.key.outcome, Outcome::Fail);
        assert_eq!(sample.count, 1);
    }

    #[tokio::test]
    async fn fail_now_unwinds_without_a_panic_error() {
        let m = metrics();
        let reached = Arc::new(AtomicUsize::new(0));
        let reached_in_stage = reached.clone();

        let registry = ScenarioRegistry::default();
        registry.register("demo", move |_setup| {
            let reached = reached_in_stage.clone();
            async move {
                Ok(vec![Stage::new("stop_early", move |t| {
                    let reached = reached.clone();
                    async move {
                        t.fail_now();
                        #[allow(unreachable_code)]
                        {
                            reached.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })])
            }
        });
        let scenario =
            ActiveScenario::activate("demo", HashMap::new(), registry.get("demo").unwrap(), m)
                .await
                .unwrap();

        let stage = scenario.stages[0].clone();
        let err = scenario
            .run_stage(Phase::Iteration, &stage.name, "0", "1", &stage.run)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Iteration { .. }));
        assert_eq!(reached.load(Ordering::SeqCst), 0);
    }
}

#[cfg(test)]
mod debug_panic_test {
    use super::*;
    #[tokio::test]
    async fn debug_panic_payload() {
        let registry = ScenarioRegistry::default();
        registry.register("panicking", |_setup| async {
            panic!("setup exploded");
            #[allow(unreachable_code)]
            Ok(Vec::new())
        });
        let f = registry.get("panicking").unwrap();
        let setup = ScenarioSetup {
            t: Arc::new(IterationContext::new(Phase::Setup, "0", "setup", "x", Arc::new(HashMap::new()), Arc::new(IterationMetrics::default()))),
            registered: Arc::new(Mutex::new(Registered::default())),
        };
        let outcome = AssertUnwindSafe(f(setup)).catch_unwind().await;
        match outcome {
            Ok(_) => eprintln!("OK BRANCH"),
            Err(payload) => {
                eprintln!("is str: {}", payload.downcast_ref::<&str>().is_some());
                eprintln!("is string: {}", payload.downcast_ref::<String>().is_some());
                eprintln!("type_id: {:?}", (*payload).type_id());
            }
        }
    }

    async fn helper(f: ScenarioFn, setup: ScenarioSetup) -> std::result::Result<Result<Vec<Stage>>, Box<dyn std::any::Any + Send>> {
        AssertUnwindSafe(f(setup)).catch_unwind().await
    }

    #[tokio::test]
    async fn debug_panic_one_level() {
        let registry = ScenarioRegistry::default();
        registry.register("panicking", |_setup| async {
            panic!("setup exploded");
            #[allow(unreachable_code)]
            Ok(Vec::new())
        });
        let f = registry.get("panicking").unwrap();
        let setup = ScenarioSetup {
            t: Arc::new(IterationContext::new(Phase::Setup, "0", "setup", "x", Arc::new(HashMap::new()), Arc::new(IterationMetrics::default()))),
            registered: Arc::new(Mutex::new(Registered::default())),
        };
        let outcome = helper(f, setup).await;
        match outcome {
            Ok(_) => eprintln!("OK"),
            Err(payload) => {
                eprintln!("ONE-LEVEL is str: {}", payload.downcast_ref::<&str>().is_some());
                eprintln!("ONE-LEVEL is box: {}", payload.downcast_ref::<Box<dyn std::any::Any + Send>>().is_some());
            }
        }
    }

    #[tokio::test]
    async fn debug_panic_via_activate() {
        let m = Arc::new(IterationMetrics::default());
        let registry = ScenarioRegistry::default();
        registry.register("failing", |_setup| async {
            Err(Error::Setup("boom".to_string()))
        });
        registry.register("panicking", |_setup| async {
            panic!("setup exploded");
            #[allow(unreachable_code)]
            Ok(Vec::new())
        });

        let err = ActiveScenario::activate(
            "panicking",
            HashMap::new(),
            registry.get("panicking").unwrap(),
            m,
        )
        .await
        .unwrap_err();
        eprintln!("DEBUG2 err = {}", err);
    }
}
