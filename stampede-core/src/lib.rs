mod context;
mod error;
mod logging;
mod options;
mod scenario;
mod signal;
mod trigger;

pub mod runner;

pub use context::IterationContext;
pub use error::{Error, Result};
pub use logging::LogWriter;
pub use options::{LogHookFn, RunOptions};
pub use runner::{CancelHandle, CancellableTimer, Rate, RateRunner, Run, RunResult};
pub use scenario::{ActiveScenario, ScenarioFn, ScenarioRegistry, ScenarioSetup, Stage, StageFn};
pub use signal::{InterruptSource, OsSignals};
pub use trigger::{Trigger, TriggerChannels, TriggerFn};
