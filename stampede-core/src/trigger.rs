use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc;

use crate::options::RunOptions;

/// Channel ends handed to a trigger behavior for the lifetime of a run.
pub struct TriggerChannels {
    /// Write one value per iteration the trigger wants attempted.
    pub pulses: mpsc::Sender<()>,
    /// One message arrives here when the run is over. The behavior must
    /// return promptly afterwards; it must also return when `pulses` closes.
    pub stop: mpsc::Receiver<()>,
    /// A value arrives for every completed iteration; read it to pace off
    /// worker throughput. Acks dry up during shutdown — never block on this
    /// channel without also watching `stop`.
    pub acks: mpsc::Receiver<()>,
}

pub type TriggerFn =
    Arc<dyn Fn(TriggerChannels, RunOptions) -> BoxFuture<'static, ()> + Send + Sync>;

/// An externally supplied rate source. The engine only depends on this
/// contract; concrete shapes (constant, staged, ramped, ...) live with the
/// caller.
#[derive(Clone)]
pub struct Trigger {
    pub description: String,
    /// Self-imposed bound on the run. `Duration::ZERO` means none.
    pub duration: Duration,
    pub run: TriggerFn,
}

impl Trigger {
    pub fn new<F, Fut>(description: impl Into<String>, duration: Duration, f: F) -> Self
    where
        F: Fn(TriggerChannels, RunOptions) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            description: description.into(),
            duration,
            run: Arc::new(move |channels, options| f(channels, options).boxed()),
        }
    }
}
