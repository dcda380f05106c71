use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use stampede_metrics::Phase;

use crate::scenario::ActiveScenario;

/// State shared between the workers and the scheduler's admission decisions.
#[derive(Debug)]
pub(crate) struct WorkerShared {
    pub(crate) busy: AtomicUsize,
    pub(crate) failures: AtomicU64,
}

impl WorkerShared {
    pub(crate) fn new() -> Self {
        Self {
            busy: AtomicUsize::new(0),
            failures: AtomicU64::new(0),
        }
    }
}

pub(crate) type DispatchReceiver = Arc<Mutex<mpsc::Receiver<u64>>>;

/// Fixed-size set of executors consuming dispatched iteration indices.
pub(crate) struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn spawn(
        count: usize,
        scenario: Arc<ActiveScenario>,
        shared: Arc<WorkerShared>,
        dispatch: DispatchReceiver,
        stop: watch::Receiver<bool>,
        acks: mpsc::Sender<()>,
    ) -> Self {
        let handles = (0..count)
            .map(|worker| {
                tokio::spawn(worker_loop(
                    worker.to_string(),
                    scenario.clone(),
                    shared.clone(),
                    dispatch.clone(),
                    stop.clone(),
                    acks.clone(),
                ))
            })
            .collect();
        Self { handles }
    }

    /// Join every worker, returning the join errors of any that died instead
    /// of exiting their loop.
    pub(crate) async fn join(self) -> Vec<tokio::task::JoinError> {
        join_all(self.handles)
            .await
            .into_iter()
            .filter_map(|joined| joined.err())
            .collect()
    }
}

async fn worker_loop(
    worker: String,
    scenario: Arc<ActiveScenario>,
    shared: Arc<WorkerShared>,
    dispatch: DispatchReceiver,
    mut stop: watch::Receiver<bool>,
    acks: mpsc::Sender<()>,
) {
    loop {
        tokio::select! {
            _ = stop.changed() => return,
            next = async { dispatch.lock().await.recv().await } => {
                let Some(iteration) = next else { return };

                // Selection is nondeterministic: when stop and a dispatch are
                // both ready we may land here, so re-check before executing.
                if *stop.borrow() {
                    return;
                }

                shared.busy.fetch_add(1, Ordering::SeqCst);
                let iteration = iteration.to_string();
                for stage in &scenario.stages {
                    if let Err(err) = scenario
                        .run_stage(Phase::Iteration, &stage.name, &worker, &iteration, &stage.run)
                        .await
                    {
                        tracing::error!(error = %err, "failed iteration run");
                        shared.failures.fetch_add(1, Ordering::Relaxed);
                    }
                }
                shared.busy.fetch_sub(1, Ordering::SeqCst);

                // Nobody reads acks once shutdown starts; bail out rather
                // than block on a full channel.
                tokio::select! {
                    sent = acks.send(()) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                    _ = stop.changed() => return,
                }
            }
        }
    }
}
