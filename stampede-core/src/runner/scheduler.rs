use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};

use stampede_metrics::IterationMetrics;

use crate::error::Error;
use crate::options::RunOptions;
use crate::runner::rate::RateRunner;
use crate::runner::result::RunResult;
use crate::runner::timer::CancellableTimer;
use crate::runner::workers::{WorkerPool, WorkerShared};
use crate::scenario::ActiveScenario;
use crate::signal::InterruptSource;
use crate::trigger::{Trigger, TriggerChannels};

/// Margin by which the deadline beats the configured duration, so a pulse
/// arriving at the boundary cannot start an iteration past it.
const DEADLINE_EPSILON: Duration = Duration::from_millis(5);

pub(crate) fn effective_duration(
    max_duration: Duration,
    trigger_duration: Duration,
) -> Option<Duration> {
    let mut effective = (max_duration > Duration::ZERO).then_some(max_duration);
    if trigger_duration > Duration::ZERO {
        effective = Some(match effective {
            Some(d) => d.min(trigger_duration),
            None => trigger_duration,
        });
    }
    effective.map(|d| d.saturating_sub(DEADLINE_EPSILON))
}

async fn recv_or_pending<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    let Some(r) = rx.as_mut() else {
        return std::future::pending().await;
    };
    let v = r.recv().await;
    if v.is_none() {
        // Closed channel: disable this branch instead of spinning on it.
        *rx = None;
    }
    v
}

/// Central loop. Consumes trigger pulses, admits or drops, enforces the
/// deadline / interrupt / iteration-cap stopping conditions, and drives the
/// shutdown sequence: stop trigger, broadcast worker stop, join workers,
/// join trigger.
pub(crate) async fn run_schedule(
    options: &RunOptions,
    scenario: Arc<ActiveScenario>,
    trigger: &Trigger,
    metrics: Arc<IterationMetrics>,
    result: Arc<RunResult>,
    progress: &RateRunner,
    interrupts: &dyn InterruptSource,
) {
    let workers = options.concurrency;

    let (dispatch_tx, dispatch_rx) = mpsc::channel::<u64>(workers);
    let (stop_workers_tx, stop_workers_rx) = watch::channel(false);
    let (ack_tx, ack_rx) = mpsc::channel::<()>(workers);

    let shared = Arc::new(WorkerShared::new());
    let pool = WorkerPool::spawn(
        workers,
        scenario,
        shared.clone(),
        Arc::new(Mutex::new(dispatch_rx)),
        stop_workers_rx,
        ack_tx,
    );

    let (pulse_tx, pulse_rx) = mpsc::channel::<()>(workers);
    let (stop_trigger_tx, stop_trigger_rx) = mpsc::channel::<()>(1);
    let trigger_task = tokio::spawn((trigger.run)(
        TriggerChannels {
            pulses: pulse_tx,
            stop: stop_trigger_rx,
            acks: ack_rx,
        },
        options.clone(),
    ));

    let mut deadline =
        CancellableTimer::new(effective_duration(options.max_duration, trigger.duration));
    result.record_started();

    let mut pulses = Some(pulse_rx);
    let mut interrupt = Some(interrupts.subscribe());
    let iteration = AtomicU64::new(0);
    let mut warned_dropping = false;

    loop {
        tokio::select! {
            received = recv_or_pending(&mut interrupt) => {
                if received.is_some() {
                    println!("{}", result.interrupted());
                    // Users watching a shutdown get updates at the fast
                    // cadence again.
                    progress.restart_rate();
                    // Stop listening; a second signal falls through to the
                    // platform handler.
                    interrupts.unsubscribe();
                    interrupt = None;
                    deadline.cancel();
                }
            }
            fired = deadline.elapsed() => {
                // A cancelled deadline also lands here: the interrupt path and
                // the last-iteration path collapse it to reuse this shutdown.
                // Only a deadline that actually fired is a duration transition.
                if fired {
                    let announcement = result.max_duration_elapsed();
                    if !announcement.is_empty() {
                        println!("{announcement}");
                    }
                }
                tracing::info!("stopping workers");
                break;
            }
            received = recv_or_pending(&mut pulses) => {
                if received.is_some() {
                    admit(
                        options,
                        &shared,
                        &iteration,
                        &dispatch_tx,
                        &deadline,
                        &metrics,
                        &mut warned_dropping,
                    )
                    .await;
                }
            }
        }
    }

    // Admitted work is never silently discarded: give workers the moment they
    // need to collect anything already dispatched. Queued indices only exist
    // while a worker is free to take them, so this drains in microseconds.
    while dispatch_tx.capacity() < workers {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let _ = stop_trigger_tx.try_send(());
    let _ = stop_workers_tx.send(true);
    for err in pool.join().await {
        result.add_error(Error::Join(err));
    }

    let failures = shared.failures.load(Ordering::Relaxed);
    if failures > 0 {
        tracing::warn!(failures, "iterations reported failures");
    }

    // A trigger stuck mid-send observes the closed pulse channel even if it
    // missed the stop message.
    drop(pulses);
    drop(dispatch_tx);
    if let Err(err) = trigger_task.await {
        result.add_error(Error::Join(err));
    }

    interrupts.unsubscribe();
    result.record_test_finished();
}

async fn admit(
    options: &RunOptions,
    shared: &WorkerShared,
    iteration: &AtomicU64,
    dispatch: &mpsc::Sender<u64>,
    deadline: &CancellableTimer,
    metrics: &IterationMetrics,
    warned_dropping: &mut bool,
) {
    if shared.busy.load(Ordering::SeqCst) >= options.concurrency {
        metrics.record_dropped();
        if !*warned_dropping {
            *warned_dropping = true;
            tracing::warn!(
                "dropping iterations because all workers are busy; consider raising `concurrency`"
            );
        }
        return;
    }

    let iteration = iteration.fetch_add(1, Ordering::SeqCst) + 1;
    let max = options.max_iterations;
    if max > 0 && iteration == max {
        let _ = dispatch.send(iteration).await;
        // The final iteration is in flight; the collapsed deadline becomes
        // the hard join.
        deadline.cancel();
    } else if max == 0 || iteration < max {
        let _ = dispatch.send(iteration).await;
    }
    // An index past the cap means a pulse raced the collapsed deadline; it is
    // deliberately not dispatched.
}
