use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use stampede_core::{InterruptSource, Trigger};

/// Trigger firing one pulse per `period`, plus a flag that flips once the
/// trigger behavior has returned (used to prove clean shutdown).
pub fn every(period: Duration, duration: Duration, description: &str) -> (Trigger, Arc<AtomicBool>) {
    let returned = Arc::new(AtomicBool::new(false));
    let flag = returned.clone();

    let trigger = Trigger::new(description, duration, move |mut ch, _opts| {
        let returned = flag.clone();
        async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ch.stop.recv() => break,
                    _ = interval.tick() => {
                        tokio::select! {
                            _ = ch.stop.recv() => break,
                            sent = ch.pulses.send(()) => {
                                if sent.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
            }
            returned.store(true, Ordering::SeqCst);
        }
    });

    (trigger, returned)
}

/// Trigger that paces itself off worker acks: one pulse, then wait for the
/// matching completion before the next. Produces strictly sequential
/// iterations with no drops.
pub fn ack_paced(description: &str) -> Trigger {
    Trigger::new(description, Duration::ZERO, |mut ch, _opts| async move {
        loop {
            tokio::select! {
                _ = ch.stop.recv() => return,
                sent = ch.pulses.send(()) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
            tokio::select! {
                _ = ch.stop.recv() => return,
                ack = ch.acks.recv() => {
                    if ack.is_none() {
                        return;
                    }
                }
            }
        }
    })
}

/// Interrupt source driven by the test instead of the OS.
pub struct SyntheticInterrupts {
    tx: mpsc::Sender<()>,
    rx: Mutex<Option<mpsc::Receiver<()>>>,
    unsubscribed: AtomicBool,
}

impl SyntheticInterrupts {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::channel(1);
        Arc::new(Self {
            tx,
            rx: Mutex::new(Some(rx)),
            unsubscribed: AtomicBool::new(false),
        })
    }

    pub async fn interrupt(&self) {
        let _ = self.tx.send(()).await;
    }

    pub fn was_unsubscribed(&self) -> bool {
        self.unsubscribed.load(Ordering::SeqCst)
    }
}

impl InterruptSource for SyntheticInterrupts {
    fn subscribe(&self) -> mpsc::Receiver<()> {
        self.rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .expect("subscribe called twice in one run")
    }

    fn unsubscribe(&self) {
        self.unsubscribed.store(true, Ordering::SeqCst);
    }
}

/// Shared counter bumped by scenario stages.
pub fn counter() -> Arc<AtomicU64> {
    Arc::new(AtomicU64::new(0))
}
