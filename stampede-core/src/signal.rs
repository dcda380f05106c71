use std::io;

use tokio::sync::{mpsc, watch};

/// Source of run interrupts. The scheduler subscribes once at entry and
/// unsubscribes after the first interrupt (and again, idempotently, on exit),
/// so a second signal falls through to whatever handler the platform has
/// installed. Tests inject a synthetic implementation.
pub trait InterruptSource: Send + Sync {
    /// Begin listening. Interrupts arrive on the returned channel.
    fn subscribe(&self) -> mpsc::Receiver<()>;

    /// Stop forwarding signals. Idempotent.
    fn unsubscribe(&self);
}

/// Forwards SIGINT (and SIGTERM on unix) from the OS.
#[derive(Debug)]
pub struct OsSignals {
    stop: watch::Sender<bool>,
}

impl OsSignals {
    pub fn new() -> Self {
        let (stop, _) = watch::channel(false);
        Self { stop }
    }
}

impl Default for OsSignals {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn os_signal() -> io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        r = tokio::signal::ctrl_c() => r,
        _ = term.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn os_signal() -> io::Result<()> {
    tokio::signal::ctrl_c().await
}

impl InterruptSource for OsSignals {
    fn subscribe(&self) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel(1);
        let mut stop = self.stop.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    r = os_signal() => {
                        if r.is_err() || tx.send(()).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        rx
    }

    fn unsubscribe(&self) {
        let _ = self.stop.send(true);
    }
}
