use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// One step of a cadence: starting at `start` of elapsed run time, fire every
/// `period`.
#[derive(Debug, Clone, Copy)]
pub struct Rate {
    pub start: Duration,
    pub period: Duration,
}

impl Rate {
    pub fn new(start: Duration, period: Duration) -> Self {
        Self { start, period }
    }
}

pub type RateCallback = Arc<dyn Fn(Duration, Instant) + Send + Sync>;

#[derive(Debug)]
enum Command {
    Restart,
    Stop,
}

/// Fires a callback on a schedule whose period changes at configured
/// elapsed-time thresholds. Callbacks run inline on the runner task and are
/// therefore never concurrent with themselves; a callback that overruns its
/// period delays the next firing.
pub struct RateRunner {
    cb: RateCallback,
    rates: Vec<Rate>,
    control: Option<mpsc::Sender<Command>>,
    handle: Option<JoinHandle<()>>,
}

impl RateRunner {
    pub fn new(cb: RateCallback, mut rates: Vec<Rate>) -> Self {
        rates.sort_by_key(|r| r.start);
        rates.retain(|r| r.period > Duration::ZERO);
        Self {
            cb,
            rates,
            control: None,
            handle: None,
        }
    }

    fn period_at(rates: &[Rate], elapsed: Duration) -> Option<Duration> {
        rates
            .iter()
            .rev()
            .find(|r| r.start <= elapsed)
            .or_else(|| rates.first())
            .map(|r| r.period)
    }

    /// Start firing. A second call while running is a no-op.
    pub fn run(&mut self) {
        if self.handle.is_some() {
            return;
        }

        let (tx, mut rx) = mpsc::channel(4);
        let cb = self.cb.clone();
        let rates = self.rates.clone();

        self.control = Some(tx);
        self.handle = Some(tokio::spawn(async move {
            let mut epoch = Instant::now();
            loop {
                let Some(period) = Self::period_at(&rates, epoch.elapsed()) else {
                    // No usable rates configured; wait for termination.
                    match rx.recv().await {
                        Some(Command::Restart) => {
                            epoch = Instant::now();
                            continue;
                        }
                        Some(Command::Stop) | None => return,
                    }
                };

                tokio::select! {
                    _ = tokio::time::sleep(period) => {
                        cb(period, Instant::now());
                    }
                    cmd = rx.recv() => match cmd {
                        Some(Command::Restart) => epoch = Instant::now(),
                        Some(Command::Stop) | None => return,
                    },
                }
            }
        }));
    }

    /// Reset elapsed time to zero without stopping, so the first configured
    /// period applies again immediately.
    pub fn restart_rate(&self) {
        if let Some(control) = &self.control {
            let _ = control.try_send(Command::Restart);
        }
    }

    /// Stop firing. Returns only after any in-flight callback has completed.
    pub async fn terminate(&mut self) {
        if let Some(control) = self.control.take() {
            let _ = control.send(Command::Stop).await;
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}
