use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};

#[derive(Debug, Default)]
struct CancelFlag {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelFlag {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    async fn wait(&self) {
        while !self.cancelled.load(Ordering::Acquire) {
            self.notify.notified().await;
        }
    }
}

/// Cancels a [`CancellableTimer`] from elsewhere. Handles are cheap to clone
/// and cancellation is idempotent.
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<CancelFlag>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.cancel();
    }
}

/// A one-shot deadline. The completion signal resolves when the deadline
/// fires, and also when the timer is cancelled before firing: a cancelled
/// timer sends nothing, but dropping the sender unblocks the waiting reader.
/// The scheduler's interrupt and last-iteration paths both lean on this to
/// route shutdown through the single deadline branch.
#[derive(Debug)]
pub struct CancellableTimer {
    flag: Arc<CancelFlag>,
    rx: mpsc::Receiver<()>,
}

impl CancellableTimer {
    /// `deadline` of `None` never fires on its own; only `cancel` resolves it.
    pub fn new(deadline: Option<Duration>) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let flag = Arc::new(CancelFlag::default());
        let task_flag = flag.clone();

        tokio::spawn(async move {
            let sleep = async {
                match deadline {
                    Some(d) => tokio::time::sleep(d).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                _ = sleep => {
                    let _ = tx.send(()).await;
                }
                _ = task_flag.wait() => {}
                _ = tx.closed() => {}
            }
        });

        Self { flag, rx }
    }

    /// Resolves once the deadline fires or the timer is cancelled. Returns
    /// whether the deadline actually fired.
    pub async fn elapsed(&mut self) -> bool {
        self.rx.recv().await.is_some()
    }

    pub fn cancel(&self) {
        self.flag.cancel();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.flag.clone())
    }
}
