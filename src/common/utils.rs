//! Small shared utilities: poll delay growth and cooperative cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tokio::sync::Notify;

/// Growing delay for result polling. The first wait uses the initial
/// delay; every subsequent wait is multiplied up to the maximum.
pub struct Backoff {
    delay: Duration,
    multiplier: f64,
    maximum: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, multiplier: f64, maximum: Duration) -> Self {
        Self {
            delay: initial,
            multiplier,
            maximum,
        }
    }

    pub async fn wait(&mut self) {
        debug!("backoff sleeping {:?}", self.delay);
        tokio::time::sleep(self.delay).await;
        self.delay = std::cmp::min(self.maximum, self.delay.mul_f64(self.multiplier));
    }
}

/// Cancellation signal, distinct from failure. The lease renewal loops
/// use this to abort the main coordinator task when a node lease is lost.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel` has been called; never before.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}
