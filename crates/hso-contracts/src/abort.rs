use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// Abort signal shared between a cycle and every stage call it makes.
#[derive(Clone, Debug)]
pub struct AbortSignal {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolves once the signal is aborted. Returns immediately if it already is.
    pub async fn aborted(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_aborted() {
                return;
            }
            notified.await;
        }
    }

    fn abort(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

/// Abort controller that owns the underlying signal.
#[derive(Clone, Debug)]
pub struct AbortController {
    signal: AbortSignal,
}

impl AbortController {
    pub fn new() -> Self {
        Self {
            signal: AbortSignal {
                flag: Arc::new(AtomicBool::new(false)),
                notify: Arc::new(Notify::new()),
            },
        }
    }

    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    pub fn abort(&self) {
        self.signal.abort();
    }

    pub fn is_aborted(&self) -> bool {
        self.signal.is_aborted()
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn waiters_wake_on_abort() {
        let controller = AbortController::new();
        let signal = controller.signal();
        let waiter = tokio::spawn(async move {
            signal.aborted().await;
            true
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        controller.abort();
        let woke = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter finished")
            .expect("join");
        assert!(woke);
    }

    #[tokio::test]
    async fn already_aborted_returns_immediately() {
        let controller = AbortController::new();
        controller.abort();
        tokio::time::timeout(Duration::from_millis(50), controller.signal().aborted())
            .await
            .expect("no wait when already aborted");
        assert!(controller.signal().is_aborted());
    }
}
