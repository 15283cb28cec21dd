use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;

use crate::error::{Error, Result};

/// Cooperative cancellation signal shared between a caller and a waiting operation.
///
/// Clones observe the same state. Cancellation is sticky.
#[derive(Clone, Debug)]
pub struct CancelToken {
    inner: Arc<CancelTokenInner>,
}

#[derive(Debug)]
struct CancelTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    /// Create a new, untriggered token.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Create a token that cancels itself once `after` has elapsed.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_timeout(after: Duration) -> Self {
        let token = Self::new();
        let timer = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            timer.cancel();
        });
        token
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Check if cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Fail with [`Error::Canceled`] if cancellation has been requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Canceled);
        }
        Ok(())
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Register before re-checking the flag so a concurrent cancel is not missed.
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }

    /// Sleep for `duration`, returning early with [`Error::Canceled`] on cancellation.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(Error::Canceled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
