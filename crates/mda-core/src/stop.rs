//! Cooperative stop flag shared between the engine and its callers.

use crate::error::{AcqError, AcqResult};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Inner {
    requested: AtomicBool,
    notify: Notify,
}

/// Clonable stop request flag.
///
/// Checked between events; long waits race against [`StopSignal::wait`] so
/// they can be abandoned with [`AcqError::Interrupted`].
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    inner: Arc<Inner>,
}

impl StopSignal {
    /// New, unrequested signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a stop and wakes every waiter.
    pub fn request(&self) {
        self.inner.requested.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Whether a stop has been requested.
    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// Clears the flag before a new run.
    pub fn reset(&self) {
        self.inner.requested.store(false, Ordering::SeqCst);
    }

    /// Resolves once a stop is requested.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_requested() {
                return;
            }
            notified.await;
        }
    }

    /// Runs `fut` unless a stop arrives first.
    pub async fn guard<T>(&self, fut: impl Future<Output = T>) -> AcqResult<T> {
        if self.is_requested() {
            return Err(AcqError::Interrupted);
        }
        tokio::select! {
            biased;
            () = self.wait() => Err(AcqError::Interrupted),
            value = fut => Ok(value),
        }
    }
}
