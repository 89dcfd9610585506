//! Per-connection quiescence primitive
//!
//! Every write path into a connection holds an [`ActivityGuard`]. The close
//! routine waits, bounded, until no guard is alive before it tears the
//! connection down.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Inner {
    active: AtomicUsize,
    idle: Notify,
}

/// Counts operations currently writing to one connection
#[derive(Debug, Clone, Default)]
pub struct ActivityCounter {
    inner: Arc<Inner>,
}

impl ActivityCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the start of an operation; it ends when the guard drops
    pub fn enter(&self) -> ActivityGuard {
        self.inner.active.fetch_add(1, Ordering::AcqRel);
        ActivityGuard {
            inner: self.inner.clone(),
        }
    }

    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    pub fn is_idle(&self) -> bool {
        self.active() == 0
    }

    /// Wait until no operation is active.
    ///
    /// Returns false if `timeout` elapsed first.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            // register before checking so a release in between is not missed
            notified.as_mut().enable();

            if self.is_idle() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.is_idle();
            }
        }
    }
}

/// RAII marker of one active operation
#[derive(Debug)]
pub struct ActivityGuard {
    inner: Arc<Inner>,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        if self.inner.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}
