//! Keep-alive accounting
//!
//! Every activity that must keep the control loop running (a pending receive,
//! a scheduled callback, output that has not been flushed yet) holds one
//! reference. The loop exits once the count drops back to zero.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::{trace, warn};

#[derive(Default)]
struct Inner {
    count: AtomicUsize,
    idle: Notify,
}

/// Shared reference counter for outstanding activity
#[derive(Clone, Default)]
pub struct KeepAlive {
    inner: Arc<Inner>,
}

impl KeepAlive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self) {
        let previous = self.inner.count.fetch_add(1, Ordering::AcqRel);
        trace!("keep-alive acquired ({} -> {})", previous, previous + 1);
    }

    /// Release one reference. Releasing at zero is logged and ignored.
    pub fn release(&self) {
        let result = self
            .inner
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match result {
            Ok(1) => {
                trace!("keep-alive idle");
                self.inner.idle.notify_waiters();
            }
            Ok(previous) => trace!("keep-alive released ({} -> {})", previous, previous - 1),
            Err(_) => warn!("keep-alive released more often than acquired"),
        }
    }

    /// Hold a reference until the guard is dropped
    pub fn guard(&self) -> KeepAliveGuard {
        self.acquire();
        KeepAliveGuard { owner: self.clone() }
    }

    pub fn count(&self) -> usize {
        self.inner.count.load(Ordering::Acquire)
    }

    pub fn is_idle(&self) -> bool {
        self.count() == 0
    }

    /// Resolve once the count is zero
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            // Register before checking so a release in between is not missed
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for KeepAlive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeepAlive").field("count", &self.count()).finish()
    }
}

/// RAII reference on a [`KeepAlive`]
#[derive(Debug)]
pub struct KeepAliveGuard {
    owner: KeepAlive,
}

impl Drop for KeepAliveGuard {
    fn drop(&mut self) {
        self.owner.release();
    }
}
