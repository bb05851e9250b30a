//! In-flight connection accounting.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::warn;

/// Concurrency-safe counter of open connections.
///
/// Incremented when the accept loop hands a connection to the engine and
/// decremented when that connection closes or is hijacked (upgraded away from
/// HTTP). `wait` resolves once the count is observed at zero.
#[derive(Debug, Clone, Default)]
pub struct ConnTracker {
    inner: Arc<TrackerInner>,
}

#[derive(Debug, Default)]
struct TrackerInner {
    active: AtomicUsize,
    idle: Notify,
}

impl ConnTracker {
    /// Create a tracker with no open connections.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly opened connection.
    pub fn on_open(&self) {
        self.inner.active.fetch_add(1, Ordering::AcqRel);
    }

    /// Record a connection that closed or was hijacked.
    pub fn on_close(&self) {
        let previous = self
            .inner
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));

        match previous {
            Ok(1) => self.inner.idle.notify_waiters(),
            Ok(_) => {}
            Err(_) => warn!("connection close recorded with no open connections"),
        }
    }

    /// Record an open connection and return a guard that records its close on drop.
    pub fn track(&self) -> ConnGuard {
        self.on_open();
        ConnGuard {
            tracker: self.clone(),
        }
    }

    /// Number of connections currently open.
    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Wait until no connections are open.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            // Register before checking so a close racing the load is not missed.
            notified.as_mut().enable();

            if self.active() == 0 {
                return;
            }

            notified.await;
        }
    }
}

/// Keeps one connection counted as open for as long as it lives.
#[derive(Debug)]
pub struct ConnGuard {
    tracker: ConnTracker,
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.tracker.on_close();
    }
}
