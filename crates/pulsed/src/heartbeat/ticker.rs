//! Shared wake-up primitive for heartbeat tasks.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, watch};

/// Period timer shared by every heartbeat task.
///
/// Each task sleeps for its own period; `kick` wakes all of them at once for
/// an out-of-band heartbeat burst.
#[derive(Default)]
pub struct Ticker {
    notify: Notify,
}

impl Ticker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Wake every waiting task now
    pub fn kick(&self) {
        tracing::debug!("Heartbeat burst requested");
        self.notify.notify_waiters();
    }

    /// Wait for the next tick. Returns false when shutdown was requested.
    pub async fn wait(&self, period: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
        if *shutdown.borrow() {
            return false;
        }

        tokio::select! {
            _ = tokio::time::sleep(period) => true,
            _ = self.notify.notified() => true,
            _ = shutdown_requested(shutdown) => false,
        }
    }
}

/// Resolves once the shutdown flag is raised (or its sender is gone)
pub async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
