//! Local status source.
//!
//! Builds the snapshot a node publishes on every heartbeat period.

use chrono::{DateTime, Utc};
use pulse_common::NodeStatus;
use std::sync::atomic::{AtomicI64, Ordering};

/// Builds the local node status once per heartbeat period
pub trait StatusSource: Send + Sync {
    fn build_status(&self) -> NodeStatus;
}

/// Status of the running daemon
pub struct LocalStatus {
    nodename: String,
    cluster_name: String,
    started_at: DateTime<Utc>,
    /// Last marker handed out
    last_marker: AtomicI64,
}

impl LocalStatus {
    pub fn new(nodename: impl Into<String>, cluster_name: impl Into<String>) -> Self {
        Self {
            nodename: nodename.into(),
            cluster_name: cluster_name.into(),
            started_at: Utc::now(),
            last_marker: AtomicI64::new(0),
        }
    }

    /// Strictly increasing marker, following the wall clock when it moves
    /// forward and bumping by one when it does not.
    fn next_marker(&self) -> i64 {
        let now = Utc::now().timestamp_micros();
        let prev = self
            .last_marker
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| {
                Some(now.max(prev + 1))
            })
            .unwrap_or_default();
        now.max(prev + 1)
    }
}

impl StatusSource for LocalStatus {
    fn build_status(&self) -> NodeStatus {
        let uptime = (Utc::now() - self.started_at).num_seconds().max(0);
        NodeStatus {
            nodename: self.nodename.clone(),
            updated: self.next_marker(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: Some(self.started_at),
            data: serde_json::json!({
                "cluster": self.cluster_name,
                "uptime_secs": uptime,
            }),
        }
    }
}
