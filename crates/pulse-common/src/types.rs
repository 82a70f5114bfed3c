//! Core types shared across Pulse components.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Heartbeat transport kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeartbeatKind {
    /// Point-to-point TCP, one connection per peer per period
    Unicast,
    /// Store-and-forward through a relay node
    Relay,
}

impl fmt::Display for HeartbeatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unicast => write!(f, "unicast"),
            Self::Relay => write!(f, "relay"),
        }
    }
}

/// Direction of a heartbeat task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Tx,
    Rx,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tx => write!(f, "tx"),
            Self::Rx => write!(f, "rx"),
        }
    }
}

/// Status snapshot a node publishes to its peers.
///
/// `updated` is a per-sender monotonically increasing marker (microseconds
/// since the epoch). Receivers use it to drop duplicate and out-of-order
/// deliveries; the wall clock of the receiver plays no part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    /// Publishing node
    pub nodename: String,

    /// Monotonic update marker
    pub updated: i64,

    /// Daemon version of the publisher
    #[serde(default)]
    pub version: String,

    /// When the publishing daemon started
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// Opaque status body consumed by higher layers
    #[serde(default)]
    pub data: serde_json::Value,
}

impl NodeStatus {
    pub fn new(nodename: impl Into<String>, updated: i64) -> Self {
        Self {
            nodename: nodename.into(),
            updated,
            version: String::new(),
            started_at: None,
            data: serde_json::Value::Null,
        }
    }
}

/// Request carried over the relay request channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "options", rename_all = "snake_case")]
pub enum RelayRequest {
    /// Write the requester's own slot
    RelayTx { msg: String },
    /// Read a named slot
    RelayRx { slot: String },
}

impl RelayRequest {
    pub fn action(&self) -> &'static str {
        match self {
            Self::RelayTx { .. } => "relay_tx",
            Self::RelayRx { .. } => "relay_rx",
        }
    }
}

/// Response of the relay request channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayResponse {
    /// 0 on success
    pub status: i32,

    /// Slot content for `relay_rx`, None when the slot is empty
    #[serde(default)]
    pub data: Option<String>,

    /// Failure reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RelayResponse {
    pub fn ok() -> Self {
        Self {
            status: 0,
            data: None,
            error: None,
        }
    }

    pub fn with_data(data: Option<String>) -> Self {
        Self {
            status: 0,
            data,
            error: None,
        }
    }

    pub fn error(status: i32, reason: impl Into<String>) -> Self {
        Self {
            status,
            data: None,
            error: Some(reason.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == 0
    }
}

/// Lifecycle of a heartbeat task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Created,
    Configured,
    Running,
    Stopping,
    Stopped,
}

/// Aggregate heartbeat counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub beats: u64,
    pub bytes: u64,
    pub errors: u64,
}

/// Exported per-peer liveness
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<DateTime<Utc>>,
    /// Raw wire activity inside the timeout window
    pub beating: bool,
    /// Successful receipt inside the timeout window
    pub up: bool,
}

/// Status export of one heartbeat task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSnapshot {
    /// Task identifier, e.g. `hb#1.tx`
    pub id: String,
    pub kind: HeartbeatKind,
    pub role: Role,
    pub state: LifecycleState,
    pub stats: StatsSnapshot,
    /// Effective settings (timeout plus role specific values)
    pub config: serde_json::Value,
    pub peers: BTreeMap<String, PeerSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_request_wire_form() {
        let req = RelayRequest::RelayRx {
            slot: "node-2".to_string(),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["action"], "relay_rx");
        assert_eq!(json["options"]["slot"], "node-2");
        assert_eq!(req.action(), "relay_rx");
    }

    #[test]
    fn test_relay_response_empty_slot() {
        let resp: RelayResponse = serde_json::from_str(r#"{"status":0,"data":null}"#).unwrap();
        assert!(resp.is_ok());
        assert!(resp.data.is_none());

        let resp: RelayResponse = serde_json::from_str(r#"{"status":1}"#).unwrap();
        assert!(!resp.is_ok());
    }

    #[test]
    fn test_node_status_defaults() {
        let status: NodeStatus =
            serde_json::from_str(r#"{"nodename":"node-1","updated":42}"#).unwrap();
        assert_eq!(status.nodename, "node-1");
        assert_eq!(status.updated, 42);
        assert!(status.data.is_null());
        assert!(status.started_at.is_none());
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(HeartbeatKind::Unicast.to_string(), "unicast");
        assert_eq!(Role::Rx.to_string(), "rx");
    }
}
