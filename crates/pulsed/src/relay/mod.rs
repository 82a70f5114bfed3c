//! Relay request channel and slot service.
//!
//! A relay node keeps one slot per cluster node. Each node overwrites its own
//! slot with its latest envelope (`relay_tx`) and polls its peers' slots
//! (`relay_rx`). The relay never opens envelopes: slot content is opaque
//! text, readable only by holders of the cluster secret.

mod client;

pub use client::HttpRelayChannel;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pulse_common::{RelayRequest, RelayResponse};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Request/response channel to a relay node.
///
/// Any transport failure (unreachable relay, timeout, undecodable reply)
/// yields None; callers treat it as "nothing this tick".
#[async_trait]
pub trait RelayChannel: Send + Sync {
    async fn send(&self, request: &RelayRequest, relay: &str, secret: &str)
    -> Option<RelayResponse>;
}

/// Status codes of the slot service
pub mod status {
    pub const BAD_REQUEST: i32 = 1;
    pub const UNAUTHORIZED: i32 = 2;
}

#[derive(Debug, Clone)]
struct Slot {
    msg: String,
    updated_at: DateTime<Utc>,
}

/// Exported slot metadata, content excluded
#[derive(Debug, Clone, Serialize)]
pub struct SlotInfo {
    pub len: usize,
    pub updated_at: DateTime<Utc>,
}

/// Slot storage served by a relay node
#[derive(Clone)]
pub struct RelaySlots {
    slots: Arc<RwLock<HashMap<String, Slot>>>,
    secret_digest: [u8; 32],
}

impl RelaySlots {
    pub fn new(secret: &str) -> Self {
        Self {
            slots: Arc::new(RwLock::new(HashMap::new())),
            secret_digest: Sha256::digest(secret.as_bytes()).into(),
        }
    }

    /// Check the secret presented by a client
    pub fn authorize(&self, presented: &str) -> bool {
        let digest: [u8; 32] = Sha256::digest(presented.as_bytes()).into();
        // Fixed-length digests, compared without early exit
        digest
            .iter()
            .zip(self.secret_digest.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }

    /// Serve one request from `requester`. A node only ever writes its own
    /// slot.
    pub async fn handle(&self, requester: &str, request: RelayRequest) -> RelayResponse {
        match request {
            RelayRequest::RelayTx { msg } => {
                if requester.is_empty() {
                    return RelayResponse::error(status::BAD_REQUEST, "missing node name");
                }
                if msg.is_empty() {
                    return RelayResponse::error(status::BAD_REQUEST, "empty message");
                }

                let slot = Slot {
                    msg,
                    updated_at: Utc::now(),
                };
                self.slots.write().await.insert(requester.to_string(), slot);
                tracing::trace!(slot = %requester, "Relay slot written");
                RelayResponse::ok()
            }
            RelayRequest::RelayRx { slot } => {
                let data = self.slots.read().await.get(&slot).map(|s| s.msg.clone());
                RelayResponse::with_data(data)
            }
        }
    }

    pub async fn slots(&self) -> BTreeMap<String, SlotInfo> {
        self.slots
            .read()
            .await
            .iter()
            .map(|(name, slot)| {
                (
                    name.clone(),
                    SlotInfo {
                        len: slot.msg.len(),
                        updated_at: slot.updated_at,
                    },
                )
            })
            .collect()
    }
}

/// In-process channel straight into a `RelaySlots`
#[cfg(test)]
pub(crate) struct LocalRelayChannel {
    pub slots: RelaySlots,
    pub nodename: String,
    /// Simulate an unreachable relay
    pub offline: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl LocalRelayChannel {
    pub fn new(slots: RelaySlots, nodename: &str) -> Self {
        Self {
            slots,
            nodename: nodename.to_string(),
            offline: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline
            .store(offline, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
#[async_trait]
impl RelayChannel for LocalRelayChannel {
    async fn send(
        &self,
        request: &RelayRequest,
        _relay: &str,
        secret: &str,
    ) -> Option<RelayResponse> {
        if self.offline.load(std::sync::atomic::Ordering::SeqCst) {
            return None;
        }
        if !self.slots.authorize(secret) {
            return Some(RelayResponse::error(status::UNAUTHORIZED, "bad secret"));
        }
        Some(self.slots.handle(&self.nodename, request.clone()).await)
    }
}
