//! Relay heartbeat (store-and-forward)
//!
//! The sender overwrites the local node's slot on the relay once per period.
//! The receiver reads every peer's slot once per period. Envelopes go through
//! the relay sealed; it only ever sees ciphertext.

use pulse_common::{NodeStatus, RelayRequest, Role};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::base::HeartbeatBase;
use super::settings::{HeartbeatSettings, TransportSettings};
use super::ticker::Ticker;
use super::{Reception, commit_status};
use crate::cluster::{ClusterStore, Crypt, Identity, StatusSource};
use crate::relay::RelayChannel;

/// Relay target and secret, None when the settings are not relay settings
fn relay_target(settings: &HeartbeatSettings) -> Option<(&str, &str)> {
    match &settings.transport {
        TransportSettings::Relay { relay, secret } => Some((relay.as_str(), secret.as_str())),
        TransportSettings::Unicast => None,
    }
}

/// Writes the local status into its relay slot
pub struct RelaySender {
    base: Arc<HeartbeatBase>,
    crypt: Arc<Crypt>,
    status: Arc<dyn StatusSource>,
    channel: Arc<dyn RelayChannel>,
    ticker: Arc<Ticker>,
}

impl RelaySender {
    pub fn new(
        settings: HeartbeatSettings,
        crypt: Arc<Crypt>,
        status: Arc<dyn StatusSource>,
        channel: Arc<dyn RelayChannel>,
        ticker: Arc<Ticker>,
    ) -> Self {
        let base = Arc::new(HeartbeatBase::new(Role::Tx, settings.clone()));
        base.configure(settings);
        Self {
            base,
            crypt,
            status,
            channel,
            ticker,
        }
    }

    pub fn base(&self) -> &Arc<HeartbeatBase> {
        &self.base
    }

    pub async fn run(&self) {
        self.base.start();
        let mut shutdown = self.base.shutdown_signal();

        loop {
            self.beat().await;

            let interval = self.base.settings().interval;
            if !self.ticker.wait(interval, &mut shutdown).await {
                break;
            }
        }

        self.base.finish();
    }

    pub async fn beat(&self) {
        let settings = self.base.settings();
        let Some((relay, secret)) = relay_target(&settings) else {
            return;
        };

        let status = self.status.build_status();
        let msg = match self
            .crypt
            .encrypt(&settings.cluster_name, &settings.nodename, &status)
        {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::error!(heartbeat = %self.base.id(), error = %e, "Failed to seal heartbeat");
                self.base.push_stats(0, true);
                return;
            }
        };
        let len = msg.len();

        let request = RelayRequest::RelayTx { msg };
        let failure = match self.channel.send(&request, relay, secret).await {
            Some(response) if response.is_ok() => None,
            Some(response) => Some(format!(
                "status {}: {}",
                response.status,
                response.error.unwrap_or_default()
            )),
            None => Some("no response".to_string()),
        };

        match failure {
            None => {
                self.base.record_attempt(relay);
                if self.base.record_success(relay) {
                    tracing::info!(heartbeat = %self.base.id(), relay = %relay, "Relay write recovered");
                }
                self.base.push_stats(len, false);
            }
            Some(reason) => {
                if self.base.record_failure(relay) {
                    tracing::warn!(
                        heartbeat = %self.base.id(),
                        relay = %relay,
                        reason = %reason,
                        "Relay write failed"
                    );
                }
                self.base.push_stats(0, true);
            }
        }
        self.base.record_beat(relay);
    }
}

/// Reads peer slots from the relay
pub struct RelayReceiver {
    base: Arc<HeartbeatBase>,
    crypt: Arc<Crypt>,
    store: ClusterStore,
    channel: Arc<dyn RelayChannel>,
    ticker: Arc<Ticker>,
    /// Last marker seen per sender. Slots are re-read every period, so the
    /// same envelope comes back until its owner writes again.
    last_updated: Mutex<HashMap<String, i64>>,
}

impl RelayReceiver {
    pub fn new(
        settings: HeartbeatSettings,
        crypt: Arc<Crypt>,
        store: ClusterStore,
        channel: Arc<dyn RelayChannel>,
        ticker: Arc<Ticker>,
    ) -> Self {
        let base = Arc::new(HeartbeatBase::new(Role::Rx, settings.clone()));
        base.configure(settings);
        Self {
            base,
            crypt,
            store,
            channel,
            ticker,
            last_updated: Mutex::new(HashMap::new()),
        }
    }

    pub fn base(&self) -> &Arc<HeartbeatBase> {
        &self.base
    }

    pub async fn run(&self) {
        self.base.start();
        let mut shutdown = self.base.shutdown_signal();

        loop {
            self.poll().await;

            let interval = self.base.settings().interval;
            if !self.ticker.wait(interval, &mut shutdown).await {
                break;
            }
        }

        self.base.finish();
    }

    /// Read every known peer's slot once
    pub async fn poll(&self) {
        let settings = self.base.settings();
        let Some((relay, secret)) = relay_target(&settings) else {
            return;
        };

        let mut slots: Vec<String> = settings.peer_names().map(str::to_string).collect();
        for node in self.store.observed_members().await {
            if node != settings.nodename && !slots.contains(&node) {
                slots.push(node);
            }
        }

        for slot in slots {
            if self.base.stopped() {
                break;
            }

            let request = RelayRequest::RelayRx { slot: slot.clone() };
            match self.channel.send(&request, relay, secret).await {
                Some(response) if response.is_ok() => {
                    if let Some(data) = response.data {
                        self.receive(&slot, &data).await;
                    }
                }
                Some(response) => {
                    tracing::debug!(
                        heartbeat = %self.base.id(),
                        slot = %slot,
                        status = response.status,
                        "Relay read refused"
                    );
                }
                None => {
                    tracing::debug!(heartbeat = %self.base.id(), slot = %slot, "Relay read got no response");
                }
            }
            self.base.record_beat(&slot);
        }
    }

    /// Process the content of one slot
    pub(crate) async fn receive(&self, slot: &str, data: &str) -> Reception {
        let settings = self.base.settings();

        let Some(message) = self.crypt.decrypt::<NodeStatus>(data.as_bytes(), Some(slot)) else {
            self.base.push_stats(data.len(), true);
            self.base.record_attempt(slot);
            return Reception::Rejected;
        };

        let sender = message.sender;
        if sender == settings.nodename {
            self.base.push_stats(data.len(), false);
            return Reception::Ignored;
        }

        if let Identity::Mismatch { expected } = &message.identity {
            tracing::warn!(
                heartbeat = %self.base.id(),
                slot = %expected,
                sender = %sender,
                "Relay slot holds another node's status, keying it under the sender"
            );
        }

        self.base.record_attempt(&sender);

        let updated = message.payload.updated;
        let fresh = {
            let mut last = self.last_updated.lock().await;
            if last.get(&sender).is_some_and(|seen| *seen >= updated) {
                false
            } else {
                last.insert(sender.clone(), updated);
                true
            }
        };

        let outcome = if fresh && commit_status(&self.store, &sender, message.payload, self.base.id()).await
        {
            self.base.record_success(&sender);
            Reception::Accepted(sender.clone())
        } else {
            Reception::Duplicate(sender.clone())
        };

        if sender != slot {
            self.base.record_beat(&sender);
        }
        self.base.push_stats(data.len(), false);

        outcome
    }
}
