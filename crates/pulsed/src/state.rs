//! Application state and shared resources.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::cluster::{ClusterStore, Crypt, LocalStatus};
use crate::config::AppConfig;
use crate::heartbeat::ticker::Ticker;
use crate::heartbeat::{HeartbeatDeps, HeartbeatManager};
use crate::relay::{HttpRelayChannel, RelaySlots};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Configuration currently applied (replaced on reload)
    pub config: Arc<RwLock<AppConfig>>,

    /// This node's name
    pub nodename: String,

    /// Last accepted status of every node
    pub store: ClusterStore,

    /// Running heartbeat instances
    pub heartbeats: Arc<HeartbeatManager>,

    /// Relay slots served by this node, when the relay service is enabled
    pub relay_slots: Option<RelaySlots>,

    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Build the shared state. Heartbeats are not started here.
    pub fn new(config: AppConfig) -> Result<Self> {
        let crypt = Crypt::new(&config.cluster.name)
            .with_secret(&config.cluster.name, &config.cluster.secret);
        let store = ClusterStore::new();
        let status = LocalStatus::new(&config.nodename, &config.cluster.name);
        let relay_channel =
            HttpRelayChannel::new(&config.nodename).context("Failed to create relay client")?;

        let heartbeats = Arc::new(HeartbeatManager::new(HeartbeatDeps {
            crypt: Arc::new(crypt),
            store: store.clone(),
            status: Arc::new(status),
            ticker: Ticker::new(),
            relay_channel: Arc::new(relay_channel),
        }));

        let relay_slots = config
            .relay_service
            .enabled
            .then(|| RelaySlots::new(&config.relay_service.secret));

        Ok(Self {
            nodename: config.nodename.clone(),
            config: Arc::new(RwLock::new(config)),
            store,
            heartbeats,
            relay_slots,
            started_at: Utc::now(),
        })
    }

    /// Apply a freshly loaded configuration.
    ///
    /// Node name, cluster identity and the relay service are fixed for the
    /// lifetime of the process; changes to them are reported and ignored.
    pub async fn reload(&self, mut config: AppConfig) -> usize {
        let mut current = self.config.write().await;

        if config.nodename != current.nodename {
            tracing::warn!(
                current = %current.nodename,
                requested = %config.nodename,
                "Node name cannot change at runtime, keeping the current one"
            );
            config.nodename = current.nodename.clone();
        }
        if config.cluster.name != current.cluster.name
            || config.cluster.secret != current.cluster.secret
        {
            tracing::warn!("Cluster name and secret cannot change at runtime, restart to apply");
            config.cluster.name = current.cluster.name.clone();
            config.cluster.secret = current.cluster.secret.clone();
        }

        let running = self.heartbeats.reload(&config).await;
        *current = config;

        tracing::info!(heartbeats = running, "Configuration reloaded");
        running
    }
}
