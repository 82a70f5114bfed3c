//! Heartbeat transports and their supervisor.
//!
//! Every `[[heartbeat]]` section becomes one instance made of a sender task
//! and a receiver task. A section that fails to configure is logged and left
//! out; the other instances keep running.

pub mod base;
pub mod relay;
pub mod settings;
pub mod ticker;
pub mod unicast;

use pulse_common::{HeartbeatKind, NodeStatus, TransportSnapshot};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::cluster::{ClusterStateEntry, ClusterStore, Crypt, StatusSource};
use crate::config::AppConfig;
use crate::relay::RelayChannel;
use base::HeartbeatBase;
use relay::{RelayReceiver, RelaySender};
use settings::HeartbeatSettings;
use ticker::Ticker;
use unicast::{UnicastReceiver, UnicastSender};

/// Outcome of processing one received envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reception {
    /// Newer status stored for the sender
    Accepted(String),
    /// Marker not newer than the stored one
    Duplicate(String),
    /// Envelope did not open
    Rejected,
    /// Our own status came back
    Ignored,
}

/// Store `status` when its marker is newer than the stored one. The
/// comparison and the write happen under one store lock.
pub(crate) async fn commit_status(
    store: &ClusterStore,
    sender: &str,
    status: NodeStatus,
    via: &str,
) -> bool {
    let updated = status.updated;
    store
        .update(sender, |current| match current {
            Some(entry) if entry.updated >= updated => None,
            _ => Some(ClusterStateEntry::new(status, via)),
        })
        .await
}

/// Collaborators shared by every heartbeat task
#[derive(Clone)]
pub struct HeartbeatDeps {
    pub crypt: Arc<Crypt>,
    pub store: ClusterStore,
    pub status: Arc<dyn StatusSource>,
    pub ticker: Arc<Ticker>,
    pub relay_channel: Arc<dyn RelayChannel>,
}

enum Task {
    UnicastTx(Arc<UnicastSender>),
    UnicastRx(Arc<UnicastReceiver>),
    RelayTx(Arc<RelaySender>),
    RelayRx(Arc<RelayReceiver>),
}

impl Task {
    fn base(&self) -> &Arc<HeartbeatBase> {
        match self {
            Self::UnicastTx(t) => t.base(),
            Self::UnicastRx(t) => t.base(),
            Self::RelayTx(t) => t.base(),
            Self::RelayRx(t) => t.base(),
        }
    }

    fn spawn(&self) -> JoinHandle<()> {
        match self {
            Self::UnicastTx(t) => {
                let t = t.clone();
                tokio::spawn(async move { t.run().await })
            }
            Self::UnicastRx(t) => {
                let t = t.clone();
                tokio::spawn(async move { t.run().await })
            }
            Self::RelayTx(t) => {
                let t = t.clone();
                tokio::spawn(async move { t.run().await })
            }
            Self::RelayRx(t) => {
                let t = t.clone();
                tokio::spawn(async move { t.run().await })
            }
        }
    }
}

/// A running sender/receiver pair
struct Instance {
    kind: HeartbeatKind,
    tasks: Vec<(Task, JoinHandle<()>)>,
}

impl Instance {
    fn start(settings: HeartbeatSettings, deps: &HeartbeatDeps) -> Self {
        let kind = settings.kind();
        let tasks = match kind {
            HeartbeatKind::Unicast => vec![
                Task::UnicastTx(Arc::new(UnicastSender::new(
                    settings.clone(),
                    deps.crypt.clone(),
                    deps.status.clone(),
                    deps.store.clone(),
                    deps.ticker.clone(),
                ))),
                Task::UnicastRx(Arc::new(UnicastReceiver::new(
                    settings,
                    deps.crypt.clone(),
                    deps.store.clone(),
                ))),
            ],
            HeartbeatKind::Relay => vec![
                Task::RelayTx(Arc::new(RelaySender::new(
                    settings.clone(),
                    deps.crypt.clone(),
                    deps.status.clone(),
                    deps.relay_channel.clone(),
                    deps.ticker.clone(),
                ))),
                Task::RelayRx(Arc::new(RelayReceiver::new(
                    settings,
                    deps.crypt.clone(),
                    deps.store.clone(),
                    deps.relay_channel.clone(),
                    deps.ticker.clone(),
                ))),
            ],
        };

        let tasks = tasks
            .into_iter()
            .map(|task| {
                let handle = task.spawn();
                (task, handle)
            })
            .collect();

        Self { kind, tasks }
    }

    fn reconfigure(&self, settings: &HeartbeatSettings) {
        for (task, _) in &self.tasks {
            task.base().reconfigure(settings.clone());
        }
    }

    /// Request stop and wait for both tasks to exit
    async fn stop(self) {
        for (task, _) in &self.tasks {
            task.base().stop();
        }
        for (task, handle) in self.tasks {
            if let Err(e) = handle.await {
                tracing::error!(heartbeat = %task.base().id(), error = %e, "Heartbeat task panicked");
            }
        }
    }
}

/// Owns every heartbeat instance of the daemon
pub struct HeartbeatManager {
    deps: HeartbeatDeps,
    instances: Mutex<BTreeMap<String, Instance>>,
}

impl HeartbeatManager {
    pub fn new(deps: HeartbeatDeps) -> Self {
        Self {
            deps,
            instances: Mutex::new(BTreeMap::new()),
        }
    }

    fn build_settings(config: &AppConfig) -> Vec<HeartbeatSettings> {
        config
            .heartbeats
            .iter()
            .filter_map(|section| {
                match HeartbeatSettings::from_section(section, &config.cluster, &config.nodename) {
                    Ok(settings) => Some(settings),
                    Err(e) => {
                        tracing::error!(heartbeat = %section.name, error = %e, "Heartbeat not started");
                        None
                    }
                }
            })
            .collect()
    }

    /// Start every configured instance. Returns how many are running.
    pub async fn start(&self, config: &AppConfig) -> usize {
        self.deps.store.configure_members(config.cluster_nodes()).await;

        if let Err(e) = self.deps.crypt.ensure_ready() {
            tracing::error!(error = %e, "Cannot seal heartbeats, no heartbeat started");
            return 0;
        }

        let mut instances = self.instances.lock().await;
        for settings in Self::build_settings(config) {
            if instances.contains_key(&settings.name) {
                continue;
            }
            tracing::info!(heartbeat = %settings.name, kind = %settings.kind(), "Starting heartbeat");
            let name = settings.name.clone();
            instances.insert(name, Instance::start(settings, &self.deps));
        }

        instances.len()
    }

    /// Apply a new configuration to the running instances.
    ///
    /// Instances whose kind is unchanged are reconfigured in place. New
    /// sections are started; removed sections, sections changing kind and
    /// sections that no longer configure are stopped.
    pub async fn reload(&self, config: &AppConfig) -> usize {
        self.deps.store.configure_members(config.cluster_nodes()).await;

        let mut wanted: BTreeMap<String, HeartbeatSettings> = Self::build_settings(config)
            .into_iter()
            .map(|settings| (settings.name.clone(), settings))
            .collect();

        let mut instances = self.instances.lock().await;

        let stale: Vec<String> = instances
            .iter()
            .filter(|(name, instance)| {
                wanted
                    .get(*name)
                    .is_none_or(|settings| settings.kind() != instance.kind)
            })
            .map(|(name, _)| name.clone())
            .collect();
        for name in stale {
            if let Some(instance) = instances.remove(&name) {
                tracing::info!(heartbeat = %name, "Stopping heartbeat");
                instance.stop().await;
            }
        }

        for (name, instance) in instances.iter() {
            if let Some(settings) = wanted.remove(name) {
                instance.reconfigure(&settings);
            }
        }

        if self.deps.crypt.ensure_ready().is_ok() {
            for (name, settings) in wanted {
                tracing::info!(heartbeat = %name, kind = %settings.kind(), "Starting heartbeat");
                instances.insert(name, Instance::start(settings, &self.deps));
            }
        }

        instances.len()
    }

    /// Stop every instance and wait for its tasks
    pub async fn stop(&self) {
        let instances = std::mem::take(&mut *self.instances.lock().await);
        for (_, instance) in instances {
            instance.stop().await;
        }
    }

    /// Out-of-band heartbeat burst
    pub fn kick(&self) {
        self.deps.ticker.kick();
    }

    pub async fn snapshots(&self) -> Vec<TransportSnapshot> {
        self.instances
            .lock()
            .await
            .values()
            .flat_map(|instance| instance.tasks.iter().map(|(task, _)| task.base().snapshot()))
            .collect()
    }
}
