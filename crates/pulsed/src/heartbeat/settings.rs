//! Effective settings of one heartbeat instance.
//!
//! Built from a `[[heartbeat]]` section at configure time and rebuilt on
//! every reload. Tasks hold them behind an `Arc` that is swapped whole.

use pulse_common::PulseError;
use pulse_common::constants::{
    DEFAULT_INTERVAL_SECS, DEFAULT_TIMEOUT_SECS, DEFAULT_UNICAST_PORT, WILDCARD_ADDR,
};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::{ClusterConfig, HeartbeatSection};
use pulse_common::{HeartbeatKind, Role};

/// Address of one node for one heartbeat instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub addr: String,
    pub port: u16,
}

/// Transport specific settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSettings {
    Unicast,
    Relay {
        /// Relay node, `host` or `host:port`
        relay: String,
        /// Relay request channel secret
        secret: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatSettings {
    /// Instance name, e.g. `hb#1`
    pub name: String,
    pub nodename: String,
    pub cluster_name: String,
    /// Liveness window
    pub timeout: Duration,
    /// Heartbeat period
    pub interval: Duration,
    /// Every configured node, the local one included
    pub nodes: BTreeMap<String, PeerConfig>,
    pub transport: TransportSettings,
}

impl HeartbeatSettings {
    pub fn from_section(
        section: &HeartbeatSection,
        cluster: &ClusterConfig,
        nodename: &str,
    ) -> Result<Self, PulseError> {
        let local = Some(nodename);
        let timeout = section
            .get_u64("timeout", local)?
            .unwrap_or(DEFAULT_TIMEOUT_SECS);
        let interval = section
            .get_u64("interval", local)?
            .unwrap_or(DEFAULT_INTERVAL_SECS);

        if interval == 0 {
            return Err(PulseError::Config(format!(
                "{}: interval must be positive",
                section.name
            )));
        }
        if timeout <= interval {
            tracing::warn!(
                heartbeat = %section.name,
                timeout,
                interval,
                "Timeout not larger than interval, peers will flap"
            );
        }

        let mut names: Vec<&str> = cluster.nodes.iter().map(String::as_str).collect();
        if !names.contains(&nodename) {
            names.push(nodename);
        }

        let mut nodes = BTreeMap::new();
        for name in names {
            let node = Some(name);
            let addr = section.get_str("addr", node).unwrap_or_else(|| {
                if name == nodename {
                    WILDCARD_ADDR.to_string()
                } else {
                    name.to_string()
                }
            });
            let port = match section.get_u64("port", node)? {
                Some(port) => u16::try_from(port).map_err(|_| {
                    PulseError::Config(format!("{}: port {} out of range", section.name, port))
                })?,
                None => DEFAULT_UNICAST_PORT,
            };
            nodes.insert(name.to_string(), PeerConfig { addr, port });
        }

        let transport = match section.kind {
            HeartbeatKind::Unicast => TransportSettings::Unicast,
            HeartbeatKind::Relay => {
                let relay = section.get_str("relay", local).ok_or_else(|| {
                    PulseError::Config(format!("{}: relay is not set", section.name))
                })?;
                let secret = section.get_str("secret", local).ok_or_else(|| {
                    PulseError::Config(format!("{}: secret is not set", section.name))
                })?;
                TransportSettings::Relay { relay, secret }
            }
        };

        Ok(Self {
            name: section.name.clone(),
            nodename: nodename.to_string(),
            cluster_name: cluster.name.clone(),
            timeout: Duration::from_secs(timeout),
            interval: Duration::from_secs(interval),
            nodes,
            transport,
        })
    }

    pub fn kind(&self) -> HeartbeatKind {
        match self.transport {
            TransportSettings::Unicast => HeartbeatKind::Unicast,
            TransportSettings::Relay { .. } => HeartbeatKind::Relay,
        }
    }

    /// Configured peers, the local node excluded
    pub fn peer_names(&self) -> impl Iterator<Item = &str> {
        self.nodes
            .keys()
            .map(String::as_str)
            .filter(move |name| *name != self.nodename)
    }

    /// Names whose liveness a task of `role` tracks: the relay node for a
    /// relay sender, the configured peers otherwise
    pub fn tracked_peers(&self, role: Role) -> Vec<String> {
        match (&self.transport, role) {
            (TransportSettings::Relay { relay, .. }, Role::Tx) => vec![relay.clone()],
            _ => self.peer_names().map(str::to_string).collect(),
        }
    }

    /// Local bind address and port
    pub fn local(&self) -> PeerConfig {
        self.nodes.get(&self.nodename).cloned().unwrap_or(PeerConfig {
            addr: WILDCARD_ADDR.to_string(),
            port: DEFAULT_UNICAST_PORT,
        })
    }

    /// Address of a peer, with defaults for peers admitted at runtime
    pub fn peer(&self, name: &str) -> PeerConfig {
        self.nodes.get(name).cloned().unwrap_or_else(|| PeerConfig {
            addr: name.to_string(),
            port: self.local().port,
        })
    }

    /// Status export of the settings. Secrets are left out.
    pub fn export(&self) -> serde_json::Value {
        let mut value = serde_json::json!({
            "timeout": self.timeout.as_secs(),
            "interval": self.interval.as_secs(),
        });

        match &self.transport {
            TransportSettings::Unicast => {
                let local = self.local();
                value["addr"] = local.addr.into();
                value["port"] = local.port.into();
            }
            TransportSettings::Relay { relay, .. } => {
                value["relay"] = relay.clone().into();
            }
        }

        value
    }
}
