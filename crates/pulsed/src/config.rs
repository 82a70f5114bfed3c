//! Configuration management for the Pulse daemon.

use anyhow::{Context, Result, bail};
use pulse_common::{HeartbeatKind, PulseError};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use pulse_common::constants::DEFAULT_LISTEN_ADDR;

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// This node's name, as known by its peers
    #[serde(default = "default_nodename")]
    pub nodename: String,

    /// HTTP listen address (status export, relay service)
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Cluster identity
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Heartbeat transport instances
    #[serde(default, rename = "heartbeat")]
    pub heartbeats: Vec<HeartbeatSection>,

    /// Relay slot service hosted by this node
    #[serde(default)]
    pub relay_service: RelayServiceConfig,
}

/// Cluster identity and membership
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Cluster name, bound into every envelope
    #[serde(default = "default_cluster_name")]
    pub name: String,

    /// Pre-shared envelope secret
    #[serde(default)]
    pub secret: String,

    /// Configured member nodes
    #[serde(default)]
    pub nodes: Vec<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: default_cluster_name(),
            secret: String::new(),
            nodes: Vec::new(),
        }
    }
}

/// Relay slot service configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayServiceConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Secret relay clients must present
    #[serde(default)]
    pub secret: String,
}

/// One `[[heartbeat]]` table.
///
/// Options other than `name` and `type` are free-form and accept per-node
/// overrides with the `key@nodename` syntax, e.g. `"addr@node-2" = "10.0.0.2"`.
#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatSection {
    /// Instance name, e.g. `hb#1`
    pub name: String,

    #[serde(rename = "type")]
    pub kind: HeartbeatKind,

    #[serde(flatten)]
    pub options: HashMap<String, serde_json::Value>,
}

impl HeartbeatSection {
    #[cfg(test)]
    pub fn new(name: impl Into<String>, kind: HeartbeatKind) -> Self {
        Self {
            name: name.into(),
            kind,
            options: HashMap::new(),
        }
    }

    /// Builder-style option setter
    #[cfg(test)]
    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.options.insert(key.to_string(), value.into());
        self
    }

    /// Raw option lookup: `key@node` first, then `key`
    pub fn option(&self, key: &str, node: Option<&str>) -> Option<&serde_json::Value> {
        node.and_then(|n| self.options.get(&format!("{key}@{n}")))
            .or_else(|| self.options.get(key))
    }

    /// String option, numbers are accepted and formatted
    pub fn get_str(&self, key: &str, node: Option<&str>) -> Option<String> {
        match self.option(key, node)? {
            serde_json::Value::String(s) if s.is_empty() => None,
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Unsigned integer option, numeric strings are accepted
    pub fn get_u64(&self, key: &str, node: Option<&str>) -> Result<Option<u64>, PulseError> {
        let Some(value) = self.option(key, node) else {
            return Ok(None);
        };

        let parsed = match value {
            serde_json::Value::Number(n) => n.as_u64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        };

        parsed.map(Some).ok_or_else(|| {
            PulseError::Config(format!(
                "{}: {} must be a non-negative integer, got {}",
                self.name, key, value
            ))
        })
    }
}

// Default value functions
fn default_listen_addr() -> String { DEFAULT_LISTEN_ADDR.to_string() }
fn default_cluster_name() -> String { "default".to_string() }

fn default_nodename() -> String {
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.is_empty() {
            return name;
        }
    }

    use rand::Rng;
    let mut rng = rand::rng();
    format!("node-{:08x}", rng.random::<u32>())
}

impl AppConfig {
    /// Load configuration from file, with CLI overrides
    pub fn load(config_path: &str, args: &super::Args) -> Result<Self> {
        let mut config = if Path::new(config_path).exists() {
            Self::load_file(config_path)?
        } else {
            // Use defaults if config file doesn't exist
            tracing::warn!("Config file not found, using defaults");
            Self::default()
        };

        // Apply CLI overrides
        if let Some(ref nodename) = args.nodename {
            config.nodename = nodename.clone();
        }
        if let Some(ref listen) = args.listen {
            config.listen_addr = listen.clone();
        }

        config.validate()?;

        Ok(config)
    }

    /// Parse a configuration file
    pub fn load_file(config_path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(config_path))
            .build()
            .context("Failed to load config file")?;

        settings
            .try_deserialize()
            .context("Failed to parse config")
    }

    /// Daemon-level checks. Per-heartbeat problems are reported when each
    /// instance is configured, so one bad section does not stop the others.
    pub fn validate(&self) -> Result<()> {
        if self.nodename.is_empty() {
            bail!("nodename must not be empty");
        }
        if self.relay_service.enabled && self.relay_service.secret.is_empty() {
            bail!("relay_service is enabled but has no secret");
        }

        let mut seen = std::collections::HashSet::new();
        for section in &self.heartbeats {
            if !seen.insert(section.name.as_str()) {
                bail!("duplicate heartbeat name {}", section.name);
            }
        }

        Ok(())
    }

    /// Configured cluster nodes, always including the local node
    pub fn cluster_nodes(&self) -> Vec<String> {
        let mut nodes = self.cluster.nodes.clone();
        if !nodes.contains(&self.nodename) {
            nodes.push(self.nodename.clone());
        }
        nodes
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            nodename: default_nodename(),
            listen_addr: default_listen_addr(),
            cluster: ClusterConfig::default(),
            heartbeats: Vec::new(),
            relay_service: RelayServiceConfig::default(),
        }
    }
}
