//! Cluster state store.
//!
//! Last accepted status of every node, plus the membership table that records
//! how each node became known. One lock guards both, shared by every
//! heartbeat receiver and every external reader. The store applies no policy
//! of its own: admission and duplicate detection are decided by the caller,
//! inside `update`, so the critical section stays a single map write.

use chrono::{DateTime, Utc};
use pulse_common::NodeStatus;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Last accepted status of a node
#[derive(Debug, Clone, Serialize)]
pub struct ClusterStateEntry {
    /// Decrypted status snapshot
    pub status: NodeStatus,
    /// Update marker of `status`, used to drop stale deliveries
    pub updated: i64,
    /// Local reception time
    pub received_at: DateTime<Utc>,
    /// Heartbeat task that delivered it
    pub via: String,
}

impl ClusterStateEntry {
    pub fn new(status: NodeStatus, via: impl Into<String>) -> Self {
        Self {
            updated: status.updated,
            status,
            received_at: Utc::now(),
            via: via.into(),
        }
    }
}

/// How a node entered the peer set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Membership {
    /// Listed in the cluster configuration
    Configured,
    /// Admitted at runtime after presenting valid cluster credentials
    Observed,
}

/// Audit record of a runtime admission
#[derive(Debug, Clone, Serialize)]
pub struct AdmissionEvent {
    pub nodename: String,
    /// Heartbeat task that saw the traffic
    pub via: String,
    pub at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, ClusterStateEntry>,
    members: HashMap<String, Membership>,
    admissions: Vec<AdmissionEvent>,
}

/// Shared cluster state
#[derive(Clone, Default)]
pub struct ClusterStore {
    inner: Arc<RwLock<Inner>>,
}

impl ClusterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the last accepted status of a node
    pub async fn get(&self, node: &str) -> Option<ClusterStateEntry> {
        self.inner.read().await.entries.get(node).cloned()
    }

    /// Store a node status unconditionally
    pub async fn put(&self, node: &str, entry: ClusterStateEntry) {
        self.inner
            .write()
            .await
            .entries
            .insert(node.to_string(), entry);
    }

    /// Compare-and-store under a single lock hold.
    ///
    /// `decide` sees the current entry and returns the replacement, or None to
    /// leave the store untouched. Returns true when an entry was written.
    pub async fn update<F>(&self, node: &str, decide: F) -> bool
    where
        F: FnOnce(Option<&ClusterStateEntry>) -> Option<ClusterStateEntry>,
    {
        let mut inner = self.inner.write().await;
        match decide(inner.entries.get(node)) {
            Some(entry) => {
                inner.entries.insert(node.to_string(), entry);
                true
            }
            None => false,
        }
    }

    /// Names of nodes with a stored status
    pub async fn nodes(&self) -> Vec<String> {
        let mut nodes: Vec<_> = self.inner.read().await.entries.keys().cloned().collect();
        nodes.sort();
        nodes
    }

    /// Copy of every stored status
    pub async fn snapshot(&self) -> BTreeMap<String, ClusterStateEntry> {
        self.inner
            .read()
            .await
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Mark the configured node list. Observed nodes absent from the list
    /// keep their status; observed nodes now listed become configured.
    pub async fn configure_members<I, S>(&self, nodes: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut inner = self.inner.write().await;
        inner
            .members
            .retain(|_, membership| *membership == Membership::Observed);
        for node in nodes {
            inner.members.insert(node.into(), Membership::Configured);
        }
    }

    pub async fn membership(&self, node: &str) -> Option<Membership> {
        self.inner.read().await.members.get(node).copied()
    }

    pub async fn members(&self) -> BTreeMap<String, Membership> {
        self.inner
            .read()
            .await
            .members
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    /// Nodes admitted at runtime
    pub async fn observed_members(&self) -> Vec<String> {
        let mut nodes: Vec<_> = self
            .inner
            .read()
            .await
            .members
            .iter()
            .filter(|(_, m)| **m == Membership::Observed)
            .map(|(k, _)| k.clone())
            .collect();
        nodes.sort();
        nodes
    }

    /// Admit a node that is not yet a member.
    ///
    /// Returns the admission record when the node was unknown, None when it
    /// already was a member.
    pub async fn admit(&self, node: &str, via: &str) -> Option<AdmissionEvent> {
        let mut inner = self.inner.write().await;
        if inner.members.contains_key(node) {
            return None;
        }

        inner
            .members
            .insert(node.to_string(), Membership::Observed);
        let event = AdmissionEvent {
            nodename: node.to_string(),
            via: via.to_string(),
            at: Utc::now(),
        };
        inner.admissions.push(event.clone());

        tracing::info!(node = %node, via = %via, "Admitted previously unknown node");

        Some(event)
    }

    /// Every runtime admission since startup
    pub async fn admissions(&self) -> Vec<AdmissionEvent> {
        self.inner.read().await.admissions.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(node: &str, updated: i64) -> ClusterStateEntry {
        ClusterStateEntry::new(NodeStatus::new(node, updated), "hb#1.rx")
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let store = ClusterStore::new();
        assert!(store.get("node-1").await.is_none());

        store.put("node-1", entry("node-1", 10)).await;
        let got = store.get("node-1").await.unwrap();
        assert_eq!(got.updated, 10);
        assert_eq!(got.via, "hb#1.rx");
        assert_eq!(store.nodes().await, vec!["node-1".to_string()]);
    }

    #[tokio::test]
    async fn test_update_applies_caller_decision() {
        let store = ClusterStore::new();
        store.put("node-1", entry("node-1", 10)).await;

        let written = store
            .update("node-1", |cur| {
                assert_eq!(cur.map(|e| e.updated), Some(10));
                None
            })
            .await;
        assert!(!written);
        assert_eq!(store.get("node-1").await.unwrap().updated, 10);

        let written = store.update("node-1", |_| Some(entry("node-1", 11))).await;
        assert!(written);
        assert_eq!(store.get("node-1").await.unwrap().updated, 11);
    }

    #[tokio::test]
    async fn test_marker_wins_under_concurrent_writers() {
        let store = ClusterStore::new();

        // Deliver markers 1..=50 in scrambled order from concurrent tasks
        let mut markers: Vec<i64> = (1..=50).collect();
        markers.reverse();
        markers.rotate_left(17);

        let mut tasks = tokio::task::JoinSet::new();
        for marker in markers {
            let store = store.clone();
            tasks.spawn(async move {
                store
                    .update("node-1", |cur| match cur {
                        Some(e) if e.updated >= marker => None,
                        _ => Some(entry("node-1", marker)),
                    })
                    .await
            });
        }
        while tasks.join_next().await.is_some() {}

        assert_eq!(store.get("node-1").await.unwrap().updated, 50);
    }

    #[tokio::test]
    async fn test_admission_is_recorded_once() {
        let store = ClusterStore::new();
        store.configure_members(["node-1", "node-2"]).await;

        assert!(store.admit("node-2", "hb#1.rx").await.is_none());

        let event = store.admit("node-3", "hb#1.rx").await.unwrap();
        assert_eq!(event.nodename, "node-3");
        assert!(store.admit("node-3", "hb#1.rx").await.is_none());

        assert_eq!(store.membership("node-3").await, Some(Membership::Observed));
        assert_eq!(store.observed_members().await, vec!["node-3".to_string()]);
        assert_eq!(store.admissions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_configure_members_promotes_observed() {
        let store = ClusterStore::new();
        store.configure_members(["node-1"]).await;
        store.admit("node-3", "hb#1.rx").await;
        store.admit("node-4", "hb#1.rx").await;

        store.configure_members(["node-1", "node-3"]).await;

        assert_eq!(
            store.membership("node-3").await,
            Some(Membership::Configured)
        );
        assert_eq!(store.membership("node-4").await, Some(Membership::Observed));
        assert_eq!(store.members().await.len(), 3);
    }
}
