//! Heartbeat base: lifecycle, per-peer liveness and counters.
//!
//! Every transport task (sender or receiver) owns one `HeartbeatBase`. The
//! settings sit behind an `Arc` swapped whole on reconfigure, so concurrent
//! readers see either the old or the new settings.

use chrono::{DateTime, Utc};
use pulse_common::{
    HeartbeatKind, LifecycleState, PeerSnapshot, Role, StatsSnapshot, TransportSnapshot,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use super::settings::HeartbeatSettings;

/// Liveness of one peer as seen by one heartbeat task
#[derive(Debug, Clone)]
pub struct PeerLiveness {
    /// Last wire activity, whatever its outcome
    pub last_attempt_at: Option<Instant>,
    /// Last accepted payload (rx) or delivered frame (tx)
    pub last_success_at: Option<Instant>,
    /// Outcome of the previous attempt
    pub consecutive_success: bool,
    /// Wire activity observed inside the timeout window
    pub beating: bool,
}

impl Default for PeerLiveness {
    fn default() -> Self {
        // Start optimistic so the first failure is reported
        Self {
            last_attempt_at: None,
            last_success_at: None,
            consecutive_success: true,
            beating: false,
        }
    }
}

impl PeerLiveness {
    /// Consumer view: a successful receipt inside the timeout window
    #[cfg(test)]
    pub fn is_up(&self, timeout: Duration) -> bool {
        self.is_up_at(Instant::now(), timeout)
    }

    pub fn is_up_at(&self, now: Instant, timeout: Duration) -> bool {
        self.last_success_at
            .is_some_and(|t| now.saturating_duration_since(t) < timeout)
    }

    fn is_beating(&self, timeout: Duration) -> bool {
        self.last_attempt_at
            .is_some_and(|t| t.elapsed() < timeout)
    }
}

/// Aggregate counters
#[derive(Default)]
pub struct TransportStats {
    pub beats: AtomicU64,
    pub bytes: AtomicU64,
    pub errors: AtomicU64,
}

impl TransportStats {
    fn reset(&self) {
        self.beats.store(0, Ordering::Relaxed);
        self.bytes.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            beats: self.beats.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Shared state machine and bookkeeping of a heartbeat task
pub struct HeartbeatBase {
    /// Task identifier, e.g. `hb#1.rx`
    id: String,
    kind: HeartbeatKind,
    role: Role,
    settings: RwLock<Arc<HeartbeatSettings>>,
    peers: Mutex<HashMap<String, PeerLiveness>>,
    stats: TransportStats,
    state: Mutex<LifecycleState>,
    shutdown_tx: watch::Sender<bool>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl HeartbeatBase {
    pub fn new(role: Role, settings: HeartbeatSettings) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            id: format!("{}.{}", settings.name, role),
            kind: settings.kind(),
            role,
            settings: RwLock::new(Arc::new(settings)),
            peers: Mutex::new(HashMap::new()),
            stats: TransportStats::default(),
            state: Mutex::new(LifecycleState::Created),
            shutdown_tx,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> LifecycleState {
        *lock(&self.state)
    }

    /// Current settings. Cheap, callers hold the `Arc` for a whole iteration.
    pub fn settings(&self) -> Arc<HeartbeatSettings> {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Initial configuration: counters and liveness start from zero
    pub fn configure(&self, settings: HeartbeatSettings) {
        self.stats.reset();
        {
            let mut peers = lock(&self.peers);
            peers.clear();
            for name in settings.tracked_peers(self.role) {
                peers.insert(name, PeerLiveness::default());
            }
        }
        self.swap_settings(settings);

        let mut state = lock(&self.state);
        if *state == LifecycleState::Created {
            *state = LifecycleState::Configured;
        }
    }

    /// Live configuration change: counters are preserved, liveness of peers
    /// still configured is kept, peers admitted at runtime are kept.
    pub fn reconfigure(&self, settings: HeartbeatSettings) {
        {
            let previous = self.settings().tracked_peers(self.role);
            let current = settings.tracked_peers(self.role);
            let mut peers = lock(&self.peers);
            peers.retain(|name, _| current.contains(name) || !previous.contains(name));
            peers.remove(&settings.nodename);
            for name in current {
                peers.entry(name).or_default();
            }
        }
        self.swap_settings(settings);

        tracing::info!(heartbeat = %self.id, "Heartbeat reconfigured");
    }

    fn swap_settings(&self, settings: HeartbeatSettings) {
        *self
            .settings
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(settings);
    }

    /// Enter the running state, called by the task loop
    pub fn start(&self) {
        *lock(&self.state) = LifecycleState::Running;
        tracing::info!(heartbeat = %self.id, "Heartbeat started");
    }

    /// Request termination. Idempotent.
    pub fn stop(&self) {
        {
            let mut state = lock(&self.state);
            if *state == LifecycleState::Stopped {
                return;
            }
            *state = LifecycleState::Stopping;
        }
        self.shutdown_tx.send_replace(true);
    }

    pub fn stopped(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Cancellation signal handed to every blocking wait
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Leave the running state, called by the task loop on exit
    pub fn finish(&self) {
        *lock(&self.state) = LifecycleState::Stopped;
        tracing::info!(heartbeat = %self.id, "Heartbeat stopped");
    }

    pub fn has_peer(&self, peer: &str) -> bool {
        lock(&self.peers).contains_key(peer)
    }

    /// Track a peer admitted at runtime
    pub fn add_peer(&self, peer: &str) {
        lock(&self.peers).entry(peer.to_string()).or_default();
    }

    /// Tracked peers, configured and admitted
    pub fn peer_count(&self) -> usize {
        lock(&self.peers).len()
    }

    #[cfg(test)]
    pub fn peer(&self, peer: &str) -> Option<PeerLiveness> {
        lock(&self.peers).get(peer).cloned()
    }

    /// Wire activity observed for `peer`
    pub fn record_attempt(&self, peer: &str) {
        lock(&self.peers)
            .entry(peer.to_string())
            .or_default()
            .last_attempt_at = Some(Instant::now());
    }

    /// Successful exchange with `peer`. Returns true when the previous
    /// attempt had failed.
    pub fn record_success(&self, peer: &str) -> bool {
        let mut peers = lock(&self.peers);
        let liveness = peers.entry(peer.to_string()).or_default();
        liveness.last_success_at = Some(Instant::now());
        let recovered = !liveness.consecutive_success;
        liveness.consecutive_success = true;
        recovered
    }

    /// Failed exchange with `peer`. Returns true on the success to failure
    /// transition, the only one worth logging.
    pub fn record_failure(&self, peer: &str) -> bool {
        let mut peers = lock(&self.peers);
        let liveness = peers.entry(peer.to_string()).or_default();
        let edge = liveness.consecutive_success;
        liveness.consecutive_success = false;
        edge
    }

    /// Recompute the beating flag of `peer`. Called after every attempt,
    /// whatever its outcome.
    pub fn record_beat(&self, peer: &str) {
        let timeout = self.settings().timeout;
        let mut peers = lock(&self.peers);
        let liveness = peers.entry(peer.to_string()).or_default();
        self.refresh_beating(peer, liveness, timeout);
    }

    /// Recompute the beating flag of every tracked peer, admitted ones
    /// included, so peers that stopped sending go stale.
    pub fn record_beat_all(&self) {
        let timeout = self.settings().timeout;
        let mut peers = lock(&self.peers);
        for (peer, liveness) in peers.iter_mut() {
            self.refresh_beating(peer, liveness, timeout);
        }
    }

    fn refresh_beating(&self, peer: &str, liveness: &mut PeerLiveness, timeout: Duration) {
        let beating = liveness.is_beating(timeout);

        if beating != liveness.beating {
            if beating {
                tracing::info!(heartbeat = %self.id, peer = %peer, "Peer heartbeat beating");
            } else if liveness.last_attempt_at.is_some() {
                tracing::warn!(heartbeat = %self.id, peer = %peer, "Peer heartbeat stale");
            }
            liveness.beating = beating;
        }
    }

    /// Account one beat
    pub fn push_stats(&self, bytes: usize, is_error: bool) {
        self.stats.beats.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        if is_error {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Status export for telemetry consumers
    pub fn snapshot(&self) -> TransportSnapshot {
        let settings = self.settings();
        let now = Instant::now();
        let wall = Utc::now();
        let to_wall = |t: Option<Instant>| -> Option<DateTime<Utc>> {
            t.and_then(|t| chrono::Duration::from_std(now.saturating_duration_since(t)).ok())
                .map(|age| wall - age)
        };

        let peers: BTreeMap<String, PeerSnapshot> = lock(&self.peers)
            .iter()
            .map(|(name, liveness)| {
                (
                    name.clone(),
                    PeerSnapshot {
                        last_attempt_at: to_wall(liveness.last_attempt_at),
                        last_success_at: to_wall(liveness.last_success_at),
                        beating: liveness.beating,
                        up: liveness.is_up_at(now, settings.timeout),
                    },
                )
            })
            .collect();

        TransportSnapshot {
            id: self.id.clone(),
            kind: self.kind,
            role: self.role,
            state: self.state(),
            stats: self.stats(),
            config: settings.export(),
            peers,
        }
    }
}
