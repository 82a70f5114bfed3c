//! Unicast heartbeat (TCP)
//!
//! Wire format: `crypt:BASE64` followed by a single NUL byte, one frame per
//! connection, connection closed after the frame.
//!
//! - Sender: one short-lived connection per peer per period
//! - Receiver: accept loop feeding a bounded pool of handler tasks

use pulse_common::NodeStatus;
use pulse_common::constants::{
    ACCEPT_TIMEOUT, CONNECT_TIMEOUT, FRAME_TERMINATOR, HANDLERS_PER_PEER, MAX_FRAME_SIZE,
    READ_TIMEOUT,
};
use pulse_common::{PulseError, Role};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinSet;
use tokio::time::Instant;

use super::base::HeartbeatBase;
use super::settings::{HeartbeatSettings, PeerConfig};
use super::ticker::{Ticker, shutdown_requested};
use super::{Reception, commit_status};
use crate::cluster::{ClusterStore, Crypt, Identity, StatusSource};

/// Sends the local status to every peer, once per period
pub struct UnicastSender {
    base: Arc<HeartbeatBase>,
    crypt: Arc<Crypt>,
    status: Arc<dyn StatusSource>,
    store: ClusterStore,
    ticker: Arc<Ticker>,
}

impl UnicastSender {
    pub fn new(
        settings: HeartbeatSettings,
        crypt: Arc<Crypt>,
        status: Arc<dyn StatusSource>,
        store: ClusterStore,
        ticker: Arc<Ticker>,
    ) -> Self {
        let base = Arc::new(HeartbeatBase::new(Role::Tx, settings.clone()));
        base.configure(settings);
        Self {
            base,
            crypt,
            status,
            store,
            ticker,
        }
    }

    pub fn base(&self) -> &Arc<HeartbeatBase> {
        &self.base
    }

    /// Run until stopped
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

    /// One heartbeat: encrypt once, deliver to every peer
    pub async fn beat(&self) {
        let settings = self.base.settings();
        let status = self.status.build_status();

        let envelope =
            match self
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

        let mut frame = envelope.into_bytes();
        frame.push(FRAME_TERMINATOR);

        let local = settings.local();
        for (peer, target) in self.targets(&settings).await {
            match send_frame(&local.addr, &target, &frame).await {
                Ok(()) => {
                    self.base.record_attempt(&peer);
                    if self.base.record_success(&peer) {
                        tracing::info!(
                            heartbeat = %self.base.id(),
                            peer = %peer,
                            "Heartbeat delivery recovered"
                        );
                    }
                    self.base.push_stats(frame.len(), false);
                }
                Err(e) => {
                    if self.base.record_failure(&peer) {
                        tracing::warn!(
                            heartbeat = %self.base.id(),
                            peer = %peer,
                            addr = %target.addr,
                            port = target.port,
                            error = %e,
                            "Heartbeat delivery failed"
                        );
                    }
                    self.base.push_stats(0, true);
                }
            }
            self.base.record_beat(&peer);
        }
    }

    /// Configured peers plus peers admitted from traffic
    async fn targets(&self, settings: &HeartbeatSettings) -> Vec<(String, PeerConfig)> {
        let mut targets: Vec<_> = settings
            .peer_names()
            .map(|name| (name.to_string(), settings.peer(name)))
            .collect();

        for name in self.store.observed_members().await {
            if name != settings.nodename && !settings.nodes.contains_key(&name) {
                let target = settings.peer(&name);
                targets.push((name, target));
            }
        }

        targets
    }
}

/// Connect, write one frame, close
async fn send_frame(bind_addr: &str, target: &PeerConfig, frame: &[u8]) -> Result<(), PulseError> {
    let connect = async {
        let remote = tokio::net::lookup_host((target.addr.as_str(), target.port))
            .await?
            .next()
            .ok_or_else(|| PulseError::Transport(format!("cannot resolve {}", target.addr)))?;

        let socket = if remote.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };

        if let Ok(ip) = bind_addr.parse::<IpAddr>() {
            if !ip.is_unspecified() && ip.is_ipv4() == remote.is_ipv4() {
                socket.bind(SocketAddr::new(ip, 0))?;
            }
        }

        Ok::<TcpStream, PulseError>(socket.connect(remote).await?)
    };

    let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, connect)
        .await
        .map_err(|_| PulseError::Timeout(format!("connect to {}:{}", target.addr, target.port)))??;

    tokio::time::timeout(READ_TIMEOUT, async {
        stream.write_all(frame).await?;
        stream.shutdown().await
    })
    .await
    .map_err(|_| PulseError::Timeout(format!("write to {}:{}", target.addr, target.port)))??;

    Ok(())
}

/// Accepts heartbeat connections and hands them to handler tasks
pub struct UnicastReceiver {
    base: Arc<HeartbeatBase>,
    crypt: Arc<Crypt>,
    store: ClusterStore,
    /// Live handler tasks
    in_flight: Arc<AtomicUsize>,
    /// Address the listener is bound to
    bound: Mutex<Option<SocketAddr>>,
}

impl UnicastReceiver {
    pub fn new(settings: HeartbeatSettings, crypt: Arc<Crypt>, store: ClusterStore) -> Self {
        let base = Arc::new(HeartbeatBase::new(Role::Rx, settings.clone()));
        base.configure(settings);
        Self {
            base,
            crypt,
            store,
            in_flight: Arc::new(AtomicUsize::new(0)),
            bound: Mutex::new(None),
        }
    }

    pub fn base(&self) -> &Arc<HeartbeatBase> {
        &self.base
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Number of handler tasks currently alive
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Handler pool size for the tracked peers, admitted ones included
    pub fn capacity(&self) -> usize {
        HANDLERS_PER_PEER * self.base.peer_count().max(1)
    }

    fn set_bound(&self, addr: Option<SocketAddr>) {
        *self.bound.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = addr;
    }

    /// Run until stopped. Outstanding handlers are joined before the listener
    /// is closed.
    pub async fn run(&self) {
        self.base.start();
        let mut shutdown = self.base.shutdown_signal();
        let mut handlers: JoinSet<()> = JoinSet::new();
        let mut listener: Option<(TcpListener, PeerConfig)> = None;
        let mut addr_index: HashMap<IpAddr, String> = HashMap::new();
        let mut indexed: Option<Arc<HeartbeatSettings>> = None;
        let mut last_sweep = Instant::now();

        loop {
            if self.base.stopped() {
                break;
            }

            // Busy peers must not hide silent ones
            if last_sweep.elapsed() >= ACCEPT_TIMEOUT {
                self.base.record_beat_all();
                last_sweep = Instant::now();
            }

            let settings = self.base.settings();
            let local = settings.local();

            // (Re)bind when the local address changed
            if listener.as_ref().is_none_or(|(_, bound)| *bound != local) {
                listener = None;
                self.set_bound(None);
                match TcpListener::bind((local.addr.as_str(), local.port)).await {
                    Ok(l) => {
                        let addr = l.local_addr().ok();
                        tracing::info!(
                            heartbeat = %self.base.id(),
                            addr = ?addr,
                            "Heartbeat receiver listening"
                        );
                        self.set_bound(addr);
                        listener = Some((l, local.clone()));
                    }
                    Err(e) => {
                        tracing::error!(
                            heartbeat = %self.base.id(),
                            addr = %local.addr,
                            port = local.port,
                            error = %e,
                            "Failed to bind heartbeat receiver"
                        );
                        self.base.push_stats(0, true);
                        tokio::select! {
                            _ = tokio::time::sleep(ACCEPT_TIMEOUT) => continue,
                            _ = shutdown_requested(&mut shutdown) => break,
                        }
                    }
                }
            }

            if indexed
                .as_ref()
                .is_none_or(|prev| !Arc::ptr_eq(prev, &settings))
            {
                addr_index = resolve_peers(&settings).await;
                indexed = Some(settings.clone());
            }

            let Some((server, _)) = listener.as_ref() else {
                continue;
            };

            let accepted = tokio::select! {
                r = tokio::time::timeout(ACCEPT_TIMEOUT, server.accept()) => r,
                _ = shutdown_requested(&mut shutdown) => break,
            };

            match accepted {
                Err(_) => {
                    self.base.record_beat_all();
                    last_sweep = Instant::now();
                }
                Ok(Err(e)) => {
                    tracing::warn!(heartbeat = %self.base.id(), error = %e, "Accept failed");
                    self.base.push_stats(0, true);
                }
                Ok(Ok((stream, remote))) => {
                    // Janitor: reap finished handlers
                    while handlers.try_join_next().is_some() {}

                    let capacity = self.capacity();
                    if handlers.len() >= capacity {
                        tracing::warn!(
                            heartbeat = %self.base.id(),
                            remote = %remote,
                            capacity,
                            "Handler pool full, dropping connection"
                        );
                        drop(stream);
                        continue;
                    }

                    let handler = Handler {
                        base: self.base.clone(),
                        crypt: self.crypt.clone(),
                        store: self.store.clone(),
                        expected: addr_index.get(&remote.ip()).cloned(),
                    };
                    let in_flight = self.in_flight.clone();
                    in_flight.fetch_add(1, Ordering::SeqCst);
                    handlers.spawn(async move {
                        handler.serve(stream, remote).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                    });
                }
            }
        }

        while handlers.join_next().await.is_some() {}
        drop(listener);
        self.set_bound(None);
        self.base.finish();
    }
}

/// Map peer IP addresses to node names, for sender identity hints
async fn resolve_peers(settings: &HeartbeatSettings) -> HashMap<IpAddr, String> {
    let mut index = HashMap::new();

    for name in settings.peer_names() {
        let peer = settings.peer(name);
        if let Ok(ip) = peer.addr.parse::<IpAddr>() {
            index.insert(ip, name.to_string());
            continue;
        }

        let lookup = tokio::net::lookup_host((peer.addr.as_str(), peer.port));
        match tokio::time::timeout(CONNECT_TIMEOUT, lookup).await {
            Ok(Ok(addrs)) => {
                for addr in addrs {
                    index.insert(addr.ip(), name.to_string());
                }
            }
            _ => {
                tracing::debug!(peer = %name, addr = %peer.addr, "Peer address not resolvable");
            }
        }
    }

    index
}

/// One accepted connection
struct Handler {
    base: Arc<HeartbeatBase>,
    crypt: Arc<Crypt>,
    store: ClusterStore,
    /// Node owning the remote address, if known
    expected: Option<String>,
}

impl Handler {
    async fn serve(self, mut stream: TcpStream, remote: SocketAddr) {
        let data = match read_frame(&mut stream).await {
            Ok(data) => data,
            Err(e) => {
                tracing::debug!(remote = %remote, error = %e, "Failed to read heartbeat frame");
                self.base.push_stats(0, true);
                if let Some(peer) = &self.expected {
                    self.base.record_beat(peer);
                }
                return;
            }
        };

        let outcome = receive(
            &self.base,
            &self.crypt,
            &self.store,
            &data,
            self.expected.as_deref(),
        )
        .await;
        tracing::trace!(remote = %remote, outcome = ?outcome, "Heartbeat frame processed");
    }
}

/// Read until EOF or the frame terminator
async fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>, PulseError> {
    let read = async {
        let mut data = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            if let Some(pos) = chunk[..n].iter().position(|b| *b == FRAME_TERMINATOR) {
                data.extend_from_slice(&chunk[..pos]);
                break;
            }
            data.extend_from_slice(&chunk[..n]);
            if data.len() > MAX_FRAME_SIZE {
                return Err(PulseError::Transport(format!(
                    "frame exceeds {MAX_FRAME_SIZE} bytes"
                )));
            }
        }
        if data.is_empty() {
            return Err(PulseError::Transport(
                "connection closed without a frame".to_string(),
            ));
        }
        Ok(data)
    };

    tokio::time::timeout(READ_TIMEOUT, read)
        .await
        .map_err(|_| PulseError::Timeout("read heartbeat frame".to_string()))?
}

/// Process one received frame
pub(crate) async fn receive(
    base: &HeartbeatBase,
    crypt: &Crypt,
    store: &ClusterStore,
    data: &[u8],
    expected: Option<&str>,
) -> Reception {
    let settings = base.settings();

    let Some(message) = crypt.decrypt::<NodeStatus>(data, expected) else {
        // Identity unknown here: only the address can be credited
        base.push_stats(data.len(), true);
        if let Some(peer) = expected {
            base.record_attempt(peer);
            base.record_beat(peer);
        }
        return Reception::Rejected;
    };

    let sender = message.sender;
    if sender == settings.nodename {
        base.push_stats(data.len(), false);
        return Reception::Ignored;
    }

    if let Identity::Mismatch { expected } = &message.identity {
        tracing::warn!(
            heartbeat = %base.id(),
            expected = %expected,
            sender = %sender,
            "Sender differs from address owner, possible address reuse"
        );
    }

    if !base.has_peer(&sender) {
        store.admit(&sender, base.id()).await;
        base.add_peer(&sender);
    }

    base.record_attempt(&sender);
    let outcome = if commit_status(store, &sender, message.payload, base.id()).await {
        base.record_success(&sender);
        Reception::Accepted(sender.clone())
    } else {
        tracing::debug!(heartbeat = %base.id(), sender = %sender, "Dropped stale heartbeat");
        Reception::Duplicate(sender.clone())
    };
    base.record_beat(&sender);
    base.push_stats(data.len(), false);

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Membership;
    use crate::config::{ClusterConfig, HeartbeatSection};
    use pulse_common::HeartbeatKind;
    use std::time::Duration;

    const SECRET: &str = "s3cret";

    fn settings(local: &str, nodes: &[&str], options: &[(&str, serde_json::Value)]) -> HeartbeatSettings {
        let cluster = ClusterConfig {
            name: "prod".to_string(),
            secret: SECRET.to_string(),
            nodes: nodes.iter().map(|s| s.to_string()).collect(),
        };
        let mut section = HeartbeatSection::new("hb#1", HeartbeatKind::Unicast);
        for (key, value) in options {
            section = section.with(key, value.clone());
        }
        HeartbeatSettings::from_section(&section, &cluster, local).unwrap()
    }

    fn crypt() -> Arc<Crypt> {
        Arc::new(Crypt::new("prod").with_secret("prod", SECRET))
    }

    struct FixedStatus(String, std::sync::atomic::AtomicI64);

    impl StatusSource for FixedStatus {
        fn build_status(&self) -> NodeStatus {
            NodeStatus::new(self.0.clone(), self.1.fetch_add(1, Ordering::SeqCst))
        }
    }

    fn status(node: &str) -> Arc<dyn StatusSource> {
        Arc::new(FixedStatus(node.to_string(), std::sync::atomic::AtomicI64::new(1)))
    }

    fn envelope(sender: &str, updated: i64) -> Vec<u8> {
        crypt()
            .encrypt("prod", sender, &NodeStatus::new(sender, updated))
            .unwrap()
            .into_bytes()
    }

    fn rx_base() -> HeartbeatBase {
        let s = settings("node-2", &["node-1", "node-2"], &[]);
        let base = HeartbeatBase::new(Role::Rx, s.clone());
        base.configure(s);
        base
    }

    async fn start_receiver(receiver: &Arc<UnicastReceiver>) -> SocketAddr {
        let task = receiver.clone();
        tokio::spawn(async move { task.run().await });
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(addr) = receiver.local_addr() {
                return addr;
            }
            assert!(Instant::now() < deadline, "receiver did not bind");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn send_raw(addr: SocketAddr, sender: &str, updated: i64) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut frame = envelope(sender, updated);
        frame.push(FRAME_TERMINATOR);
        stream.write_all(&frame).await.unwrap();
    }

    fn loopback(local: &str, nodes: &[&str], port: u16) -> HeartbeatSettings {
        settings(local, nodes, &[("addr", "127.0.0.1".into()), ("port", port.into())])
    }

    #[tokio::test]
    async fn test_receive_accepts_newer_and_drops_stale() {
        let base = rx_base();
        let crypt = crypt();
        let store = ClusterStore::new();

        let outcome = receive(&base, &crypt, &store, &envelope("node-1", 10), Some("node-1")).await;
        assert_eq!(outcome, Reception::Accepted("node-1".to_string()));
        assert_eq!(store.get("node-1").await.unwrap().updated, 10);
        let first_success = base.peer("node-1").unwrap().last_success_at;
        assert!(first_success.is_some());

        // Equal and older markers are duplicates
        for marker in [10, 9] {
            let outcome =
                receive(&base, &crypt, &store, &envelope("node-1", marker), Some("node-1")).await;
            assert_eq!(outcome, Reception::Duplicate("node-1".to_string()));
        }
        assert_eq!(store.get("node-1").await.unwrap().updated, 10);
        let liveness = base.peer("node-1").unwrap();
        assert_eq!(liveness.last_success_at, first_success);
        assert!(liveness.beating);
        assert_eq!(base.stats().errors, 0);
    }

    #[tokio::test]
    async fn test_receive_malformed_counts_error() {
        let base = rx_base();
        let store = ClusterStore::new();

        let outcome = receive(&base, &crypt(), &store, b"\x13\x37 random bytes", Some("node-1")).await;
        assert_eq!(outcome, Reception::Rejected);
        assert_eq!(base.stats().errors, 1);
        assert!(store.get("node-1").await.is_none());

        // Still wire activity for the address owner
        let liveness = base.peer("node-1").unwrap();
        assert!(liveness.beating);
        assert!(liveness.last_success_at.is_none());
    }

    #[tokio::test]
    async fn test_receive_admits_unknown_sender() {
        let base = rx_base();
        let store = ClusterStore::new();
        store.configure_members(["node-1", "node-2"]).await;

        let outcome = receive(&base, &crypt(), &store, &envelope("node-7", 1), None).await;
        assert_eq!(outcome, Reception::Accepted("node-7".to_string()));
        assert!(base.has_peer("node-7"));
        assert_eq!(store.membership("node-7").await, Some(Membership::Observed));
        assert_eq!(store.admissions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_receive_trusts_embedded_sender() {
        let base = rx_base();
        let store = ClusterStore::new();

        // Frame from node-1's address, sealed by node-3
        let outcome = receive(&base, &crypt(), &store, &envelope("node-3", 5), Some("node-1")).await;
        assert_eq!(outcome, Reception::Accepted("node-3".to_string()));
        assert!(store.get("node-3").await.is_some());
        assert!(store.get("node-1").await.is_none());
    }

    #[tokio::test]
    async fn test_receive_ignores_own_frames() {
        let base = rx_base();
        let store = ClusterStore::new();
        let outcome = receive(&base, &crypt(), &store, &envelope("node-2", 5), None).await;
        assert_eq!(outcome, Reception::Ignored);
        assert!(store.get("node-2").await.is_none());
    }

    #[tokio::test]
    async fn test_two_node_exchange() {
        let store_b = ClusterStore::new();
        let receiver = Arc::new(UnicastReceiver::new(
            settings(
                "node-b",
                &["node-a", "node-b"],
                &[("addr", "127.0.0.1".into()), ("port", 0.into())],
            ),
            crypt(),
            store_b.clone(),
        ));
        let addr = start_receiver(&receiver).await;

        let sender = UnicastSender::new(
            settings(
                "node-a",
                &["node-a", "node-b"],
                &[
                    ("addr", "127.0.0.1".into()),
                    ("port", addr.port().into()),
                    ("timeout", 15.into()),
                ],
            ),
            crypt(),
            status("node-a"),
            ClusterStore::new(),
            Ticker::new(),
        );
        sender.beat().await;
        assert_eq!(sender.base().stats().errors, 0);
        assert!(sender.base().peer("node-b").unwrap().last_success_at.is_some());

        let deadline = Instant::now() + Duration::from_secs(5);
        while store_b.get("node-a").await.is_none() {
            assert!(Instant::now() < deadline, "status never arrived");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let timeout = Duration::from_secs(15);
        let liveness = receiver.base().peer("node-a").unwrap();
        assert!(liveness.is_up(timeout));
        // Silent for a whole window: consumers must see the peer down
        assert!(!liveness.is_up_at(Instant::now() + timeout, timeout));

        receiver.base().stop();
    }

    #[tokio::test]
    async fn test_sender_failure_does_not_abort_round() {
        // node-b is unreachable, node-c receives
        let store_c = ClusterStore::new();
        let receiver = Arc::new(UnicastReceiver::new(
            settings(
                "node-c",
                &["node-a", "node-c"],
                &[("addr", "127.0.0.1".into()), ("port", 0.into())],
            ),
            crypt(),
            store_c.clone(),
        ));
        let addr = start_receiver(&receiver).await;

        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_port = closed.local_addr().unwrap().port();
        drop(closed);

        let sender = UnicastSender::new(
            settings(
                "node-a",
                &["node-a", "node-b", "node-c"],
                &[
                    ("addr", "127.0.0.1".into()),
                    ("port@node-b", dead_port.into()),
                    ("port@node-c", addr.port().into()),
                ],
            ),
            crypt(),
            status("node-a"),
            ClusterStore::new(),
            Ticker::new(),
        );
        sender.beat().await;
        sender.beat().await;

        let stats = sender.base().stats();
        assert_eq!(stats.beats, 4);
        assert_eq!(stats.errors, 2);
        assert!(!sender.base().peer("node-b").unwrap().consecutive_success);
        assert!(sender.base().peer("node-c").unwrap().consecutive_success);

        receiver.base().stop();
    }

    #[tokio::test]
    async fn test_handler_pool_is_bounded() {
        let receiver = Arc::new(UnicastReceiver::new(
            settings(
                "node-b",
                &["node-a", "node-b"],
                &[("addr", "127.0.0.1".into()), ("port", 0.into())],
            ),
            crypt(),
            ClusterStore::new(),
        ));
        let addr = start_receiver(&receiver).await;
        let capacity = receiver.capacity();
        assert_eq!(capacity, 4);

        // Idle connections hold their handler until the read timeout
        let mut held = Vec::new();
        for _ in 0..capacity {
            held.push(TcpStream::connect(addr).await.unwrap());
        }
        let deadline = Instant::now() + Duration::from_secs(1);
        while receiver.in_flight() < capacity {
            assert!(Instant::now() < deadline, "handlers not spawned");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // One more is dropped right away
        let mut extra = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(1), extra.read(&mut buf)).await;
        assert!(matches!(read, Ok(Ok(0)) | Ok(Err(_))));
        assert_eq!(receiver.in_flight(), capacity);

        receiver.base().stop();
        drop(held);
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_receiver_alive() {
        let store = ClusterStore::new();
        let receiver = Arc::new(UnicastReceiver::new(
            settings(
                "node-b",
                &["node-a", "node-b"],
                &[("addr", "127.0.0.1".into()), ("port", 0.into())],
            ),
            crypt(),
            store.clone(),
        ));
        let addr = start_receiver(&receiver).await;

        let mut garbage = TcpStream::connect(addr).await.unwrap();
        garbage.write_all(b"\xde\xad\xbe\xef not an envelope\0").await.unwrap();
        drop(garbage);

        let deadline = Instant::now() + Duration::from_secs(5);
        while receiver.base().stats().errors == 0 {
            assert!(Instant::now() < deadline, "error never counted");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // A valid frame still goes through afterwards
        let mut valid = TcpStream::connect(addr).await.unwrap();
        let mut frame = envelope("node-a", 3);
        frame.push(FRAME_TERMINATOR);
        valid.write_all(&frame).await.unwrap();
        drop(valid);

        while store.get("node-a").await.is_none() {
            assert!(Instant::now() < deadline, "valid frame lost");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        receiver.base().stop();
    }

    #[tokio::test]
    async fn test_admitted_peer_raises_capacity() {
        let receiver = UnicastReceiver::new(
            settings("node-b", &["node-a", "node-b"], &[]),
            crypt(),
            ClusterStore::new(),
        );
        assert_eq!(receiver.capacity(), HANDLERS_PER_PEER);

        let outcome = receive(
            receiver.base(),
            &crypt(),
            &ClusterStore::new(),
            &envelope("node-7", 1),
            None,
        )
        .await;
        assert_eq!(outcome, Reception::Accepted("node-7".to_string()));
        assert_eq!(receiver.capacity(), 2 * HANDLERS_PER_PEER);
    }

    #[tokio::test]
    async fn test_silent_peers_go_stale_while_others_send() {
        let store = ClusterStore::new();
        let receiver = Arc::new(UnicastReceiver::new(
            settings(
                "node-b",
                &["node-a", "node-b", "node-c"],
                &[
                    ("addr", "127.0.0.1".into()),
                    ("port", 0.into()),
                    ("timeout", 1.into()),
                ],
            ),
            crypt(),
            store.clone(),
        ));
        let addr = start_receiver(&receiver).await;

        // node-7 is not configured and gets admitted
        send_raw(addr, "node-a", 1).await;
        send_raw(addr, "node-7", 1).await;
        let deadline = Instant::now() + Duration::from_secs(5);
        while store.get("node-a").await.is_none() || store.get("node-7").await.is_none() {
            assert!(Instant::now() < deadline, "first frames never arrived");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(receiver.base().peer("node-7").unwrap().beating);

        // node-c connects far more often than the accept timeout
        let busy_until = Instant::now() + Duration::from_millis(3500);
        let mut marker = 1;
        while Instant::now() < busy_until {
            send_raw(addr, "node-c", marker).await;
            marker += 1;
            tokio::time::sleep(Duration::from_millis(300)).await;
        }

        assert!(!receiver.base().peer("node-a").unwrap().beating);
        assert!(!receiver.base().peer("node-7").unwrap().beating);
        assert!(receiver.base().peer("node-c").unwrap().beating);

        receiver.base().stop();
    }

    #[tokio::test]
    async fn test_rebinds_when_port_changes() {
        let store = ClusterStore::new();
        let nodes = ["node-a", "node-b"];
        let receiver = Arc::new(UnicastReceiver::new(
            loopback("node-b", &nodes, 0),
            crypt(),
            store.clone(),
        ));
        let first = start_receiver(&receiver).await;

        let free = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = free.local_addr().unwrap().port();
        drop(free);
        assert_ne!(first.port(), port);

        receiver.base().reconfigure(loopback("node-b", &nodes, port));

        // Picked up on the next loop pass, at the latest after an accept timeout
        let deadline = Instant::now() + ACCEPT_TIMEOUT + Duration::from_secs(3);
        while receiver.local_addr().is_none_or(|bound| bound.port() != port) {
            assert!(Instant::now() < deadline, "receiver did not rebind");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        send_raw(SocketAddr::new(first.ip(), port), "node-a", 1).await;
        while store.get("node-a").await.is_none() {
            assert!(Instant::now() < deadline, "frame on the new port lost");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        receiver.base().stop();
    }

    #[tokio::test]
    async fn test_empty_connection_counts_error() {
        let store = ClusterStore::new();
        let receiver = Arc::new(UnicastReceiver::new(
            loopback("node-b", &["node-a", "node-b"], 0),
            crypt(),
            store.clone(),
        ));
        let addr = start_receiver(&receiver).await;

        let silent = TcpStream::connect(addr).await.unwrap();
        drop(silent);

        let deadline = Instant::now() + Duration::from_secs(5);
        while receiver.base().stats().errors == 0 {
            assert!(Instant::now() < deadline, "empty connection not counted");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(receiver.base().stats().beats, 1);
        assert!(store.nodes().await.is_empty());

        receiver.base().stop();
    }

    #[tokio::test]
    async fn test_shutdown_joins_handlers() {
        let receiver = Arc::new(UnicastReceiver::new(
            settings(
                "node-b",
                &["node-a", "node-b"],
                &[("addr", "127.0.0.1".into()), ("port", 0.into())],
            ),
            crypt(),
            ClusterStore::new(),
        ));
        let task = receiver.clone();
        let handle = tokio::spawn(async move { task.run().await });
        let deadline = Instant::now() + Duration::from_secs(5);
        while receiver.local_addr().is_none() {
            assert!(Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let addr = receiver.local_addr().unwrap();

        let idle = TcpStream::connect(addr).await.unwrap();
        while receiver.in_flight() == 0 {
            assert!(Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let start = Instant::now();
        receiver.base().stop();
        tokio::time::timeout(READ_TIMEOUT + ACCEPT_TIMEOUT, handle)
            .await
            .expect("shutdown exceeded the configured timeouts")
            .unwrap();

        // The idle handler was waited for, not abandoned
        assert_eq!(receiver.in_flight(), 0);
        assert!(start.elapsed() <= READ_TIMEOUT + ACCEPT_TIMEOUT);
        assert!(receiver.local_addr().is_none());
        drop(idle);
    }
}
