//! Shared constants for Pulse components.

use std::time::Duration;

/// Default HTTP listen address (status export and relay service)
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:1215";

/// Port the relay service is reached on when a relay target gives none
pub const DEFAULT_RELAY_PORT: u16 = 1215;

/// Default unicast heartbeat port
pub const DEFAULT_UNICAST_PORT: u16 = 10000;

/// Wildcard bind address used for the local node
pub const WILDCARD_ADDR: &str = "0.0.0.0";

/// Default heartbeat period (seconds)
pub const DEFAULT_INTERVAL_SECS: u64 = 5;

/// Default liveness timeout (seconds)
pub const DEFAULT_TIMEOUT_SECS: u64 = 15;

/// Unicast connect timeout
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Unicast accept timeout (bounds shutdown latency of the receiver)
pub const ACCEPT_TIMEOUT: Duration = Duration::from_secs(2);

/// Read timeout for a single inbound unicast frame
pub const READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Relay request channel timeout
pub const RELAY_RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// Concurrent unicast handlers allowed per configured peer
pub const HANDLERS_PER_PEER: usize = 4;

/// Largest inbound unicast frame accepted
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Envelope text prefix
pub const CRYPT_PREFIX: &str = "crypt:";

/// Unicast frame terminator
pub const FRAME_TERMINATOR: u8 = 0;

/// HTTP header names used by the relay request channel
pub mod headers {
    /// Name of the requesting node
    pub const X_NODE_NAME: &str = "X-Node-Name";

    /// Relay shared secret
    pub const X_RELAY_SECRET: &str = "X-Relay-Secret";
}
