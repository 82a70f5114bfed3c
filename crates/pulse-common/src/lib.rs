//! # Pulse Common
//!
//! Shared types and constants used by the Pulse heartbeat daemon and its
//! tooling.
//!
//! ## Modules
//! - `types` - Wire and status structures (NodeStatus, relay requests, stats)
//! - `error` - Common error type
//! - `constants` - Protocol constants and defaults

pub mod constants;
pub mod error;
pub mod types;

pub use error::PulseError;
pub use types::*;
