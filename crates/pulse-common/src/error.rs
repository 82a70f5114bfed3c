//! Common error types for Pulse components.

use thiserror::Error;

/// Common errors across Pulse components
#[derive(Debug, Error)]
pub enum PulseError {
    /// Configuration error (missing secret, missing relay target, bad value)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Envelope construction error
    #[error("Crypt error: {0}")]
    Crypt(String),

    /// Socket level failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Relay request failure
    #[error("Relay error: {0}")]
    Relay(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PulseError {
    /// Returns true if the failure is expected to clear on a later tick
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Relay(_) | Self::Timeout(_)
        )
    }
}

impl From<std::io::Error> for PulseError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut => Self::Timeout(e.to_string()),
            _ => Self::Transport(e.to_string()),
        }
    }
}
