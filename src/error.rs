//! Probe error types

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while talking to the gateway or analysing targets
#[derive(Debug, Error)]
pub enum ProbeError {
    /// Handshake or transport failure while establishing the link
    #[error("Connection error: {0}")]
    Connection(String),

    /// A request was issued while the link was not ready
    #[error("Not connected to gateway")]
    NotConnected,

    /// A request or agent turn exceeded its bound
    #[error("Request '{method}' timed out after {}s", .after.as_secs_f64())]
    Timeout {
        method: String,
        after: Duration,
    },

    /// The link was closed while a call was outstanding
    #[error("Gateway closed while '{method}' was outstanding")]
    Closed { method: String },

    /// The gateway answered a request with `ok: false`
    #[error("Gateway rejected '{method}': {message}")]
    Remote { method: String, message: String },

    /// No structured answer could be recovered
    #[error("failed to parse agent response: {0}")]
    Parse(String),

    /// A run is already being awaited by another invocation
    #[error("Run {0} is already being awaited")]
    DuplicateRun(String),

    /// Target identifier could not be normalized
    #[error("Invalid target '{target}': {reason}")]
    InvalidTarget { target: String, reason: String },

    /// Frame could not be written or read
    #[error("Transport error: {0}")]
    Transport(String),

    /// Envelope encoding failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProbeError {
    /// True for errors caused by an exceeded time bound
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProbeError::Timeout { .. })
    }

    /// True when the link itself is unusable; retrying cannot help
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            ProbeError::Connection(_)
                | ProbeError::NotConnected
                | ProbeError::Closed { .. }
                | ProbeError::Transport(_)
        )
    }
}
