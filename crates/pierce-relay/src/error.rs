//! Error types for relay operations

use thiserror::Error;

/// Relay errors
#[derive(Debug, Error)]
pub enum RelayError {
    /// Socket failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Handshake did not arrive (or was not answered) in time
    #[error("relay handshake timed out")]
    HandshakeTimeout,

    /// First payload was not a `RELAY <id>` request
    #[error("malformed relay handshake: {0}")]
    MalformedHandshake(String),

    /// Relay answered with an error line; the text is kept verbatim
    #[error("relay rejected handshake: {0}")]
    HandshakeRejected(String),

    /// No relay in the pool survives the exclusions
    #[error("no relay candidates available")]
    NoCandidates,

    /// Relay is at its session limit
    #[error("relay at capacity ({0} sessions)")]
    AtCapacity(usize),

    /// Service has been shut down
    #[error("relay service is shutting down")]
    ShuttingDown,
}

impl RelayError {
    /// Whether retrying against another relay (or later) can help
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::HandshakeTimeout | Self::AtCapacity(_)
        )
    }
}
