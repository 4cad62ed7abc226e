//! Error types for coordinator operations

use pierce_signal::NodeId;
use thiserror::Error;

/// Coordinator errors
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Peer has no live signaling channel
    #[error("peer {0} is offline")]
    PeerOffline(NodeId),

    /// Peer's outbound queue is full
    #[error("signaling queue for {0} is full")]
    Backpressure(NodeId),

    /// No relay candidate survives the exclusions
    #[error("no relay available: {0}")]
    RelayUnavailable(#[source] pierce_relay::RelayError),

    /// Socket failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Coordinator is shutting down
    #[error("coordinator is shutting down")]
    ShuttingDown,
}

impl CoordinatorError {
    /// Whether the same request may succeed later
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Backpressure(_) | Self::RelayUnavailable(_) | Self::Io(_))
    }
}
