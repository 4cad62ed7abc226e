//! Error types for connection attempts

use pierce_nat::{AttemptFailure, NatError, Strategy};
use pierce_relay::RelayError;
use pierce_signal::{NodeId, SignalError};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Why a connection attempt, or one stage of it, failed
#[derive(Debug, Error)]
pub enum ConnectError {
    /// No reflector produced a usable mapping
    #[error("NAT classification failed: {0}")]
    ClassificationFailed(#[from] NatError),

    /// Direct connect or hole punch produced no path
    #[error("{strategy} failed: {failure}")]
    PunchFailed {
        /// Stage that failed
        strategy: Strategy,
        /// Reason reported by the stage
        failure: AttemptFailure,
    },

    /// No eligible relay, or the relay could not be reached
    #[error("relay unavailable: {0}")]
    RelayUnavailable(String),

    /// Relay answered the handshake with an error line, kept verbatim
    #[error("relay rejected handshake: {0}")]
    HandshakeRejected(String),

    /// Target has no live signaling channel
    #[error("peer {0} is offline")]
    PeerOffline(NodeId),

    /// A stage exceeded its deadline
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Signaling channel failure
    #[error("signaling error: {0}")]
    Signaling(#[from] SignalError),

    /// Every applicable strategy failed
    #[error("could not connect to {}: {}", .0.peer_id, .0)]
    Exhausted(AttemptReport),

    /// The client is shutting down
    #[error("client is shutting down")]
    ShuttingDown,
}

impl ConnectError {
    /// Whether the same connection attempt may succeed later
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ClassificationFailed(e) => e.is_transient(),
            Self::Signaling(e) => e.is_transient(),
            Self::PunchFailed { .. } | Self::RelayUnavailable(_) | Self::Timeout(_) => true,
            Self::Exhausted(report) => report.stages.iter().any(|s| s.error.is_transient()),
            Self::HandshakeRejected(_) | Self::PeerOffline(_) | Self::ShuttingDown => false,
        }
    }

    pub(crate) fn stage(strategy: Strategy, failure: AttemptFailure) -> Self {
        match failure {
            AttemptFailure::Timeout(after) => Self::Timeout(after),
            failure => Self::PunchFailed { strategy, failure },
        }
    }
}

impl From<RelayError> for ConnectError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::HandshakeRejected(text) => Self::HandshakeRejected(text),
            RelayError::ShuttingDown => Self::ShuttingDown,
            other => Self::RelayUnavailable(other.to_string()),
        }
    }
}

/// One strategy that was tried and did not connect
#[derive(Debug)]
pub struct StageFailure {
    /// Strategy tried
    pub strategy: Strategy,
    /// Why it failed
    pub error: ConnectError,
    /// Time spent in the stage
    pub elapsed: Duration,
}

/// Every stage a `connect` went through, in order
#[derive(Debug, Default)]
pub struct AttemptReport {
    /// Remote node
    pub peer_id: NodeId,
    /// Failed stages
    pub stages: Vec<StageFailure>,
}

impl AttemptReport {
    pub(crate) fn new(peer_id: impl Into<NodeId>) -> Self {
        Self {
            peer_id: peer_id.into(),
            stages: Vec::new(),
        }
    }

    pub(crate) fn record(&mut self, strategy: Strategy, error: ConnectError, elapsed: Duration) {
        tracing::debug!("{} to {} failed after {:?}: {}", strategy, self.peer_id, elapsed, error);
        self.stages.push(StageFailure {
            strategy,
            error,
            elapsed,
        });
    }

    /// Strategies tried, in order
    #[must_use]
    pub fn strategies(&self) -> Vec<Strategy> {
        self.stages.iter().map(|s| s.strategy).collect()
    }

    /// Failure of the last stage tried
    #[must_use]
    pub fn last_error(&self) -> Option<&ConnectError> {
        self.stages.last().map(|s| &s.error)
    }
}

impl fmt::Display for AttemptReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.stages.is_empty() {
            return write!(f, "no strategy attempted");
        }
        for (i, stage) in self.stages.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}: {}", stage.strategy, stage.error)?;
        }
        Ok(())
    }
}
