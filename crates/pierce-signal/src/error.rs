//! Signaling errors

use crate::envelope::EnvelopeError;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Signaling channel error
#[derive(Debug, Error)]
pub enum SignalError {
    /// The bounded send queue is full
    #[error("signaling send queue is full")]
    Backpressure,
    /// The channel was closed by its owner
    #[error("signaling channel closed")]
    Closed,
    /// A wait on the channel exceeded its deadline
    #[error("signaling operation timed out")]
    Timeout,
    /// The signaling URL could not be turned into a request
    #[error("invalid signaling URL: {0}")]
    InvalidUrl(String),
    /// Envelope encode/decode failure
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    /// Transport failure
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] Box<tungstenite::Error>),
}

impl From<tungstenite::Error> for SignalError {
    fn from(err: tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}

impl SignalError {
    /// Whether retrying later may succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Backpressure | Self::Timeout | Self::WebSocket(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(SignalError::Backpressure.is_transient());
        assert!(SignalError::Timeout.is_transient());
        assert!(!SignalError::Closed.is_transient());
        assert!(!SignalError::InvalidUrl("x".into()).is_transient());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            SignalError::Backpressure.to_string(),
            "signaling send queue is full"
        );
        assert_eq!(SignalError::Closed.to_string(), "signaling channel closed");
    }
}
