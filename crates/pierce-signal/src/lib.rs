//! # Pierce Signal
//!
//! Signaling layer for Pierce.
//!
//! This crate provides:
//! - The JSON [`SignalEnvelope`] and its closed set of envelope types
//! - [`SignalingChannel`], the client's persistent connection to the
//!   coordinator with keepalive, round-trip estimation and reconnect back-off
//! - [`PeerRecord`] plus the [`PeerDirectory`] and [`AuthValidator`]
//!   capabilities shared by the coordinator and the relay
//!
//! ## Example
//!
//! ```rust,no_run
//! use pierce_signal::{ChannelConfig, Signal, SignalKind, SignalingChannel};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let channel = SignalingChannel::open(ChannelConfig::new("ws://127.0.0.1:7400", "node-a"));
//! channel.register_handler(SignalKind::Error, |env| eprintln!("error: {:?}", env.body));
//! channel.signal(Some("node-b"), Signal::RelayRequest)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod envelope;
pub mod error;
pub mod peer;
pub mod rtt;

pub use channel::{ChannelConfig, ChannelState, Handler, SignalingChannel};
pub use envelope::{
    ConnectPayload, EnvelopeError, ErrorCode, ErrorPayload, NatReport, RelayHealth,
    RelayResponsePayload, Signal, SignalEnvelope, SignalKind,
};
pub use error::SignalError;
pub use peer::{
    AllowAll, AuthError, AuthValidator, NodeId, PeerDirectory, PeerRecord, StaticTokens,
    bearer_token,
};
pub use rtt::RttEstimator;
