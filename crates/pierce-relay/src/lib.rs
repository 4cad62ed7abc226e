//! # Pierce Relay
//!
//! Relay fallback for peers that cannot reach each other directly.
//!
//! This crate provides:
//! - [`RelayService`], a TCP relay that admits `RELAY <node-id>` legs, pairs
//!   them by coordinator-issued reservation and forwards bytes both ways
//! - [`BandwidthLimiter`], sliding-window per-node and per-session caps that
//!   delay (never drop) forwarded chunks
//! - [`RelaySelector`], scoring relay-capable nodes by load, latency and
//!   bandwidth
//! - [`dial`], the client side of the relay handshake
//!
//! ## Example
//!
//! ```rust,no_run
//! use pierce_relay::{RelayService, RelayServiceConfig, Reservation, dial};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let relay = RelayService::start(RelayServiceConfig::default(), None);
//! let addr = relay.listen("0.0.0.0:7401".parse()?).await?;
//! relay.reserve(Reservation::new("a1b2", "node-a", "node-b")).await;
//!
//! // On node-a
//! let stream = dial(addr, "node-b", Duration::from_secs(10)).await?;
//! # drop(stream);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bandwidth;
pub mod client;
pub mod error;
pub mod handshake;
pub mod selector;
pub mod service;
pub mod session;

pub use bandwidth::{BandwidthCaps, BandwidthCounter, BandwidthLimiter};
pub use client::dial;
pub use error::RelayError;
pub use selector::{RelayNode, RelaySelector, ScoreWeights, SelectorConfig};
pub use service::{RelayService, RelayServiceConfig, Reservation};
pub use session::{CHUNK_SIZE, Direction, RelaySession, SessionSnapshot, new_session_id};
