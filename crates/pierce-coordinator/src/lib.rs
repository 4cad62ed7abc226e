//! # Pierce Coordinator
//!
//! Rendezvous coordinator for Pierce.
//!
//! This crate provides:
//! - [`Registry`], the live peer table keyed by node id
//! - [`determine_strategy`], the connection strategy for a pair of peers
//! - [`Coordinator`], which routes envelopes between peers, answers
//!   `connect` requests and allocates relay sessions
//! - [`SignalServer`], the WebSocket endpoint peers connect to
//!
//! ## Example
//!
//! ```rust,no_run
//! use pierce_coordinator::{Coordinator, CoordinatorConfig, SignalServer};
//! use pierce_signal::AllowAll;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let coordinator = Coordinator::start(CoordinatorConfig::default());
//! let server = SignalServer::new(Arc::clone(&coordinator), Arc::new(AllowAll));
//! server.listen("0.0.0.0:7400".parse()?).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod coordinator;
pub mod error;
pub mod registry;
pub mod server;
pub mod strategy;

pub use coordinator::{ColocatedRelay, Coordinator, CoordinatorConfig};
pub use error::CoordinatorError;
pub use registry::{PeerEntry, PeerHandle, Registry};
pub use server::SignalServer;
pub use strategy::determine_strategy;
