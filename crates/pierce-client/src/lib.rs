//! # Pierce Client
//!
//! Peer-side connection engine for Pierce.
//!
//! A [`PeerClient`] classifies its NAT, registers with the coordinator over a
//! signaling channel and then establishes connections to other peers, falling
//! back from direct connection to hole punching to a relay. Each attempt
//! yields a [`Connection`] or a [`ConnectError`] listing every strategy tried.
//!
//! ## Example
//!
//! ```rust,no_run
//! use pierce_client::{ClientConfig, NoopMapper, PeerClient};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = ClientConfig::new("ws://coordinator.example:7400", "node-a");
//! config.classifier.reflectors = vec!["198.51.100.1:3478".parse()?];
//! config.punch.local_port = 40000;
//!
//! let client = PeerClient::start(config, Arc::new(NoopMapper)).await?;
//! let connection = client.connect("node-b").await?;
//! println!("connected via {}", connection.strategy);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod engine;
pub mod error;
mod inbox;
pub mod mapper;

pub use config::{ClientConfig, HostedRelayConfig};
pub use engine::{Connection, LocalView, PeerClient};
pub use error::{AttemptReport, ConnectError, StageFailure};
pub use mapper::{MapperError, MappingProtocol, NoopMapper, PortMapper};
