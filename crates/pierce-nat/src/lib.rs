//! # Pierce NAT
//!
//! NAT traversal layer for Pierce.
//!
//! This crate provides:
//! - A strict STUN Binding codec and client (RFC 5389 subset)
//! - NAT behavior classification against one or more reflectors
//! - UDP and TCP hole punching, raced under a shared deadline
//! - Direct TCP connection racing for reachable peers
//! - A minimal STUN reflector for self-hosted deployments
//!
//! ## NAT classes
//!
//! - **None**: public address, nothing in the way
//! - **Full Cone**: any external host can send to the mapped port
//! - **Restricted Cone**: only contacted IPs can send back
//! - **Port Restricted Cone**: only contacted IP:port pairs can send back
//! - **Symmetric**: a different mapping per destination
//!
//! ## Example
//!
//! ```rust,no_run
//! use pierce_nat::{ClassifierConfig, NatClassifier};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ClassifierConfig {
//!     reflectors: vec!["198.51.100.1:3478".parse()?, "198.51.100.2:3478".parse()?],
//!     ..ClassifierConfig::default()
//! };
//! let classification = NatClassifier::new(config).classify().await?;
//! println!("NAT class: {}", classification.nat_class);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod classify;
pub mod conn;
pub mod direct;
pub mod puncher;
pub mod reflector;
pub mod socket;
pub mod stun;
pub mod tcp_punch;
pub mod types;
pub mod udp_punch;

pub use classify::{Classification, ClassifierConfig, NatClassifier, NatError, classify};
pub use conn::{Conn, PunchedUdp};
pub use direct::{DirectRole, connect_direct};
pub use puncher::{HolePuncher, PunchConfig, PunchRole};
pub use reflector::StunReflector;
pub use stun::{StunAttribute, StunClient, StunError, StunMessage, StunMessageClass};
pub use types::{AttemptFailure, ConnectionAttemptResult, NatClass, Strategy, is_public_ip};
