//! NAT classes, strategies and attempt results

use crate::conn::Conn;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// NAT behavior classification
///
/// Different classes permit different traversal strategies:
/// - None: public address, direct connection possible
/// - Full Cone: easy to traverse, any external host can send
/// - Restricted Cone: needs simultaneous open
/// - Port Restricted Cone: needs simultaneous open
/// - Symmetric: hardest to traverse, usually needs a relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NatClass {
    /// No NAT detected, public IP address
    None,
    /// Full Cone NAT - any external host can send to mapped port
    FullCone,
    /// Restricted Cone NAT - only contacted IPs can send
    RestrictedCone,
    /// Port Restricted Cone NAT - only contacted IP:port can send
    PortRestrictedCone,
    /// Symmetric NAT - different mapping per destination
    Symmetric,
    /// Classification failed or has not run yet
    #[default]
    Unknown,
}

impl NatClass {
    /// Wire name, as used in signaling payloads and config files
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::FullCone => "full_cone",
            Self::RestrictedCone => "restricted_cone",
            Self::PortRestrictedCone => "port_restricted_cone",
            Self::Symmetric => "symmetric",
            Self::Unknown => "unknown",
        }
    }

    /// Reachable enough to forward traffic for others
    #[must_use]
    pub const fn is_relay_capable(self) -> bool {
        matches!(self, Self::None | Self::FullCone)
    }

    /// Whether TCP simultaneous open has a realistic chance through this NAT
    #[must_use]
    pub const fn tcp_punch_plausible(self) -> bool {
        matches!(self, Self::FullCone | Self::RestrictedCone)
    }

    /// Lower is easier to reach from outside
    ///
    /// Used to decide which side of a direct connection accepts.
    #[must_use]
    pub const fn reachability_rank(self) -> u8 {
        match self {
            Self::None => 0,
            Self::FullCone => 1,
            Self::RestrictedCone => 2,
            Self::PortRestrictedCone => 3,
            Self::Unknown => 4,
            Self::Symmetric => 5,
        }
    }
}

impl fmt::Display for NatClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "Open (No NAT)"),
            Self::FullCone => write!(f, "Full Cone NAT"),
            Self::RestrictedCone => write!(f, "Restricted Cone NAT"),
            Self::PortRestrictedCone => write!(f, "Port Restricted Cone NAT"),
            Self::Symmetric => write!(f, "Symmetric NAT"),
            Self::Unknown => write!(f, "Unknown NAT Type"),
        }
    }
}

impl FromStr for NatClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "full_cone" => Ok(Self::FullCone),
            "restricted_cone" => Ok(Self::RestrictedCone),
            "port_restricted_cone" => Ok(Self::PortRestrictedCone),
            "symmetric" => Ok(Self::Symmetric),
            "unknown" => Ok(Self::Unknown),
            other => Err(format!("unknown NAT class: {other}")),
        }
    }
}

/// Connection strategy, in order of preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Plain connection to the peer's advertised address
    Direct,
    /// UDP and/or TCP simultaneous open
    HolePunch,
    /// Forwarded through a relay node
    Relay,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::HolePunch => write!(f, "hole-punch"),
            Self::Relay => write!(f, "relay"),
        }
    }
}

/// Why a single strategy stage did not produce a connection
///
/// These are expected outcomes, reported upwards as data rather than
/// aborting the overall connection attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttemptFailure {
    /// Stage deadline elapsed
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// Cancelled by the caller or by a competing strategy
    #[error("cancelled")]
    Cancelled,
    /// NAT classes rule this stage out
    #[error("not eligible: {0}")]
    Ineligible(String),
    /// Socket-level failure
    #[error("I/O error: {0}")]
    Io(String),
    /// The remote side answered with a refusal
    #[error("rejected: {0}")]
    Rejected(String),
}

impl From<std::io::Error> for AttemptFailure {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Outcome of one strategy stage
#[derive(Debug)]
pub struct ConnectionAttemptResult {
    /// Strategy that produced this result
    pub strategy: Strategy,
    /// Established connection, owned by the caller
    pub conn: Option<Conn>,
    /// Failure reason when no connection was made
    pub error: Option<AttemptFailure>,
}

impl ConnectionAttemptResult {
    /// Successful attempt
    #[must_use]
    pub fn success(strategy: Strategy, conn: Conn) -> Self {
        Self {
            strategy,
            conn: Some(conn),
            error: None,
        }
    }

    /// Failed attempt
    #[must_use]
    pub fn failure(strategy: Strategy, error: AttemptFailure) -> Self {
        Self {
            strategy,
            conn: None,
            error: Some(error),
        }
    }

    /// Whether a connection was established
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.conn.is_some()
    }

    /// Split into the connection or the failure reason
    ///
    /// # Errors
    ///
    /// Returns the recorded failure when no connection was established.
    pub fn into_result(self) -> Result<Conn, AttemptFailure> {
        match (self.conn, self.error) {
            (Some(conn), _) => Ok(conn),
            (None, Some(err)) => Err(err),
            (None, None) => Err(AttemptFailure::Cancelled),
        }
    }
}

/// Check if an IP address is public (not private/loopback/link-local)
#[must_use]
pub fn is_public_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            !ipv4.is_private()
                && !ipv4.is_loopback()
                && !ipv4.is_link_local()
                && !ipv4.is_unspecified()
                && !ipv4.is_broadcast()
                // 100.64.0.0/10, carrier-grade NAT
                && !(ipv4.octets()[0] == 100 && (ipv4.octets()[1] & 0xC0) == 64)
        }
        IpAddr::V6(ipv6) => {
            !ipv6.is_loopback()
                && !ipv6.is_multicast()
                && !ipv6.is_unspecified()
                // fc00::/7 unique local, fe80::/10 link local
                && (ipv6.segments()[0] & 0xFE00) != 0xFC00
                && (ipv6.segments()[0] & 0xFFC0) != 0xFE80
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nat_class_display() {
        assert_eq!(NatClass::None.to_string(), "Open (No NAT)");
        assert_eq!(NatClass::FullCone.to_string(), "Full Cone NAT");
        assert_eq!(NatClass::Symmetric.to_string(), "Symmetric NAT");
    }

    #[test]
    fn test_nat_class_wire_names() {
        for class in [
            NatClass::None,
            NatClass::FullCone,
            NatClass::RestrictedCone,
            NatClass::PortRestrictedCone,
            NatClass::Symmetric,
            NatClass::Unknown,
        ] {
            assert_eq!(class.as_str().parse::<NatClass>().unwrap(), class);
            let json = serde_json::to_string(&class).unwrap();
            assert_eq!(json, format!("\"{}\"", class.as_str()));
        }
        assert!("cone".parse::<NatClass>().is_err());
    }

    #[test]
    fn test_relay_capable() {
        assert!(NatClass::None.is_relay_capable());
        assert!(NatClass::FullCone.is_relay_capable());
        assert!(!NatClass::RestrictedCone.is_relay_capable());
        assert!(!NatClass::Symmetric.is_relay_capable());
    }

    #[test]
    fn test_tcp_punch_plausible() {
        assert!(NatClass::FullCone.tcp_punch_plausible());
        assert!(NatClass::RestrictedCone.tcp_punch_plausible());
        assert!(!NatClass::PortRestrictedCone.tcp_punch_plausible());
        assert!(!NatClass::Symmetric.tcp_punch_plausible());
    }

    #[test]
    fn test_is_public_ip() {
        // Private IPs
        assert!(!is_public_ip(&"192.168.1.1".parse().unwrap()));
        assert!(!is_public_ip(&"10.0.0.1".parse().unwrap()));
        assert!(!is_public_ip(&"172.16.0.1".parse().unwrap()));
        assert!(!is_public_ip(&"100.72.1.1".parse().unwrap()));

        // Loopback
        assert!(!is_public_ip(&"127.0.0.1".parse().unwrap()));
        assert!(!is_public_ip(&"::1".parse().unwrap()));

        // Link-local
        assert!(!is_public_ip(&"169.254.1.1".parse().unwrap()));
        assert!(!is_public_ip(&"fe80::1".parse().unwrap()));

        // Public IPs
        assert!(is_public_ip(&"8.8.8.8".parse().unwrap()));
        assert!(is_public_ip(&"203.0.113.1".parse().unwrap()));
        assert!(is_public_ip(&"2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn test_attempt_result_accessors() {
        let failed = ConnectionAttemptResult::failure(
            Strategy::HolePunch,
            AttemptFailure::Timeout(Duration::from_secs(10)),
        );
        assert!(!failed.is_success());
        assert_eq!(failed.strategy, Strategy::HolePunch);
        assert_eq!(
            failed.into_result().unwrap_err(),
            AttemptFailure::Timeout(Duration::from_secs(10))
        );
    }

    #[test]
    fn test_strategy_display() {
        assert_eq!(Strategy::Direct.to_string(), "direct");
        assert_eq!(Strategy::HolePunch.to_string(), "hole-punch");
        assert_eq!(Strategy::Relay.to_string(), "relay");
    }
}
