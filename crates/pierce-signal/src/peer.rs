//! Peer records and the capabilities the core consumes
//!
//! Identity, authentication and persistence live outside this system; the
//! core only sees them through [`PeerDirectory`] and [`AuthValidator`].

use chrono::{DateTime, Utc};
use pierce_nat::NatClass;
use std::collections::HashMap;
use std::net::SocketAddr;
use thiserror::Error;

/// Node identifier
pub type NodeId = String;

/// What the coordinator knows about a live peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    /// Node identifier
    pub node_id: NodeId,
    /// Last reported NAT class
    pub nat_class: NatClass,
    /// Reflected address, once classified
    pub external_addr: Option<SocketAddr>,
    /// LAN address of the punch socket
    pub local_addr: Option<SocketAddr>,
    /// Last envelope received from the peer
    pub last_seen: DateTime<Utc>,
}

impl PeerRecord {
    /// Fresh record for a node that has not reported yet
    #[must_use]
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            nat_class: NatClass::Unknown,
            external_addr: None,
            local_addr: None,
            last_seen: Utc::now(),
        }
    }

    /// Whether `other` appears to sit on this peer's LAN
    ///
    /// True when either peer's reflected address equals the other's local
    /// address.
    #[must_use]
    pub fn shares_lan_with(&self, other: &PeerRecord) -> bool {
        let matches = |a: Option<SocketAddr>, b: Option<SocketAddr>| matches!((a, b), (Some(a), Some(b)) if a == b);
        matches(self.external_addr, other.local_addr) || matches(other.external_addr, self.local_addr)
    }
}

/// Lookup of live peers by id
pub trait PeerDirectory: Send + Sync {
    /// Current record for `node_id`, if the node is online
    fn lookup(&self, node_id: &str) -> Option<PeerRecord>;
}

impl<T: PeerDirectory + ?Sized> PeerDirectory for std::sync::Arc<T> {
    fn lookup(&self, node_id: &str) -> Option<PeerRecord> {
        (**self).lookup(node_id)
    }
}

/// Authentication failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// A token was required but none was presented
    #[error("missing credentials")]
    Missing,
    /// The token was not accepted
    #[error("invalid credentials")]
    Invalid,
}

/// Validates bearer tokens presented on signaling upgrade
pub trait AuthValidator: Send + Sync {
    /// Check `token` (absent when no `Authorization` header was sent)
    ///
    /// `Ok(Some(id))` pins the connection to node `id`; `Ok(None)` lets the
    /// first envelope choose the identity.
    ///
    /// # Errors
    ///
    /// Returns `AuthError` when the upgrade must be refused.
    fn validate(&self, token: Option<&str>) -> Result<Option<NodeId>, AuthError>;
}

/// Accept every connection
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AuthValidator for AllowAll {
    fn validate(&self, _token: Option<&str>) -> Result<Option<NodeId>, AuthError> {
        Ok(None)
    }
}

/// Fixed token table, token to node id
#[derive(Debug, Clone, Default)]
pub struct StaticTokens {
    tokens: HashMap<String, NodeId>,
}

impl StaticTokens {
    /// Build from (token, node id) pairs
    #[must_use]
    pub fn new(tokens: impl IntoIterator<Item = (String, NodeId)>) -> Self {
        Self {
            tokens: tokens.into_iter().collect(),
        }
    }
}

impl AuthValidator for StaticTokens {
    fn validate(&self, token: Option<&str>) -> Result<Option<NodeId>, AuthError> {
        let token = token.ok_or(AuthError::Missing)?;
        self.tokens
            .get(token)
            .cloned()
            .map(Some)
            .ok_or(AuthError::Invalid)
    }
}

/// Pull the token out of an `Authorization: Bearer <token>` header value
#[must_use]
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, external: &str, local: &str) -> PeerRecord {
        PeerRecord {
            external_addr: Some(external.parse().unwrap()),
            local_addr: Some(local.parse().unwrap()),
            ..PeerRecord::new(id)
        }
    }

    #[test]
    fn test_shares_lan() {
        let a = record("a", "192.168.1.10:4000", "192.168.1.10:4000");
        let b = record("b", "203.0.113.7:5000", "192.168.1.10:4000");
        assert!(a.shares_lan_with(&b));
        assert!(b.shares_lan_with(&a));

        let c = record("c", "198.51.100.2:6000", "10.0.0.3:6000");
        assert!(!a.shares_lan_with(&c));
        assert!(!PeerRecord::new("x").shares_lan_with(&PeerRecord::new("y")));
    }

    #[test]
    fn test_bearer_token() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("bearer  abc "), Some("abc"));
        assert_eq!(bearer_token("Basic abc"), None);
        assert_eq!(bearer_token("abc"), None);
    }

    #[test]
    fn test_validators() {
        assert_eq!(AllowAll.validate(None), Ok(None));

        let tokens = StaticTokens::new([("t1".to_string(), "node-1".to_string())]);
        assert_eq!(tokens.validate(Some("t1")), Ok(Some("node-1".to_string())));
        assert_eq!(tokens.validate(Some("t2")), Err(AuthError::Invalid));
        assert_eq!(tokens.validate(None), Err(AuthError::Missing));
    }
}
