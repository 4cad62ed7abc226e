//! Signaling envelopes
//!
//! On the wire an envelope is a JSON object:
//!
//! ```text
//! { "type": "connect" | "offer" | "answer" | "ice-candidate" | "ping" | "pong" |
//!           "relay-request" | "relay-response" | "error",
//!   "senderId": string, "receiverId": string?,
//!   "payload": object?, "timestamp": RFC3339 }
//! ```
//!
//! In memory the `type`/`payload` pair is a closed enum, [`Signal`], so every
//! consumer matches exhaustively over the envelope kinds.

use crate::peer::NodeId;
use chrono::{DateTime, Utc};
use pierce_nat::{NatClass, Strategy};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;

/// Envelope type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    /// Connection request, routed to the target
    Connect,
    /// NAT report (registration / refresh), or a routed offer
    Offer,
    /// Reply to a connect
    Answer,
    /// Opaque candidate blob, routed verbatim
    IceCandidate,
    /// Keepalive request
    Ping,
    /// Keepalive reply
    Pong,
    /// Request for a relay to the receiver
    RelayRequest,
    /// Relay allocation
    RelayResponse,
    /// Error report
    Error,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connect => "connect",
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice-candidate",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::RelayRequest => "relay-request",
            Self::RelayResponse => "relay-response",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Connectivity metadata carried by `connect` and `answer`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectPayload {
    /// Sender-side NAT class (for `answer`: the described peer's)
    pub nat_type: NatClass,
    /// Reflected IP
    #[serde(rename = "externalIP")]
    pub external_ip: IpAddr,
    /// Reflected port
    pub external_port: u16,
    /// LAN address, used for same-network detection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_addr: Option<SocketAddr>,
    /// Strategy chosen by the coordinator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_type: Option<Strategy>,
    /// Node that asked for the connection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<NodeId>,
}

impl ConnectPayload {
    /// Reflected address as a socket address
    #[must_use]
    pub fn external_addr(&self) -> SocketAddr {
        SocketAddr::new(self.external_ip, self.external_port)
    }
}

/// Relay health figures, reported by relay-capable nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayHealth {
    /// Active relay sessions
    pub load: u32,
    /// Round-trip estimate to the coordinator
    pub latency_ms: u32,
    /// Available forwarding bandwidth
    pub bandwidth_mbps: u32,
}

/// NAT report carried by `offer`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NatReport {
    /// Classified NAT behavior
    pub nat_type: NatClass,
    /// Reflected IP
    #[serde(rename = "externalIP")]
    pub external_ip: IpAddr,
    /// Reflected port
    pub external_port: u16,
    /// LAN address of the punch socket
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_addr: Option<SocketAddr>,
    /// Port of the node's relay listener, when it hosts one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_port: Option<u16>,
    /// Relay health, refreshed periodically
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<RelayHealth>,
}

impl NatReport {
    /// Reflected address as a socket address
    #[must_use]
    pub fn external_addr(&self) -> SocketAddr {
        SocketAddr::new(self.external_ip, self.external_port)
    }
}

/// Relay allocation carried by `relay-response`
///
/// Peers receive it with `targetId` (requester) or `sourceId` (target). The
/// relay node itself receives the same allocation with both ids set, as a
/// reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayResponsePayload {
    /// Node hosting the relay
    pub relay_id: NodeId,
    /// Relay host
    pub relay_host: IpAddr,
    /// Relay TCP port
    pub relay_port: u16,
    /// Opaque pairing key
    pub session_id: String,
    /// Peer the requester should name in its handshake
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<NodeId>,
    /// Peer the target should name in its handshake
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<NodeId>,
    /// Reflected address of the source peer, a pairing hint for the relay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_addr: Option<SocketAddr>,
    /// Reflected address of the target peer, a pairing hint for the relay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_addr: Option<SocketAddr>,
}

impl RelayResponsePayload {
    /// Relay address
    #[must_use]
    pub fn relay_addr(&self) -> SocketAddr {
        SocketAddr::new(self.relay_host, self.relay_port)
    }
}

/// Error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    /// Receiver has no live signaling channel
    PeerOffline,
    /// No relay candidate could be selected
    RelayUnavailable,
    /// Envelope could not be parsed or is not acceptable here
    InvalidEnvelope,
    /// Sender identity rejected
    Unauthorized,
}

/// Error report carried by `error`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    /// Machine-readable code
    pub code: ErrorCode,
    /// Human-readable detail
    pub message: String,
    /// Peer the error concerns
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<NodeId>,
}

/// Envelope body: the type tag together with its payload
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    /// Connection request
    Connect(ConnectPayload),
    /// NAT report
    Offer(NatReport),
    /// Reply to a connect
    Answer(ConnectPayload),
    /// Opaque candidate
    IceCandidate(Value),
    /// Keepalive request
    Ping,
    /// Keepalive reply
    Pong,
    /// Relay request
    RelayRequest,
    /// Relay allocation
    RelayResponse(RelayResponsePayload),
    /// Error report
    Error(ErrorPayload),
}

impl Signal {
    /// Type tag
    #[must_use]
    pub fn kind(&self) -> SignalKind {
        match self {
            Self::Connect(_) => SignalKind::Connect,
            Self::Offer(_) => SignalKind::Offer,
            Self::Answer(_) => SignalKind::Answer,
            Self::IceCandidate(_) => SignalKind::IceCandidate,
            Self::Ping => SignalKind::Ping,
            Self::Pong => SignalKind::Pong,
            Self::RelayRequest => SignalKind::RelayRequest,
            Self::RelayResponse(_) => SignalKind::RelayResponse,
            Self::Error(_) => SignalKind::Error,
        }
    }

    /// Shorthand for an error body
    #[must_use]
    pub fn error(code: ErrorCode, message: impl Into<String>, peer_id: Option<NodeId>) -> Self {
        Self::Error(ErrorPayload {
            code,
            message: message.into(),
            peer_id,
        })
    }
}

/// Envelope parse error
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// Not JSON, or a field has the wrong shape
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),
    /// The type requires a payload and none was given
    #[error("{0} envelope requires a payload")]
    MissingPayload(SignalKind),
    /// Sender id is empty
    #[error("envelope has an empty senderId")]
    EmptySender,
}

/// Signaling envelope
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "WireEnvelope")]
pub struct SignalEnvelope {
    /// Originating node
    pub sender_id: NodeId,
    /// Destination node; absent for envelopes addressed to the coordinator
    pub receiver_id: Option<NodeId>,
    /// Creation time
    pub timestamp: DateTime<Utc>,
    /// Type and payload
    pub body: Signal,
}

impl SignalEnvelope {
    /// New envelope from `sender`, stamped now
    #[must_use]
    pub fn new(sender: impl Into<NodeId>, body: Signal) -> Self {
        Self {
            sender_id: sender.into(),
            receiver_id: None,
            timestamp: Utc::now(),
            body,
        }
    }

    /// Address the envelope to `receiver`
    #[must_use]
    pub fn to(mut self, receiver: impl Into<NodeId>) -> Self {
        self.receiver_id = Some(receiver.into());
        self
    }

    /// Type tag
    #[must_use]
    pub fn kind(&self) -> SignalKind {
        self.body.kind()
    }

    /// Serialize to a JSON text frame
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a JSON text frame
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a valid envelope.
    pub fn from_json(text: &str) -> Result<Self, EnvelopeError> {
        let wire: WireEnvelope = serde_json::from_str(text)?;
        Self::try_from(wire)
    }
}

/// Wire shape, used for deserialization
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvelope {
    #[serde(rename = "type")]
    kind: SignalKind,
    sender_id: NodeId,
    #[serde(default)]
    receiver_id: Option<NodeId>,
    #[serde(default)]
    payload: Option<Value>,
    timestamp: DateTime<Utc>,
}

impl TryFrom<WireEnvelope> for SignalEnvelope {
    type Error = EnvelopeError;

    fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
        if wire.sender_id.is_empty() {
            return Err(EnvelopeError::EmptySender);
        }
        let kind = wire.kind;
        let payload = wire.payload.filter(|v| !v.is_null());
        let required = || payload.clone().ok_or(EnvelopeError::MissingPayload(kind));

        let body = match kind {
            SignalKind::Connect => Signal::Connect(serde_json::from_value(required()?)?),
            SignalKind::Offer => Signal::Offer(serde_json::from_value(required()?)?),
            SignalKind::Answer => Signal::Answer(serde_json::from_value(required()?)?),
            SignalKind::IceCandidate => Signal::IceCandidate(payload.clone().unwrap_or(Value::Null)),
            SignalKind::Ping => Signal::Ping,
            SignalKind::Pong => Signal::Pong,
            SignalKind::RelayRequest => Signal::RelayRequest,
            SignalKind::RelayResponse => {
                Signal::RelayResponse(serde_json::from_value(required()?)?)
            }
            SignalKind::Error => Signal::Error(serde_json::from_value(required()?)?),
        };

        Ok(Self {
            sender_id: wire.sender_id,
            receiver_id: wire.receiver_id,
            timestamp: wire.timestamp,
            body,
        })
    }
}

#[derive(Serialize)]
#[serde(untagged)]
enum PayloadRef<'a> {
    Connect(&'a ConnectPayload),
    Offer(&'a NatReport),
    Relay(&'a RelayResponsePayload),
    Error(&'a ErrorPayload),
    Raw(&'a Value),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireRef<'a> {
    #[serde(rename = "type")]
    kind: SignalKind,
    sender_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    receiver_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<PayloadRef<'a>>,
    timestamp: &'a DateTime<Utc>,
}

impl Serialize for SignalEnvelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let payload = match &self.body {
            Signal::Connect(p) | Signal::Answer(p) => Some(PayloadRef::Connect(p)),
            Signal::Offer(p) => Some(PayloadRef::Offer(p)),
            Signal::RelayResponse(p) => Some(PayloadRef::Relay(p)),
            Signal::Error(p) => Some(PayloadRef::Error(p)),
            Signal::IceCandidate(v) if !v.is_null() => Some(PayloadRef::Raw(v)),
            Signal::IceCandidate(_) | Signal::Ping | Signal::Pong | Signal::RelayRequest => None,
        };
        WireRef {
            kind: self.kind(),
            sender_id: &self.sender_id,
            receiver_id: self.receiver_id.as_deref(),
            payload,
            timestamp: &self.timestamp,
        }
        .serialize(serializer)
    }
}
