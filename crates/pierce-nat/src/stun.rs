//! STUN Binding codec and client (RFC 5389 subset)
//!
//! Only the pieces needed for NAT classification are implemented: the 20-byte
//! header, MAPPED-ADDRESS, XOR-MAPPED-ADDRESS, the RFC 3489 CHANGE-REQUEST
//! request attribute and SOFTWARE. Unknown attributes are carried through
//! untouched.
//!
//! Decoding is strict. A short header, a wrong magic cookie, a declared length
//! that runs past the datagram or an attribute that does not fit its own
//! length are all rejected; nothing is guessed from a malformed reply.

use rand::RngCore;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::Instant;

/// STUN magic cookie (0x2112A442)
pub const MAGIC_COOKIE: u32 = 0x2112_A442;

/// STUN message header size (20 bytes)
pub const HEADER_SIZE: usize = 20;

/// Transaction id length (96 bits)
pub const TRANSACTION_ID_SIZE: usize = 12;

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_CHANGE_REQUEST: u16 = 0x0003;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const ATTR_SOFTWARE: u16 = 0x8022;

const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

/// CHANGE-REQUEST flag: answer from the alternate IP
pub const CHANGE_IP: u32 = 0x04;
/// CHANGE-REQUEST flag: answer from the alternate port
pub const CHANGE_PORT: u32 = 0x02;

/// Largest datagram we accept from a reflector
const MAX_RESPONSE_SIZE: usize = 1500;

/// STUN message class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StunMessageClass {
    /// Request message
    Request,
    /// Success response
    SuccessResponse,
    /// Error response
    ErrorResponse,
    /// Indication (no response expected)
    Indication,
}

impl StunMessageClass {
    fn bits(self) -> u16 {
        match self {
            Self::Request => 0b00,
            Self::Indication => 0b01,
            Self::SuccessResponse => 0b10,
            Self::ErrorResponse => 0b11,
        }
    }

    fn from_bits(bits: u16) -> Self {
        match bits & 0b11 {
            0b00 => Self::Request,
            0b01 => Self::Indication,
            0b10 => Self::SuccessResponse,
            _ => Self::ErrorResponse,
        }
    }
}

/// Binding method (0x001), the only method spoken here
const METHOD_BINDING: u16 = 0x0001;

/// Interleave method and class bits into the 14-bit message type
///
/// ```text
///  0                 1
///  2  3  4 5 6 7 8 9 0 1 2 3 4 5
/// +--+--+-+-+-+-+-+-+-+-+-+-+-+-+
/// |M |M |M|M|M|C|M|M|M|C|M|M|M|M|
/// |11|10|9|8|7|1|6|5|4|0|3|2|1|0|
/// +--+--+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
fn encode_type(method: u16, class: StunMessageClass) -> u16 {
    let class_bits = class.bits();
    (method & 0x000F)
        | ((class_bits & 0x01) << 4)
        | ((method & 0x0070) << 1)
        | ((class_bits & 0x02) << 7)
        | ((method & 0x0F80) << 2)
}

fn decode_type(msg_type: u16) -> Result<(u16, StunMessageClass), StunError> {
    // The two most significant bits must be zero for STUN
    if msg_type & 0xC000 != 0 {
        return Err(StunError::InvalidMessageType);
    }
    let class_bits = ((msg_type >> 4) & 0x01) | ((msg_type >> 7) & 0x02);
    let method = (msg_type & 0x000F) | ((msg_type >> 1) & 0x0070) | ((msg_type >> 2) & 0x0F80);
    Ok((method, StunMessageClass::from_bits(class_bits)))
}

/// STUN attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StunAttribute {
    /// MAPPED-ADDRESS (0x0001), plain encoding
    MappedAddress(SocketAddr),
    /// XOR-MAPPED-ADDRESS (0x0020), preferred over MAPPED-ADDRESS
    XorMappedAddress(SocketAddr),
    /// CHANGE-REQUEST (0x0003) flags
    ChangeRequest(u32),
    /// SOFTWARE (0x8022)
    Software(String),
    /// Anything else, kept verbatim
    Unknown(u16, Vec<u8>),
}

impl StunAttribute {
    fn attr_type(&self) -> u16 {
        match self {
            Self::MappedAddress(_) => ATTR_MAPPED_ADDRESS,
            Self::ChangeRequest(_) => ATTR_CHANGE_REQUEST,
            Self::XorMappedAddress(_) => ATTR_XOR_MAPPED_ADDRESS,
            Self::Software(_) => ATTR_SOFTWARE,
            Self::Unknown(t, _) => *t,
        }
    }

    fn encode(&self, transaction_id: &[u8; TRANSACTION_ID_SIZE], out: &mut Vec<u8>) {
        let value = self.encode_value(transaction_id);
        out.extend_from_slice(&self.attr_type().to_be_bytes());
        out.extend_from_slice(&(value.len() as u16).to_be_bytes());
        out.extend_from_slice(&value);
        // Pad to a 4-byte boundary
        let padding = (4 - value.len() % 4) % 4;
        out.extend(std::iter::repeat_n(0, padding));
    }

    fn encode_value(&self, transaction_id: &[u8; TRANSACTION_ID_SIZE]) -> Vec<u8> {
        match self {
            Self::MappedAddress(addr) => encode_address(*addr, None),
            Self::XorMappedAddress(addr) => encode_address(*addr, Some(transaction_id)),
            Self::ChangeRequest(flags) => flags.to_be_bytes().to_vec(),
            Self::Software(s) => s.as_bytes().to_vec(),
            Self::Unknown(_, data) => data.clone(),
        }
    }

    fn decode(
        attr_type: u16,
        value: &[u8],
        transaction_id: &[u8; TRANSACTION_ID_SIZE],
    ) -> Result<Self, StunError> {
        match attr_type {
            ATTR_MAPPED_ADDRESS => decode_address(value, None).map(Self::MappedAddress),
            ATTR_XOR_MAPPED_ADDRESS => {
                decode_address(value, Some(transaction_id)).map(Self::XorMappedAddress)
            }
            ATTR_CHANGE_REQUEST => {
                let bytes: [u8; 4] = value.try_into().map_err(|_| StunError::InvalidAttribute)?;
                Ok(Self::ChangeRequest(u32::from_be_bytes(bytes)))
            }
            ATTR_SOFTWARE => Ok(Self::Software(String::from_utf8_lossy(value).into_owned())),
            _ => Ok(Self::Unknown(attr_type, value.to_vec())),
        }
    }
}

/// XOR key for an address family: the magic cookie, followed by the
/// transaction id for IPv6.
fn xor_key(transaction_id: &[u8; TRANSACTION_ID_SIZE]) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    key[4..].copy_from_slice(transaction_id);
    key
}

fn encode_address(addr: SocketAddr, xor: Option<&[u8; TRANSACTION_ID_SIZE]>) -> Vec<u8> {
    let mut value = Vec::with_capacity(20);
    value.push(0);
    value.push(if addr.is_ipv4() { FAMILY_IPV4 } else { FAMILY_IPV6 });

    let port = match xor {
        Some(_) => addr.port() ^ (MAGIC_COOKIE >> 16) as u16,
        None => addr.port(),
    };
    value.extend_from_slice(&port.to_be_bytes());

    let octets: Vec<u8> = match addr.ip() {
        IpAddr::V4(ip) => ip.octets().to_vec(),
        IpAddr::V6(ip) => ip.octets().to_vec(),
    };
    match xor {
        Some(tid) => {
            let key = xor_key(tid);
            value.extend(octets.iter().zip(key.iter()).map(|(b, k)| b ^ k));
        }
        None => value.extend_from_slice(&octets),
    }
    value
}

fn decode_address(
    value: &[u8],
    xor: Option<&[u8; TRANSACTION_ID_SIZE]>,
) -> Result<SocketAddr, StunError> {
    if value.len() < 4 {
        return Err(StunError::InvalidAttribute);
    }
    let family = value[1];
    let raw_port = u16::from_be_bytes([value[2], value[3]]);
    let port = match xor {
        Some(_) => raw_port ^ (MAGIC_COOKIE >> 16) as u16,
        None => raw_port,
    };
    let key = xor.map(xor_key);
    let unmask = |i: usize, b: u8| key.map_or(b, |k| b ^ k[i]);

    let ip = match family {
        FAMILY_IPV4 => {
            let raw: [u8; 4] = value
                .get(4..8)
                .and_then(|s| s.try_into().ok())
                .ok_or(StunError::InvalidAttribute)?;
            let mut octets = [0u8; 4];
            for (i, b) in raw.iter().enumerate() {
                octets[i] = unmask(i, *b);
            }
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        FAMILY_IPV6 => {
            let raw: [u8; 16] = value
                .get(4..20)
                .and_then(|s| s.try_into().ok())
                .ok_or(StunError::InvalidAttribute)?;
            let mut octets = [0u8; 16];
            for (i, b) in raw.iter().enumerate() {
                octets[i] = unmask(i, *b);
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return Err(StunError::InvalidAttribute),
    };
    Ok(SocketAddr::new(ip, port))
}

/// STUN message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunMessage {
    /// Message class (the method is always Binding)
    pub message_class: StunMessageClass,
    /// Transaction ID (96 bits)
    pub transaction_id: [u8; TRANSACTION_ID_SIZE],
    /// Message attributes
    pub attributes: Vec<StunAttribute>,
}

impl StunMessage {
    /// Create a new Binding Request with a random transaction id
    #[must_use]
    pub fn binding_request() -> Self {
        let mut transaction_id = [0u8; TRANSACTION_ID_SIZE];
        rand::thread_rng().fill_bytes(&mut transaction_id);
        Self {
            message_class: StunMessageClass::Request,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    /// Create a Binding Success Response reporting `mapped`
    ///
    /// Both XOR-MAPPED-ADDRESS and the legacy MAPPED-ADDRESS are included.
    #[must_use]
    pub fn binding_response(transaction_id: [u8; TRANSACTION_ID_SIZE], mapped: SocketAddr) -> Self {
        Self {
            message_class: StunMessageClass::SuccessResponse,
            transaction_id,
            attributes: vec![
                StunAttribute::XorMappedAddress(mapped),
                StunAttribute::MappedAddress(mapped),
            ],
        }
    }

    /// Add an attribute to the message
    pub fn add_attribute(&mut self, attr: StunAttribute) {
        self.attributes.push(attr);
    }

    /// Encode message to bytes
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE + 32);
        bytes.extend_from_slice(&encode_type(METHOD_BINDING, self.message_class).to_be_bytes());
        // Length placeholder, patched below
        bytes.extend_from_slice(&[0u8; 2]);
        bytes.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        bytes.extend_from_slice(&self.transaction_id);

        for attr in &self.attributes {
            attr.encode(&self.transaction_id, &mut bytes);
        }

        let msg_length = (bytes.len() - HEADER_SIZE) as u16;
        bytes[2..4].copy_from_slice(&msg_length.to_be_bytes());
        bytes
    }

    /// Decode message from bytes
    ///
    /// # Errors
    ///
    /// Returns `StunError` if the header is short, the magic cookie is wrong,
    /// the method is not Binding, the declared length overruns the buffer, or
    /// any attribute is truncated or malformed.
    pub fn decode(bytes: &[u8]) -> Result<Self, StunError> {
        if bytes.len() < HEADER_SIZE {
            return Err(StunError::MessageTooShort);
        }

        let msg_type = u16::from_be_bytes([bytes[0], bytes[1]]);
        let msg_length = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        let magic_cookie = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);

        if magic_cookie != MAGIC_COOKIE {
            return Err(StunError::InvalidMagicCookie);
        }
        if msg_length % 4 != 0 || HEADER_SIZE + msg_length > bytes.len() {
            return Err(StunError::TruncatedAttribute);
        }

        let (method, message_class) = decode_type(msg_type)?;
        if method != METHOD_BINDING {
            return Err(StunError::InvalidMessageType);
        }

        let mut transaction_id = [0u8; TRANSACTION_ID_SIZE];
        transaction_id.copy_from_slice(&bytes[8..HEADER_SIZE]);

        let body = &bytes[HEADER_SIZE..HEADER_SIZE + msg_length];
        let mut attributes = Vec::new();
        let mut offset = 0;

        while offset < body.len() {
            if offset + 4 > body.len() {
                return Err(StunError::TruncatedAttribute);
            }
            let attr_type = u16::from_be_bytes([body[offset], body[offset + 1]]);
            let attr_length = u16::from_be_bytes([body[offset + 2], body[offset + 3]]) as usize;
            offset += 4;

            if offset + attr_length > body.len() {
                return Err(StunError::TruncatedAttribute);
            }
            let value = &body[offset..offset + attr_length];
            attributes.push(StunAttribute::decode(attr_type, value, &transaction_id)?);

            offset += attr_length + (4 - attr_length % 4) % 4;
        }

        Ok(Self {
            message_class,
            transaction_id,
            attributes,
        })
    }

    /// XOR-MAPPED-ADDRESS, if present
    #[must_use]
    pub fn xor_mapped_address(&self) -> Option<SocketAddr> {
        self.attributes.iter().find_map(|attr| match attr {
            StunAttribute::XorMappedAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    /// Plain MAPPED-ADDRESS, if present
    #[must_use]
    pub fn mapped_address(&self) -> Option<SocketAddr> {
        self.attributes.iter().find_map(|attr| match attr {
            StunAttribute::MappedAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    /// Reflexive address: XOR-MAPPED-ADDRESS, falling back to MAPPED-ADDRESS
    #[must_use]
    pub fn reflexive_address(&self) -> Option<SocketAddr> {
        self.xor_mapped_address().or_else(|| self.mapped_address())
    }

    /// CHANGE-REQUEST flags, zero when absent
    #[must_use]
    pub fn change_request(&self) -> u32 {
        self.attributes
            .iter()
            .find_map(|attr| match attr {
                StunAttribute::ChangeRequest(flags) => Some(*flags),
                _ => None,
            })
            .unwrap_or(0)
    }
}

/// Check a decoded reply against the request that produced it and pull out
/// the reflexive address.
///
/// # Errors
///
/// Fails on a transaction id mismatch, a non-success class or a missing
/// address attribute.
pub fn parse_binding_response(
    bytes: &[u8],
    transaction_id: &[u8; TRANSACTION_ID_SIZE],
) -> Result<SocketAddr, StunError> {
    let response = StunMessage::decode(bytes)?;
    if &response.transaction_id != transaction_id {
        return Err(StunError::TransactionMismatch);
    }
    if response.message_class != StunMessageClass::SuccessResponse {
        return Err(StunError::ErrorResponse);
    }
    response
        .reflexive_address()
        .ok_or(StunError::MissingAttribute)
}

/// A successful Binding exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingReply {
    /// Address the reflector saw the request come from
    pub mapped: SocketAddr,
    /// Address the reply was received from
    pub responder: SocketAddr,
}

/// STUN client bound to a borrowed socket
///
/// The socket is borrowed so that classification can run on the same local
/// port later used for hole punching.
pub struct StunClient<'a> {
    socket: &'a UdpSocket,
    timeout: Duration,
}

impl<'a> StunClient<'a> {
    /// Wrap a socket with the given per-query timeout
    #[must_use]
    pub fn new(socket: &'a UdpSocket, timeout: Duration) -> Self {
        Self { socket, timeout }
    }

    /// Get the mapped address from a reflector
    ///
    /// # Errors
    ///
    /// See [`StunClient::binding`].
    pub async fn get_mapped_address(&self, server: SocketAddr) -> Result<SocketAddr, StunError> {
        Ok(self.binding(server, 0).await?.mapped)
    }

    /// Run one Binding exchange, optionally carrying CHANGE-REQUEST flags
    ///
    /// Datagrams that do not decode, or that carry another transaction id,
    /// are discarded while the deadline lasts. If the deadline passes after
    /// only malformed replies were seen, the last decoding error is returned
    /// instead of `Timeout`.
    ///
    /// # Errors
    ///
    /// Returns `StunError` on I/O failure, timeout, or malformed replies.
    pub async fn binding(&self, server: SocketAddr, change: u32) -> Result<BindingReply, StunError> {
        let mut request = StunMessage::binding_request();
        if change != 0 {
            request.add_attribute(StunAttribute::ChangeRequest(change));
        }
        self.socket.send_to(&request.encode(), server).await?;

        let deadline = Instant::now() + self.timeout;
        let mut buf = [0u8; MAX_RESPONSE_SIZE];
        let mut last_error = StunError::Timeout;

        loop {
            let recv = tokio::time::timeout_at(deadline, self.socket.recv_from(&mut buf)).await;
            let (len, from) = match recv {
                Ok(result) => result?,
                Err(_) => return Err(last_error),
            };

            match parse_binding_response(&buf[..len], &request.transaction_id) {
                Ok(mapped) => {
                    return Ok(BindingReply {
                        mapped,
                        responder: from,
                    });
                }
                Err(e) => {
                    tracing::trace!("Discarding STUN reply from {}: {}", from, e);
                    last_error = e;
                }
            }
        }
    }
}

/// STUN error types
#[derive(Debug, Error)]
pub enum StunError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Query timeout
    #[error("STUN query timeout")]
    Timeout,
    /// Header shorter than 20 bytes
    #[error("STUN message too short")]
    MessageTooShort,
    /// Invalid magic cookie
    #[error("Invalid STUN magic cookie")]
    InvalidMagicCookie,
    /// Not a Binding message, or reserved type bits set
    #[error("Invalid STUN message type")]
    InvalidMessageType,
    /// Declared length runs past the buffer
    #[error("Truncated STUN attribute")]
    TruncatedAttribute,
    /// Attribute value is malformed
    #[error("Invalid STUN attribute")]
    InvalidAttribute,
    /// Transaction ID mismatch
    #[error("Transaction ID mismatch")]
    TransactionMismatch,
    /// Error response received
    #[error("STUN error response")]
    ErrorResponse,
    /// Missing required attribute
    #[error("Missing required STUN attribute")]
    MissingAttribute,
}

impl StunError {
    /// Whether the reply was received but could not be trusted
    #[must_use]
    pub fn is_malformed(&self) -> bool {
        !matches!(self, Self::Io(_) | Self::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_bytes(tid: [u8; 12], attrs: Vec<StunAttribute>) -> Vec<u8> {
        StunMessage {
            message_class: StunMessageClass::SuccessResponse,
            transaction_id: tid,
            attributes: attrs,
        }
        .encode()
    }

    #[test]
    fn test_message_type_encoding() {
        assert_eq!(encode_type(METHOD_BINDING, StunMessageClass::Request), 0x0001);
        assert_eq!(
            encode_type(METHOD_BINDING, StunMessageClass::SuccessResponse),
            0x0101
        );
        assert_eq!(
            encode_type(METHOD_BINDING, StunMessageClass::ErrorResponse),
            0x0111
        );
        assert_eq!(
            decode_type(0x0101).unwrap(),
            (METHOD_BINDING, StunMessageClass::SuccessResponse)
        );
    }

    #[test]
    fn test_binding_request_header() {
        let msg = StunMessage::binding_request();
        let bytes = msg.encode();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(&bytes[0..2], &[0x00, 0x01]);
        assert_eq!(&bytes[2..4], &[0x00, 0x00]);
        assert_eq!(&bytes[4..8], &[0x21, 0x12, 0xA4, 0x42]);
        assert_eq!(&bytes[8..20], &msg.transaction_id);
    }

    #[test]
    fn test_xor_mapped_address_by_hand() {
        // 203.0.113.5:54321 under the magic cookie
        let tid = [7u8; 12];
        let port = 54321u16 ^ 0x2112;
        let ip = [203 ^ 0x21, 0 ^ 0x12, 113 ^ 0xA4, 5 ^ 0x42];
        let mut value = vec![0x00, 0x01];
        value.extend_from_slice(&port.to_be_bytes());
        value.extend_from_slice(&ip);

        let mut bytes = vec![0x01, 0x01, 0x00, 0x0C, 0x21, 0x12, 0xA4, 0x42];
        bytes.extend_from_slice(&tid);
        bytes.extend_from_slice(&[0x00, 0x20, 0x00, 0x08]);
        bytes.extend_from_slice(&value);

        let mapped = parse_binding_response(&bytes, &tid).unwrap();
        assert_eq!(mapped, "203.0.113.5:54321".parse().unwrap());
    }

    #[test]
    fn test_xor_mapped_ipv6() {
        let tid = [0xA5u8; 12];
        let addr: SocketAddr = "[2001:db8::1]:4000".parse().unwrap();
        let bytes = response_bytes(tid, vec![StunAttribute::XorMappedAddress(addr)]);
        assert_eq!(parse_binding_response(&bytes, &tid).unwrap(), addr);
    }

    #[test]
    fn test_mapped_address_fallback() {
        let tid = [1u8; 12];
        let addr: SocketAddr = "198.51.100.7:3478".parse().unwrap();
        let bytes = response_bytes(tid, vec![StunAttribute::MappedAddress(addr)]);
        assert_eq!(parse_binding_response(&bytes, &tid).unwrap(), addr);
    }

    #[test]
    fn test_xor_preferred_over_plain() {
        let tid = [2u8; 12];
        let xor: SocketAddr = "198.51.100.7:1000".parse().unwrap();
        let plain: SocketAddr = "10.0.0.1:1000".parse().unwrap();
        let bytes = response_bytes(
            tid,
            vec![
                StunAttribute::MappedAddress(plain),
                StunAttribute::XorMappedAddress(xor),
            ],
        );
        assert_eq!(parse_binding_response(&bytes, &tid).unwrap(), xor);
    }

    #[test]
    fn test_decode_too_short() {
        assert!(matches!(
            StunMessage::decode(&[0u8; 10]),
            Err(StunError::MessageTooShort)
        ));
    }

    #[test]
    fn test_decode_invalid_magic_cookie() {
        let mut bytes = StunMessage::binding_request().encode();
        bytes[4] = 0xFF;
        assert!(matches!(
            StunMessage::decode(&bytes),
            Err(StunError::InvalidMagicCookie)
        ));
    }

    #[test]
    fn test_decode_truncated_attribute() {
        let tid = [3u8; 12];
        let addr: SocketAddr = "192.0.2.1:32853".parse().unwrap();
        let mut bytes = response_bytes(tid, vec![StunAttribute::XorMappedAddress(addr)]);
        bytes.truncate(bytes.len() - 3);
        assert!(matches!(
            StunMessage::decode(&bytes),
            Err(StunError::TruncatedAttribute)
        ));

        // Header claims more than the attribute header declares
        let mut bytes = response_bytes(tid, vec![StunAttribute::XorMappedAddress(addr)]);
        bytes[22..24].copy_from_slice(&40u16.to_be_bytes());
        assert!(matches!(
            StunMessage::decode(&bytes),
            Err(StunError::TruncatedAttribute)
        ));
    }

    #[test]
    fn test_transaction_mismatch() {
        let addr: SocketAddr = "192.0.2.1:32853".parse().unwrap();
        let bytes = response_bytes([4u8; 12], vec![StunAttribute::XorMappedAddress(addr)]);
        assert!(matches!(
            parse_binding_response(&bytes, &[5u8; 12]),
            Err(StunError::TransactionMismatch)
        ));
    }

    #[test]
    fn test_missing_attribute_and_error_class() {
        let tid = [6u8; 12];
        let bytes = response_bytes(tid, vec![StunAttribute::Software("x".into())]);
        assert!(matches!(
            parse_binding_response(&bytes, &tid),
            Err(StunError::MissingAttribute)
        ));

        let err = StunMessage {
            message_class: StunMessageClass::ErrorResponse,
            transaction_id: tid,
            attributes: Vec::new(),
        };
        assert!(matches!(
            parse_binding_response(&err.encode(), &tid),
            Err(StunError::ErrorResponse)
        ));
    }

    #[test]
    fn test_change_request_roundtrip() {
        let mut msg = StunMessage::binding_request();
        msg.add_attribute(StunAttribute::ChangeRequest(CHANGE_IP | CHANGE_PORT));
        let decoded = StunMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.change_request(), 0x06);
        assert_eq!(decoded.message_class, StunMessageClass::Request);
    }

    #[test]
    fn test_software_padding() {
        let mut msg = StunMessage::binding_request();
        msg.add_attribute(StunAttribute::Software("pierce".into()));
        let bytes = msg.encode();
        assert_eq!((bytes.len() - HEADER_SIZE) % 4, 0);
        let decoded = StunMessage::decode(&bytes).unwrap();
        assert_eq!(
            decoded.attributes,
            vec![StunAttribute::Software("pierce".into())]
        );
    }

    #[test]
    fn test_stun_error_classification() {
        assert!(StunError::InvalidMagicCookie.is_malformed());
        assert!(StunError::TransactionMismatch.is_malformed());
        assert!(!StunError::Timeout.is_malformed());
        assert_eq!(StunError::Timeout.to_string(), "STUN query timeout");
    }

    #[tokio::test]
    async fn test_binding_skips_foreign_transaction() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let client_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            let request = StunMessage::decode(&buf[..len]).unwrap();
            // A stray reply first, then the real one
            let stray = StunMessage::binding_response([9u8; 12], "1.2.3.4:5".parse().unwrap());
            server.send_to(&stray.encode(), from).await.unwrap();
            let real = StunMessage::binding_response(request.transaction_id, from);
            server.send_to(&real.encode(), from).await.unwrap();
        });

        let client = StunClient::new(&client_socket, Duration::from_secs(2));
        let reply = client.binding(server_addr, 0).await.unwrap();
        assert_eq!(reply.mapped, client_socket.local_addr().unwrap());
        assert_eq!(reply.responder, server_addr);
    }

    #[tokio::test]
    async fn test_binding_reports_malformed_on_deadline() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let client_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (_, from) = server.recv_from(&mut buf).await.unwrap();
            server.send_to(&[0xFFu8; 24], from).await.unwrap();
        });

        let client = StunClient::new(&client_socket, Duration::from_millis(300));
        let err = client.binding(server_addr, 0).await.unwrap_err();
        assert!(matches!(err, StunError::InvalidMagicCookie));
    }
}
