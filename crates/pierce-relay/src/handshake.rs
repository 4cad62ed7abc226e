//! Relay handshake wire format
//!
//! A relay leg opens with the client writing `RELAY <target-node-id>` as the
//! whole of its first write. The relay answers `OK` on admission, or
//! `ERROR: <reason>` and closes. After `OK` the stream is an opaque pipe.

use crate::error::RelayError;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Request prefix
pub const REQUEST_PREFIX: &str = "RELAY ";

/// Admission reply
pub const OK: &[u8] = b"OK";

/// Rejection reply prefix
pub const ERROR_PREFIX: &str = "ERROR: ";

/// Reply when the named target is unknown or offline
pub const TARGET_OFFLINE: &str = "Target node not found or offline";

/// Upper bound on a handshake payload
pub const MAX_HANDSHAKE: usize = 512;

/// Encode a request for `target`
#[must_use]
pub fn request(target: &str) -> Vec<u8> {
    format!("{REQUEST_PREFIX}{target}").into_bytes()
}

/// Parse a request payload into the target node id
///
/// # Errors
///
/// Returns [`RelayError::MalformedHandshake`] if the payload is not UTF-8,
/// lacks the prefix, or names an empty or whitespace-bearing id.
pub fn parse_request(payload: &[u8]) -> Result<String, RelayError> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| RelayError::MalformedHandshake("not UTF-8".into()))?;
    let text = text.trim_end_matches(['\r', '\n']);
    let target = text
        .strip_prefix(REQUEST_PREFIX)
        .ok_or_else(|| RelayError::MalformedHandshake(format!("unexpected payload {text:?}")))?;
    if target.is_empty() || target.chars().any(char::is_whitespace) {
        return Err(RelayError::MalformedHandshake(format!(
            "invalid target {target:?}"
        )));
    }
    Ok(target.to_owned())
}

/// Read the request with a single read, bounded by `timeout`
///
/// # Errors
///
/// Returns [`RelayError::HandshakeTimeout`] on timeout, I/O errors, or a
/// parse error.
pub async fn read_request<S>(stream: &mut S, timeout: Duration) -> Result<String, RelayError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; MAX_HANDSHAKE];
    let n = tokio::time::timeout(timeout, stream.read(&mut buf))
        .await
        .map_err(|_| RelayError::HandshakeTimeout)??;
    if n == 0 {
        return Err(RelayError::MalformedHandshake("connection closed".into()));
    }
    parse_request(&buf[..n])
}

/// Write `ERROR: <reason>` and flush
///
/// # Errors
///
/// Returns an I/O error if the write fails.
pub async fn reject<S>(stream: &mut S, reason: &str) -> Result<(), RelayError>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(format!("{ERROR_PREFIX}{reason}").as_bytes())
        .await?;
    stream.shutdown().await?;
    Ok(())
}

/// Client side: send the request and wait for the reply
///
/// Reads exactly two bytes on success so that no relayed payload is consumed.
///
/// # Errors
///
/// Returns [`RelayError::HandshakeRejected`] with the relay's text verbatim,
/// [`RelayError::HandshakeTimeout`], or an I/O error.
pub async fn initiate<S>(stream: &mut S, target: &str, timeout: Duration) -> Result<(), RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(timeout, exchange(stream, target))
        .await
        .map_err(|_| RelayError::HandshakeTimeout)?
}

async fn exchange<S>(stream: &mut S, target: &str) -> Result<(), RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&request(target)).await?;
    stream.flush().await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if &reply[..] == OK {
        return Ok(());
    }

    let mut rest = Vec::new();
    (&mut *stream)
        .take(MAX_HANDSHAKE as u64)
        .read_to_end(&mut rest)
        .await?;
    let mut text = reply.to_vec();
    text.extend_from_slice(&rest);
    Err(RelayError::HandshakeRejected(
        String::from_utf8_lossy(&text).into_owned(),
    ))
}
