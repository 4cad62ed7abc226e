//! Client side of the relay handshake

use crate::error::RelayError;
use crate::handshake;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;

/// Connect to `relay` and open a leg toward `target`
///
/// On success the returned stream is a raw pipe to the target.
///
/// # Errors
///
/// Returns [`RelayError::HandshakeRejected`] with the relay's reply verbatim,
/// [`RelayError::HandshakeTimeout`] if the connect or reply exceeds
/// `timeout`, or an I/O error.
pub async fn dial(relay: SocketAddr, target: &str, timeout: Duration) -> Result<TcpStream, RelayError> {
    let mut stream = tokio::time::timeout(timeout, TcpStream::connect(relay))
        .await
        .map_err(|_| RelayError::HandshakeTimeout)??;
    stream.set_nodelay(true)?;

    tracing::debug!("Opening relay leg to {} via {}", target, relay);
    handshake::initiate(&mut stream, target, timeout).await?;
    tracing::debug!("Relay {} admitted leg to {}", relay, target);
    Ok(stream)
}
