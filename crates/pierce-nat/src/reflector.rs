//! Minimal STUN reflector
//!
//! Answers Binding requests with the source address it saw, using both
//! XOR-MAPPED-ADDRESS and MAPPED-ADDRESS. It has a single address, so
//! CHANGE-REQUEST is ignored and the reply always comes from the bound socket;
//! classifiers treat that as "no filtering information".

use crate::stun::{StunMessage, StunMessageClass};
use std::io;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

/// Single-address STUN Binding responder
pub struct StunReflector {
    socket: UdpSocket,
}

impl StunReflector {
    /// Bind the reflector
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self { socket })
    }

    /// Local address
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be determined.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serve until the socket fails
    ///
    /// # Errors
    ///
    /// Returns an error on a fatal socket error.
    pub async fn run(self) -> io::Result<()> {
        self.run_until(CancellationToken::new()).await
    }

    /// Serve until `cancel` fires
    ///
    /// # Errors
    ///
    /// Returns an error on a fatal socket error.
    pub async fn run_until(self, cancel: CancellationToken) -> io::Result<()> {
        tracing::info!("STUN reflector listening on {}", self.socket.local_addr()?);
        let mut buf = [0u8; 1500];
        loop {
            let (len, from) = tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                recv = self.socket.recv_from(&mut buf) => match recv {
                    Ok(r) => r,
                    Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                    Err(e) => return Err(e),
                },
            };

            let request = match StunMessage::decode(&buf[..len]) {
                Ok(msg) if msg.message_class == StunMessageClass::Request => msg,
                Ok(_) => continue,
                Err(e) => {
                    tracing::trace!("Ignoring non-STUN datagram from {}: {}", from, e);
                    continue;
                }
            };

            let reply = StunMessage::binding_response(request.transaction_id, from);
            if let Err(e) = self.socket.send_to(&reply.encode(), from).await {
                tracing::debug!("STUN reply to {} failed: {}", from, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stun::StunClient;
    use std::time::Duration;

    #[tokio::test]
    async fn test_reflects_source_address() {
        let reflector = StunReflector::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = reflector.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(reflector.run_until(cancel.clone()));

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = StunClient::new(&socket, Duration::from_secs(1));
        let mapped = client.get_mapped_address(addr).await.unwrap();
        assert_eq!(mapped, socket.local_addr().unwrap());

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_ignores_garbage() {
        let reflector = StunReflector::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = reflector.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(reflector.run_until(cancel.clone()));

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.send_to(b"not stun at all, just bytes", addr).await.unwrap();
        let client = StunClient::new(&socket, Duration::from_secs(1));
        assert!(client.get_mapped_address(addr).await.is_ok());

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
