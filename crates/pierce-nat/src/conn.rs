//! Established peer connections
//!
//! [`Conn`] is the handle every strategy hands back to the caller. Both
//! variants implement `AsyncRead`/`AsyncWrite`, so a consumer can treat the
//! connection as a plain byte stream (e.g. `tokio::io::copy_bidirectional`).
//! The UDP variant preserves datagram boundaries and offers no delivery
//! guarantees beyond what UDP gives.

use crate::udp_punch::{ACK_MARKER, PROBE_MARKER};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UdpSocket};

/// Largest payload written per datagram
pub const MAX_DATAGRAM_PAYLOAD: usize = 1200;

/// A UDP socket promoted to a connected session after a successful punch
///
/// Late probe and acknowledgement packets from the punch phase are swallowed
/// by the receive path; a late probe is still acknowledged so the peer's side
/// of the punch converges.
#[derive(Debug)]
pub struct PunchedUdp {
    socket: UdpSocket,
    peer: SocketAddr,
}

fn is_control(datagram: &[u8]) -> bool {
    datagram == PROBE_MARKER || datagram == ACK_MARKER
}

impl PunchedUdp {
    pub(crate) fn new(socket: UdpSocket, peer: SocketAddr) -> Self {
        Self { socket, peer }
    }

    /// Remote address of the punched path
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Local address of the socket
    ///
    /// # Errors
    ///
    /// Returns an error if the local address cannot be determined.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Send one datagram to the peer
    ///
    /// # Errors
    ///
    /// Returns an error if the send fails.
    pub async fn send(&self, data: &[u8]) -> io::Result<usize> {
        self.socket.send(data).await
    }

    /// Receive one application datagram, skipping punch control packets
    ///
    /// # Errors
    ///
    /// Returns an error if the receive fails.
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let len = self.socket.recv(buf).await?;
            if buf[..len] == *PROBE_MARKER {
                let _ = self.socket.try_send(ACK_MARKER);
                continue;
            }
            if buf[..len] == *ACK_MARKER {
                continue;
            }
            return Ok(len);
        }
    }

    /// Give up the wrapper and return the connected socket
    #[must_use]
    pub fn into_inner(self) -> UdpSocket {
        self.socket
    }
}

impl AsyncRead for PunchedUdp {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let start = buf.filled().len();
            ready!(self.socket.poll_recv(cx, buf))?;
            let datagram = &buf.filled()[start..];
            if !is_control(datagram) {
                return Poll::Ready(Ok(()));
            }
            if datagram == PROBE_MARKER {
                let _ = self.socket.try_send(ACK_MARKER);
            }
            buf.set_filled(start);
        }
    }
}

impl AsyncWrite for PunchedUdp {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let len = buf.len().min(MAX_DATAGRAM_PAYLOAD);
        self.socket.poll_send(cx, &buf[..len])
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Established connection to a peer, direct, punched or relayed
#[derive(Debug)]
pub enum Conn {
    /// TCP stream (direct, TCP punch, or relay leg)
    Tcp(TcpStream),
    /// Connected UDP session from a UDP punch
    Udp(PunchedUdp),
}

impl Conn {
    /// Remote address of the underlying socket
    ///
    /// For relayed connections this is the relay, not the peer.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be determined.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Self::Tcp(stream) => stream.peer_addr(),
            Self::Udp(udp) => Ok(udp.peer_addr()),
        }
    }

    /// Local address of the underlying socket
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be determined.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Self::Tcp(stream) => stream.local_addr(),
            Self::Udp(udp) => udp.local_addr(),
        }
    }

    /// Transport name, for logs
    #[must_use]
    pub fn transport(&self) -> &'static str {
        match self {
            Self::Tcp(_) => "tcp",
            Self::Udp(_) => "udp",
        }
    }
}

impl AsyncRead for Conn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Udp(udp) => Pin::new(udp).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Conn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Udp(udp) => Pin::new(udp).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            Self::Udp(udp) => Pin::new(udp).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Udp(udp) => Pin::new(udp).poll_shutdown(cx),
        }
    }
}
