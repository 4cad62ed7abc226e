//! UDP Hole Punching
//!
//! Simultaneous open over UDP: both peers send a fixed probe to each other's
//! reflected address from their classified port while listening for either
//! the peer's probe or an acknowledgement of their own.

use crate::conn::PunchedUdp;
use crate::types::AttemptFailure;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Probe packet marker
pub const PROBE_MARKER: &[u8] = b"PIERCE_PROBE";
/// Acknowledgement packet marker
pub const ACK_MARKER: &[u8] = b"PIERCE_ACK";

/// Punch a UDP path to `peer` using an already-bound `socket`
///
/// Probes go out every `interval`, at most `max_retries` times; after the last
/// probe the listener keeps waiting until the caller cancels. A datagram from
/// the peer's IP carrying the probe (answered with an ack) or the ack wins, and
/// the socket is connected to the exact address it came from.
///
/// # Errors
///
/// Returns `AttemptFailure::Cancelled` when `cancel` fires first and
/// `AttemptFailure::Io` on socket errors.
pub async fn udp_punch(
    socket: UdpSocket,
    peer: SocketAddr,
    interval: Duration,
    max_retries: u32,
    cancel: CancellationToken,
) -> Result<PunchedUdp, AttemptFailure> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sent = 0u32;
    let mut buf = [0u8; 512];

    let from = loop {
        tokio::select! {
            () = cancel.cancelled() => return Err(AttemptFailure::Cancelled),
            _ = ticker.tick(), if sent < max_retries => {
                sent += 1;
                tracing::trace!("UDP probe {}/{} to {}", sent, max_retries, peer);
                if let Err(e) = socket.send_to(PROBE_MARKER, peer).await {
                    // Unreachable routes surface here on some platforms; keep listening
                    tracing::debug!("UDP probe to {} failed: {}", peer, e);
                }
            }
            recv = socket.recv_from(&mut buf) => {
                let (len, from) = match recv {
                    Ok(r) => r,
                    Err(e) if is_transient_recv(&e) => continue,
                    Err(e) => return Err(e.into()),
                };
                if from.ip() != peer.ip() {
                    continue;
                }
                let datagram = &buf[..len];
                if datagram == PROBE_MARKER {
                    socket.send_to(ACK_MARKER, from).await?;
                    break from;
                }
                if datagram == ACK_MARKER {
                    break from;
                }
            }
        }
    };

    tracing::debug!("UDP punch to {} succeeded via {}", peer, from);
    socket.connect(from).await?;
    Ok(PunchedUdp::new(socket, from))
}

/// ICMP port unreachable is reported on the next recv on Linux/Windows
fn is_transient_recv(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::ConnectionReset
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::bind_udp_reuse;

    #[tokio::test]
    async fn test_simultaneous_open() {
        let a = bind_udp_reuse("127.0.0.1:0".parse().unwrap()).unwrap();
        let b = bind_udp_reuse("127.0.0.1:0".parse().unwrap()).unwrap();
        let a_addr = a.local_addr().unwrap();
        let b_addr = b.local_addr().unwrap();
        let cancel = CancellationToken::new();

        let (ra, rb) = tokio::join!(
            udp_punch(a, b_addr, Duration::from_millis(50), 10, cancel.clone()),
            udp_punch(b, a_addr, Duration::from_millis(50), 10, cancel.clone()),
        );
        let ra = ra.unwrap();
        let rb = rb.unwrap();
        assert_eq!(ra.peer_addr(), b_addr);
        assert_eq!(rb.peer_addr(), a_addr);

        ra.send(b"data").await.unwrap();
        let mut buf = [0u8; 16];
        let len = rb.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"data");
    }

    #[tokio::test]
    async fn test_ack_completes_punch() {
        let a = bind_udp_reuse("127.0.0.1:0".parse().unwrap()).unwrap();
        let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let raw_addr = raw.local_addr().unwrap();

        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (len, from) = raw.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..len], PROBE_MARKER);
            raw.send_to(ACK_MARKER, from).await.unwrap();
        });

        let punched = udp_punch(
            a,
            raw_addr,
            Duration::from_millis(50),
            5,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(punched.peer_addr(), raw_addr);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_ignores_other_hosts_and_cancels() {
        let a = bind_udp_reuse("127.0.0.1:0".parse().unwrap()).unwrap();
        let a_addr = a.local_addr().unwrap();
        // Peer on an address nothing answers from
        let peer: SocketAddr = "127.0.0.2:9".parse().unwrap();
        let cancel = CancellationToken::new();

        let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        stranger.send_to(PROBE_MARKER, a_addr).await.unwrap();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            canceller.cancel();
        });

        let err = udp_punch(a, peer, Duration::from_millis(50), 3, cancel)
            .await
            .unwrap_err();
        assert_eq!(err, AttemptFailure::Cancelled);

        // Socket released on return
        std::net::UdpSocket::bind(a_addr).unwrap();
    }
}
