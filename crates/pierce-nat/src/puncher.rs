//! Hole punch racing
//!
//! Runs the eligible punch paths (UDP always, TCP when both NAT classes make it
//! plausible) as tasks feeding one result queue. The first path to succeed
//! cancels the rest, and every task is joined before `punch` returns so no
//! socket outlives the attempt.
//!
//! Punches from a fixed local port take turns: unconnected `SO_REUSEPORT`
//! sockets on one port share inbound datagrams, so two concurrent punches
//! could each swallow the other peer's punch packets.

use crate::conn::Conn;
use crate::socket::{bind_udp_reuse, unspecified_for};
use crate::tcp_punch::{TcpRace, tcp_race};
use crate::types::{AttemptFailure, ConnectionAttemptResult, NatClass, Strategy};
use crate::udp_punch::udp_punch;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Hole punching configuration
#[derive(Debug, Clone)]
pub struct PunchConfig {
    /// Local port shared with classification (0 = ephemeral)
    pub local_port: u16,
    /// Delay between probes / dial rounds
    pub retry_interval: Duration,
    /// Maximum UDP probes sent
    pub max_retries: u32,
    /// Shared deadline for all paths
    pub timeout: Duration,
    /// Whether the TCP path may run at all
    pub enable_tcp: bool,
}

impl Default for PunchConfig {
    fn default() -> Self {
        Self {
            local_port: 0,
            retry_interval: Duration::from_secs(1),
            max_retries: 10,
            timeout: Duration::from_secs(10),
            enable_tcp: true,
        }
    }
}

/// Which side of the punch this peer plays
///
/// Both sides dial and accept on the TCP path, since a simultaneous open only
/// works once each NAT has seen its own outbound SYN. Both dial from the port
/// they listen on, so every attempt shares one 4-tuple and lands on a single
/// stream whichever half completes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PunchRole {
    /// Side that requested the connection
    Initiator,
    /// Side that was asked to connect
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PunchPath {
    Udp,
    Tcp,
}

impl fmt::Display for PunchPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Udp => write!(f, "udp"),
            Self::Tcp => write!(f, "tcp"),
        }
    }
}

/// UDP/TCP hole puncher
#[derive(Debug, Clone)]
pub struct HolePuncher {
    config: PunchConfig,
    port_lock: Arc<Mutex<()>>,
}

impl HolePuncher {
    /// Create a hole puncher
    #[must_use]
    pub fn new(config: PunchConfig) -> Self {
        Self {
            config,
            port_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Exclusive use of the configured port; ephemeral ports never collide
    async fn claim_port(&self) -> Option<OwnedMutexGuard<()>> {
        if self.config.local_port == 0 {
            return None;
        }
        Some(Arc::clone(&self.port_lock).lock_owned().await)
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &PunchConfig {
        &self.config
    }

    /// Whether TCP simultaneous open is worth trying for this pair
    #[must_use]
    pub fn tcp_eligible(&self, local_nat: NatClass, peer_nat: NatClass) -> bool {
        self.config.enable_tcp && local_nat.tcp_punch_plausible() && peer_nat.tcp_punch_plausible()
    }

    /// Punch a path to `peer_addr` using the configured timeout and retries
    pub async fn punch(
        &self,
        local_nat: NatClass,
        peer_addr: SocketAddr,
        peer_nat: NatClass,
        role: PunchRole,
        cancel: &CancellationToken,
    ) -> ConnectionAttemptResult {
        self.punch_with(
            local_nat,
            peer_addr,
            peer_nat,
            role,
            self.config.timeout,
            self.config.max_retries,
            cancel,
        )
        .await
    }

    /// Punch a path to `peer_addr`, racing every eligible path
    ///
    /// Never fails loudly: a timeout, cancellation or socket error comes back
    /// as a failed [`ConnectionAttemptResult`] for the caller to fall through.
    #[allow(clippy::too_many_arguments)]
    pub async fn punch_with(
        &self,
        local_nat: NatClass,
        peer_addr: SocketAddr,
        peer_nat: NatClass,
        role: PunchRole,
        timeout: Duration,
        max_retries: u32,
        cancel: &CancellationToken,
    ) -> ConnectionAttemptResult {
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        // Waiting for the port counts against the deadline
        let _port = tokio::select! {
            port = self.claim_port() => port,
            () = &mut deadline => {
                return ConnectionAttemptResult::failure(Strategy::HolePunch, AttemptFailure::Timeout(timeout));
            }
            () = cancel.cancelled() => {
                return ConnectionAttemptResult::failure(Strategy::HolePunch, AttemptFailure::Cancelled);
            }
        };

        let local = unspecified_for(peer_addr, self.config.local_port);
        let race_cancel = cancel.child_token();
        let mut paths: JoinSet<(PunchPath, Result<Conn, AttemptFailure>)> = JoinSet::new();

        match bind_udp_reuse(local) {
            Ok(socket) => {
                let token = race_cancel.clone();
                let interval = self.config.retry_interval;
                paths.spawn(async move {
                    let result = udp_punch(socket, peer_addr, interval, max_retries, token)
                        .await
                        .map(Conn::Udp);
                    (PunchPath::Udp, result)
                });
            }
            Err(e) => tracing::warn!("Cannot bind UDP punch socket on {}: {}", local, e),
        }

        if self.tcp_eligible(local_nat, peer_nat) {
            let race = TcpRace {
                local,
                targets: vec![peer_addr],
                listen: true,
                dial: true,
                interval: self.config.retry_interval,
            };
            let token = race_cancel.clone();
            paths.spawn(async move {
                let result = tcp_race(race, token).await.map(Conn::Tcp);
                (PunchPath::Tcp, result)
            });
        } else {
            tracing::debug!(
                "Skipping TCP punch ({} local, {} peer)",
                local_nat,
                peer_nat
            );
        }

        if paths.is_empty() {
            return ConnectionAttemptResult::failure(
                Strategy::HolePunch,
                AttemptFailure::Io(format!("no punch path could be set up on {local}")),
            );
        }

        tracing::debug!(
            "Punching {} ({}) as {:?} with {} path(s), timeout {:?}",
            peer_addr,
            peer_nat,
            role,
            paths.len(),
            timeout
        );

        let mut last_failure = None;

        let result = loop {
            tokio::select! {
                () = &mut deadline => {
                    break ConnectionAttemptResult::failure(
                        Strategy::HolePunch,
                        AttemptFailure::Timeout(timeout),
                    );
                }
                () = cancel.cancelled() => {
                    break ConnectionAttemptResult::failure(
                        Strategy::HolePunch,
                        AttemptFailure::Cancelled,
                    );
                }
                joined = paths.join_next() => match joined {
                    Some(Ok((path, Ok(conn)))) => {
                        tracing::info!("Hole punch to {} succeeded over {}", peer_addr, path);
                        break ConnectionAttemptResult::success(Strategy::HolePunch, conn);
                    }
                    Some(Ok((path, Err(e)))) => {
                        tracing::debug!("Punch path {} to {} failed: {}", path, peer_addr, e);
                        last_failure = Some(e);
                    }
                    Some(Err(e)) => {
                        tracing::warn!("Punch task failed: {}", e);
                        last_failure = Some(AttemptFailure::Io(e.to_string()));
                    }
                    None => {
                        break ConnectionAttemptResult::failure(
                            Strategy::HolePunch,
                            last_failure.take().unwrap_or(AttemptFailure::Timeout(timeout)),
                        );
                    }
                }
            }
        };

        // Tear the losers down before handing the result back
        race_cancel.cancel();
        paths.shutdown().await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config(local_port: u16) -> PunchConfig {
        PunchConfig {
            local_port,
            retry_interval: Duration::from_millis(50),
            max_retries: 10,
            timeout: Duration::from_secs(3),
            enable_tcp: false,
        }
    }

    fn free_udp_port() -> u16 {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.local_addr().unwrap().port()
    }

    #[test]
    fn test_tcp_eligibility() {
        let puncher = HolePuncher::new(PunchConfig::default());
        assert!(puncher.tcp_eligible(NatClass::FullCone, NatClass::RestrictedCone));
        assert!(!puncher.tcp_eligible(NatClass::FullCone, NatClass::Symmetric));
        assert!(!puncher.tcp_eligible(NatClass::Symmetric, NatClass::FullCone));
        assert!(!puncher.tcp_eligible(NatClass::PortRestrictedCone, NatClass::FullCone));

        let disabled = HolePuncher::new(PunchConfig {
            enable_tcp: false,
            ..PunchConfig::default()
        });
        assert!(!disabled.tcp_eligible(NatClass::FullCone, NatClass::FullCone));
    }

    #[tokio::test]
    async fn test_punch_between_two_local_peers() {
        let port_a = free_udp_port();
        let port_b = free_udp_port();
        let a = HolePuncher::new(fast_config(port_a));
        let b = HolePuncher::new(fast_config(port_b));
        let cancel = CancellationToken::new();
        let addr_a: SocketAddr = format!("127.0.0.1:{port_a}").parse().unwrap();
        let addr_b: SocketAddr = format!("127.0.0.1:{port_b}").parse().unwrap();

        let (ra, rb) = tokio::join!(
            a.punch(
                NatClass::PortRestrictedCone,
                addr_b,
                NatClass::PortRestrictedCone,
                PunchRole::Initiator,
                &cancel
            ),
            b.punch(
                NatClass::PortRestrictedCone,
                addr_a,
                NatClass::PortRestrictedCone,
                PunchRole::Responder,
                &cancel
            ),
        );
        assert!(ra.is_success(), "{:?}", ra.error);
        assert!(rb.is_success(), "{:?}", rb.error);
        assert_eq!(ra.strategy, Strategy::HolePunch);
        assert_eq!(ra.conn.as_ref().unwrap().transport(), "udp");
    }

    #[tokio::test]
    async fn test_initiator_accepts_inbound_tcp() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let puncher = HolePuncher::new(PunchConfig {
            enable_tcp: true,
            ..fast_config(port)
        });
        // The initiator's own dials go nowhere; only its listener can win
        let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let dialer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap()
        });

        let result = puncher
            .punch(
                NatClass::RestrictedCone,
                peer,
                NatClass::FullCone,
                PunchRole::Initiator,
                &CancellationToken::new(),
            )
            .await;
        assert!(result.is_success(), "{:?}", result.error);
        let conn = result.conn.unwrap();
        assert_eq!(conn.transport(), "tcp");
        let dialed = dialer.await.unwrap();
        assert_eq!(conn.peer_addr().unwrap(), dialed.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_punches_share_the_port() {
        async fn acknowledge(socket: tokio::net::UdpSocket) {
            let mut buf = [0u8; 64];
            loop {
                let (len, from) = socket.recv_from(&mut buf).await.unwrap();
                if &buf[..len] == crate::udp_punch::PROBE_MARKER {
                    socket.send_to(crate::udp_punch::ACK_MARKER, from).await.unwrap();
                    return;
                }
            }
        }

        let port = free_udp_port();
        let puncher = HolePuncher::new(fast_config(port));
        let peer_b = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_c = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (addr_b, addr_c) = (peer_b.local_addr().unwrap(), peer_c.local_addr().unwrap());
        let answered = tokio::spawn(async move { tokio::join!(acknowledge(peer_b), acknowledge(peer_c)) });

        let cancel = CancellationToken::new();
        let (rb, rc) = tokio::join!(
            puncher.punch(
                NatClass::RestrictedCone,
                addr_b,
                NatClass::RestrictedCone,
                PunchRole::Initiator,
                &cancel
            ),
            puncher.punch(
                NatClass::RestrictedCone,
                addr_c,
                NatClass::RestrictedCone,
                PunchRole::Initiator,
                &cancel
            ),
        );
        assert!(rb.is_success(), "{:?}", rb.error);
        assert!(rc.is_success(), "{:?}", rc.error);
        assert_eq!(rb.conn.unwrap().peer_addr().unwrap(), addr_b);
        assert_eq!(rc.conn.unwrap().peer_addr().unwrap(), addr_c);
        answered.await.unwrap();
    }

    #[tokio::test]
    async fn test_punch_timeout_is_structured() {
        let port = free_udp_port();
        let puncher = HolePuncher::new(PunchConfig {
            timeout: Duration::from_millis(200),
            ..fast_config(port)
        });
        let result = puncher
            .punch(
                NatClass::RestrictedCone,
                "127.0.0.1:9".parse().unwrap(),
                NatClass::RestrictedCone,
                PunchRole::Initiator,
                &CancellationToken::new(),
            )
            .await;
        assert!(!result.is_success());
        assert_eq!(
            result.error,
            Some(AttemptFailure::Timeout(Duration::from_millis(200)))
        );
    }

    #[tokio::test]
    async fn test_cancelled_punch_releases_port() {
        let port = free_udp_port();
        let puncher = HolePuncher::new(fast_config(port));
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let result = puncher
            .punch(
                NatClass::FullCone,
                "127.0.0.1:9".parse().unwrap(),
                NatClass::FullCone,
                PunchRole::Responder,
                &cancel,
            )
            .await;
        assert_eq!(result.error, Some(AttemptFailure::Cancelled));

        // A plain bind without SO_REUSEPORT fails while any punch socket lives
        std::net::UdpSocket::bind(("0.0.0.0", port)).unwrap();
    }
}
