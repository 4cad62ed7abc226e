//! Direct connection between reachable peers
//!
//! Exactly one side dials and the other accepts, so both ends agree on a
//! single TCP stream. The more reachable side accepts.

use crate::conn::Conn;
use crate::tcp_punch::{TcpRace, tcp_race};
use crate::types::{AttemptFailure, ConnectionAttemptResult, NatClass, Strategy};
use std::net::SocketAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Which half of a direct connection this side plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectRole {
    /// Connect out to the peer
    Dial,
    /// Accept the peer's connection on the local punch port
    Accept,
}

impl DirectRole {
    /// Pick this side's role
    ///
    /// On a shared LAN the initiator dials the peer's local address. Otherwise
    /// the side whose NAT class is easier to reach accepts; on a tie the
    /// initiator dials.
    #[must_use]
    pub fn decide(local: NatClass, peer: NatClass, initiator: bool, same_lan: bool) -> Self {
        if same_lan {
            return if initiator { Self::Dial } else { Self::Accept };
        }
        match local.reachability_rank().cmp(&peer.reachability_rank()) {
            std::cmp::Ordering::Less => Self::Accept,
            std::cmp::Ordering::Greater => Self::Dial,
            std::cmp::Ordering::Equal if initiator => Self::Dial,
            std::cmp::Ordering::Equal => Self::Accept,
        }
    }
}

/// Establish a direct TCP connection within `timeout`
///
/// `local` is the address to accept on (the punch port); `targets` are the
/// peer addresses to dial, local address first when on the same LAN.
pub async fn connect_direct(
    local: SocketAddr,
    targets: Vec<SocketAddr>,
    role: DirectRole,
    retry_interval: Duration,
    timeout: Duration,
    cancel: &CancellationToken,
) -> ConnectionAttemptResult {
    let race = TcpRace {
        local,
        targets,
        listen: role == DirectRole::Accept,
        dial: role == DirectRole::Dial,
        interval: retry_interval,
    };
    tracing::debug!("Direct connect as {:?} to {:?}", role, race.targets);

    let child = cancel.child_token();
    let outcome = tokio::time::timeout(timeout, tcp_race(race, child.clone())).await;
    child.cancel();

    match outcome {
        Ok(Ok(stream)) => ConnectionAttemptResult::success(Strategy::Direct, Conn::Tcp(stream)),
        Ok(Err(e)) => ConnectionAttemptResult::failure(Strategy::Direct, e),
        Err(_) => ConnectionAttemptResult::failure(Strategy::Direct, AttemptFailure::Timeout(timeout)),
    }
}
