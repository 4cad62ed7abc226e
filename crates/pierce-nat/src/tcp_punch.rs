//! TCP simultaneous open and connection racing
//!
//! A race listens on a local port and/or repeatedly dials a set of targets
//! from that same port. Whichever completes first, an inbound accept or an
//! outbound connect, wins; the other half is dropped with the race future.

use crate::socket::tcp_socket_reuse;
use crate::types::AttemptFailure;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// Listen backlog for the punch listener
const LISTEN_BACKLOG: u32 = 16;

/// Parameters of a single TCP race
#[derive(Debug, Clone)]
pub struct TcpRace {
    /// Local address both halves bind to
    pub local: SocketAddr,
    /// Addresses to dial, tried in order on every round
    pub targets: Vec<SocketAddr>,
    /// Accept inbound connections from the targets' IPs
    pub listen: bool,
    /// Dial the targets
    pub dial: bool,
    /// Delay between dial rounds, also the per-connect timeout
    pub interval: Duration,
}

/// Run a TCP race until one half yields a stream or `cancel` fires
///
/// Inbound connections from IPs not among the targets are dropped.
///
/// # Errors
///
/// Returns `AttemptFailure::Cancelled` on cancellation, `Ineligible` when the
/// race has nothing to do, and `Io` when the listener cannot be set up.
pub async fn tcp_race(race: TcpRace, cancel: CancellationToken) -> Result<TcpStream, AttemptFailure> {
    if race.targets.is_empty() || !(race.listen || race.dial) {
        return Err(AttemptFailure::Ineligible("nothing to dial or accept".into()));
    }

    let listener = if race.listen {
        let socket = tcp_socket_reuse(race.local)?;
        socket.bind(race.local)?;
        Some(socket.listen(LISTEN_BACKLOG)?)
    } else {
        None
    };
    // Dials share the listener's port once it is known
    let dial_from = match &listener {
        Some(l) => l.local_addr()?,
        None => race.local,
    };

    let accept = async {
        match &listener {
            Some(listener) => accept_from(listener, &race.targets).await,
            None => std::future::pending().await,
        }
    };
    let dial = async {
        if race.dial {
            dial_loop(dial_from, &race.targets, race.interval).await
        } else {
            std::future::pending().await
        }
    };

    tokio::select! {
        () = cancel.cancelled() => Err(AttemptFailure::Cancelled),
        result = accept => {
            let stream = result?;
            tracing::debug!("TCP race won by inbound accept from {:?}", stream.peer_addr().ok());
            Ok(stream)
        }
        stream = dial => {
            tracing::debug!("TCP race won by outbound connect to {:?}", stream.peer_addr().ok());
            Ok(stream)
        }
    }
}

async fn accept_from(listener: &TcpListener, targets: &[SocketAddr]) -> Result<TcpStream, AttemptFailure> {
    loop {
        let (stream, from) = listener.accept().await?;
        if targets.iter().any(|t| t.ip() == from.ip()) {
            return Ok(stream);
        }
        tracing::debug!("Dropping unexpected inbound TCP connection from {}", from);
    }
}

/// Dial rounds never give up on their own; the caller's deadline bounds them
async fn dial_loop(local: SocketAddr, targets: &[SocketAddr], interval: Duration) -> TcpStream {
    let mut round = 0u32;
    loop {
        round += 1;
        for target in targets {
            match dial_once(local, *target, interval).await {
                Ok(stream) => return stream,
                Err(e) => tracing::trace!("TCP dial {} to {} failed: {}", round, target, e),
            }
        }
        tokio::time::sleep(interval).await;
    }
}

async fn dial_once(local: SocketAddr, target: SocketAddr, timeout: Duration) -> std::io::Result<TcpStream> {
    let socket = tcp_socket_reuse(target)?;
    if local.port() != 0 && local.is_ipv4() == target.is_ipv4() {
        socket.bind(local)?;
    }
    match tokio::time::timeout(timeout, socket.connect(target)).await {
        Ok(result) => result,
        Err(_) => Err(std::io::ErrorKind::TimedOut.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_dialer_meets_listener() {
        let listen_race = TcpRace {
            local: "127.0.0.1:0".parse().unwrap(),
            targets: vec!["127.0.0.1:1".parse().unwrap()],
            listen: true,
            dial: false,
            interval: Duration::from_millis(50),
        };
        // Learn the port by binding first
        let probe = tcp_socket_reuse(listen_race.local).unwrap();
        probe.bind(listen_race.local).unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let accept_side = TcpRace {
            local: SocketAddr::new("127.0.0.1".parse().unwrap(), port),
            ..listen_race
        };
        let dial_side = TcpRace {
            local: "127.0.0.1:0".parse().unwrap(),
            targets: vec![SocketAddr::new("127.0.0.1".parse().unwrap(), port)],
            listen: false,
            dial: true,
            interval: Duration::from_millis(50),
        };

        let cancel = CancellationToken::new();
        let (accepted, dialed) = tokio::join!(
            tcp_race(accept_side, cancel.clone()),
            tcp_race(dial_side, cancel.clone()),
        );
        let mut accepted = accepted.unwrap();
        let mut dialed = dialed.unwrap();

        dialed.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn test_dialing_side_also_accepts() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let race = TcpRace {
            local: SocketAddr::new("127.0.0.1".parse().unwrap(), port),
            // Refused every round
            targets: vec!["127.0.0.1:9".parse().unwrap()],
            listen: true,
            dial: true,
            interval: Duration::from_millis(50),
        };
        let racing = tokio::spawn(tcp_race(race, CancellationToken::new()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut inbound = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut won = racing.await.unwrap().unwrap();
        assert_eq!(won.peer_addr().unwrap(), inbound.local_addr().unwrap());

        inbound.write_all(b"syn").await.unwrap();
        let mut buf = [0u8; 3];
        won.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"syn");
    }

    #[tokio::test]
    async fn test_race_without_work_is_ineligible() {
        let race = TcpRace {
            local: "127.0.0.1:0".parse().unwrap(),
            targets: Vec::new(),
            listen: true,
            dial: true,
            interval: Duration::from_millis(50),
        };
        assert!(matches!(
            tcp_race(race, CancellationToken::new()).await,
            Err(AttemptFailure::Ineligible(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_stops_dialing() {
        let race = TcpRace {
            local: "127.0.0.1:0".parse().unwrap(),
            targets: vec!["127.0.0.1:1".parse().unwrap()],
            listen: false,
            dial: true,
            interval: Duration::from_millis(20),
        };
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });
        assert_eq!(
            tcp_race(race, cancel).await.unwrap_err(),
            AttemptFailure::Cancelled
        );
    }
}
