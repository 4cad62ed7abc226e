//! Relay service: handshake admission, leg pairing and session lifecycle.

use crate::bandwidth::{BandwidthCaps, BandwidthLimiter};
use crate::error::RelayError;
use crate::handshake;
use crate::session::{RelaySession, SessionSnapshot};
use pierce_signal::{NodeId, PeerDirectory};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{RwLock, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Relay service configuration
#[derive(Debug, Clone)]
pub struct RelayServiceConfig {
    /// Identifier this relay advertises
    pub relay_id: NodeId,
    /// How long a first leg waits for its pair
    pub pairing_timeout: Duration,
    /// Sessions idle this long are closed
    pub idle_timeout: Duration,
    /// Period of the idle sweep
    pub sweep_interval: Duration,
    /// Deadline for the `RELAY <id>` request
    pub handshake_timeout: Duration,
    /// Node and session throughput caps
    pub caps: BandwidthCaps,
    /// Maximum concurrent paired sessions
    pub max_sessions: usize,
}

impl Default for RelayServiceConfig {
    fn default() -> Self {
        Self {
            relay_id: "relay".to_string(),
            pairing_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            caps: BandwidthCaps::default(),
            max_sessions: 1024,
        }
    }
}

/// A session the coordinator has allocated on this relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    /// Opaque session id
    pub session_id: String,
    /// Node that asked for the relay
    pub source: NodeId,
    /// Node it wants to reach
    pub target: NodeId,
    /// Address the source is expected to dial from, if known
    pub source_ip: Option<IpAddr>,
    /// Address the target is expected to dial from, if known
    pub target_ip: Option<IpAddr>,
}

impl Reservation {
    /// Reservation without address hints
    #[must_use]
    pub fn new(session_id: impl Into<String>, source: impl Into<NodeId>, target: impl Into<NodeId>) -> Self {
        Self {
            session_id: session_id.into(),
            source: source.into(),
            target: target.into(),
            source_ip: None,
            target_ip: None,
        }
    }

    /// The node that would present a handshake naming `named`
    fn counterpart(&self, named: &str) -> Option<&str> {
        if named == self.target {
            Some(&self.source)
        } else if named == self.source {
            Some(&self.target)
        } else {
            None
        }
    }

    fn expected_ip(&self, node: &str) -> Option<IpAddr> {
        if node == self.source {
            self.source_ip
        } else {
            self.target_ip
        }
    }
}

struct WaitingLeg {
    from: NodeId,
    deliver: oneshot::Sender<TcpStream>,
}

struct Pending {
    reservation: Reservation,
    created: Instant,
    waiting: Option<WaitingLeg>,
}

enum Admission {
    Wait {
        reservation: Reservation,
        from: NodeId,
        paired: oneshot::Receiver<TcpStream>,
    },
    Complete {
        session_id: String,
        deliver: oneshot::Sender<TcpStream>,
    },
    Reject(String),
}

/// Session-forwarding relay
pub struct RelayService {
    config: RelayServiceConfig,
    directory: Option<Arc<dyn PeerDirectory>>,
    reservations: RwLock<HashMap<String, Pending>>,
    sessions: RwLock<HashMap<String, Arc<RelaySession>>>,
    limiter: BandwidthLimiter,
    failed_pairings: AtomicU64,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl RelayService {
    /// Start a relay service and its idle sweep
    ///
    /// With a `directory`, handshakes naming an online peer that has no
    /// reservation get a distinct rejection.
    pub fn start(config: RelayServiceConfig, directory: Option<Arc<dyn PeerDirectory>>) -> Arc<Self> {
        let service = Arc::new(Self {
            limiter: BandwidthLimiter::new(config.caps),
            config,
            directory,
            reservations: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            failed_pairings: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        });
        service.spawn_sweep_task();
        service
    }

    /// Configuration
    #[must_use]
    pub fn config(&self) -> &RelayServiceConfig {
        &self.config
    }

    /// Bind `addr` and accept relay legs until shutdown
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the listener cannot be bound.
    pub async fn listen(self: &Arc<Self>, addr: SocketAddr) -> Result<SocketAddr, RelayError> {
        if self.cancel.is_cancelled() {
            return Err(RelayError::ShuttingDown);
        }
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        tracing::info!(relay = %self.config.relay_id, "Relay listening on {}", local);

        let service = Arc::clone(self);
        self.tracker.spawn(service.accept_loop(listener));
        Ok(local)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        let service = Arc::clone(&self);
                        self.tracker.spawn(service.handle_connection(stream, peer));
                    }
                    Err(e) => {
                        tracing::warn!("Relay accept failed: {}", e);
                    }
                },
            }
        }
        tracing::debug!(relay = %self.config.relay_id, "Relay accept loop stopped");
    }

    /// Register a session allocated by the coordinator
    ///
    /// Re-reserving an existing session id replaces it unless a leg is
    /// already waiting on it.
    pub async fn reserve(&self, reservation: Reservation) {
        let mut reservations = self.reservations.write().await;
        if reservations
            .get(&reservation.session_id)
            .is_some_and(|pending| pending.waiting.is_some())
        {
            return;
        }
        tracing::debug!(
            session = %reservation.session_id,
            "Reserved relay session {} -> {}",
            reservation.source,
            reservation.target
        );
        reservations.insert(
            reservation.session_id.clone(),
            Pending {
                reservation,
                created: Instant::now(),
                waiting: None,
            },
        );
    }

    /// Drop a reservation; a waiting leg is closed
    pub async fn cancel_reservation(&self, session_id: &str) -> bool {
        self.reservations.write().await.remove(session_id).is_some()
    }

    async fn handle_connection(self: Arc<Self>, mut stream: TcpStream, peer: SocketAddr) {
        let target = match handshake::read_request(&mut stream, self.config.handshake_timeout).await {
            Ok(target) => target,
            Err(RelayError::MalformedHandshake(reason)) => {
                tracing::debug!("Malformed relay handshake from {}: {}", peer, reason);
                let _ = handshake::reject(&mut stream, "Malformed handshake").await;
                return;
            }
            Err(e) => {
                tracing::debug!("Relay handshake from {} failed: {}", peer, e);
                return;
            }
        };

        match self.admit(&target, peer.ip()).await {
            Admission::Reject(reason) => {
                tracing::debug!("Rejected relay leg from {} for {}: {}", peer, target, reason);
                let _ = handshake::reject(&mut stream, &reason).await;
            }
            Admission::Complete { session_id, deliver } => {
                if let Err(e) = stream.write_all(handshake::OK).await {
                    tracing::debug!(session = %session_id, "Second relay leg lost: {}", e);
                    return;
                }
                if deliver.send(stream).is_err() {
                    self.failed_pairings.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(session = %session_id, "First relay leg vanished before pairing");
                }
            }
            Admission::Wait {
                reservation,
                from,
                paired,
            } => {
                self.wait_for_pair(stream, reservation, from, paired).await;
            }
        }
    }

    async fn admit(&self, target: &str, peer_ip: IpAddr) -> Admission {
        if self.sessions.read().await.len() >= self.config.max_sessions {
            return Admission::Reject(format!(
                "Relay at capacity ({} sessions)",
                self.config.max_sessions
            ));
        }

        let mut reservations = self.reservations.write().await;

        // Prefer a reservation expecting this source address, then the oldest
        let chosen = reservations
            .iter()
            .filter_map(|(id, pending)| {
                let from = pending.reservation.counterpart(target)?;
                if pending.waiting.as_ref().is_some_and(|w| w.from == from) {
                    return None;
                }
                let ip_match = pending.reservation.expected_ip(from) == Some(peer_ip);
                Some((id.clone(), ip_match, pending.created))
            })
            .min_by(|(_, ip_a, created_a), (_, ip_b, created_b)| {
                ip_b.cmp(ip_a).then(created_a.cmp(created_b))
            })
            .map(|(id, _, _)| id);

        let Some(session_id) = chosen else {
            drop(reservations);
            return Admission::Reject(self.no_reservation_reason(target));
        };

        let waiting = reservations
            .get_mut(&session_id)
            .and_then(|pending| pending.waiting.take());
        if let Some(waiting) = waiting {
            reservations.remove(&session_id);
            return Admission::Complete {
                session_id,
                deliver: waiting.deliver,
            };
        }

        let Some(pending) = reservations.get_mut(&session_id) else {
            return Admission::Reject(self.no_reservation_reason(target));
        };
        let from = pending
            .reservation
            .counterpart(target)
            .unwrap_or_default()
            .to_string();
        let (deliver, paired) = oneshot::channel();
        pending.waiting = Some(WaitingLeg {
            from: from.clone(),
            deliver,
        });
        Admission::Wait {
            reservation: pending.reservation.clone(),
            from,
            paired,
        }
    }

    fn no_reservation_reason(&self, target: &str) -> String {
        let online = self
            .directory
            .as_ref()
            .is_some_and(|directory| directory.lookup(target).is_some());
        if online {
            format!("No relay session reserved for {target}")
        } else {
            handshake::TARGET_OFFLINE.to_string()
        }
    }

    async fn wait_for_pair(
        &self,
        mut stream: TcpStream,
        reservation: Reservation,
        from: NodeId,
        mut paired: oneshot::Receiver<TcpStream>,
    ) {
        let session_id = reservation.session_id.clone();
        if let Err(e) = stream.write_all(handshake::OK).await {
            tracing::debug!(session = %session_id, "First relay leg lost: {}", e);
            self.clear_waiting(&session_id, &from).await;
            return;
        }

        let waited = tokio::select! {
            result = &mut paired => Some(result),
            () = tokio::time::sleep(self.config.pairing_timeout) => None,
            () = self.cancel.cancelled() => None,
        };

        let other = match waited {
            Some(Ok(other)) => other,
            Some(Err(_)) => {
                self.failed_pairings.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(session = %session_id, "Relay reservation withdrawn before pairing");
                return;
            }
            None if self.clear_waiting(&session_id, &from).await => {
                self.failed_pairings.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    session = %session_id,
                    "Relay leg from {} never paired with {}",
                    from,
                    reservation.counterpart(&from).unwrap_or_default()
                );
                return;
            }
            // The second leg claimed the reservation concurrently
            None => match paired.await {
                Ok(other) => other,
                Err(_) => {
                    self.failed_pairings.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            },
        };

        let (stream_a, stream_b) = if from == reservation.source {
            (stream, other)
        } else {
            (other, stream)
        };
        self.run_session(reservation, stream_a, stream_b).await;
    }

    /// Remove a reservation whose waiting leg is `from`
    async fn clear_waiting(&self, session_id: &str, from: &str) -> bool {
        let mut reservations = self.reservations.write().await;
        let ours = reservations
            .get(session_id)
            .and_then(|pending| pending.waiting.as_ref())
            .is_some_and(|w| w.from == from);
        if ours {
            reservations.remove(session_id);
        }
        ours
    }

    async fn run_session(&self, reservation: Reservation, stream_a: TcpStream, stream_b: TcpStream) {
        let session = Arc::new(RelaySession::new(
            reservation.session_id.clone(),
            reservation.source,
            reservation.target,
            self.cancel.child_token(),
        ));
        {
            let (a, b) = session.nodes();
            tracing::info!(session = %session.id(), "Relay session paired: {} <-> {}", a, b);
        }
        self.sessions
            .write()
            .await
            .insert(session.id().to_string(), Arc::clone(&session));

        session.run(stream_a, stream_b, &self.limiter).await;

        self.sessions.write().await.remove(session.id());
        let snapshot = session.snapshot();
        tracing::info!(
            session = %snapshot.id,
            a_to_b = snapshot.bytes_a_to_b,
            b_to_a = snapshot.bytes_b_to_a,
            "Relay session closed"
        );
    }

    /// Close idle sessions and expired reservations; returns sessions closed
    pub async fn sweep(&self) -> usize {
        let idle: Vec<Arc<RelaySession>> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|session| session.idle() >= self.config.idle_timeout)
            .cloned()
            .collect();
        for session in &idle {
            tracing::info!(session = %session.id(), "Closing idle relay session");
            session.close();
        }

        let pairing_timeout = self.config.pairing_timeout;
        self.reservations.write().await.retain(|id, pending| {
            let keep = pending.waiting.is_some() || pending.created.elapsed() < pairing_timeout;
            if !keep {
                tracing::debug!(session = %id, "Expired unused relay reservation");
            }
            keep
        });

        idle.len()
    }

    fn spawn_sweep_task(self: &Arc<Self>) {
        let service = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let period = self.config.sweep_interval;
        self.tracker.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(service) = service.upgrade() else { break };
                        service.sweep().await;
                    }
                }
            }
        });
    }

    /// Snapshots of every paired session
    pub async fn sessions(&self) -> Vec<SessionSnapshot> {
        self.sessions
            .read()
            .await
            .values()
            .map(|session| session.snapshot())
            .collect()
    }

    /// Number of paired sessions
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Number of reservations not yet paired
    pub async fn pending_count(&self) -> usize {
        self.reservations.read().await.len()
    }

    /// Close one session by id
    pub async fn close_session(&self, session_id: &str) -> bool {
        match self.sessions.read().await.get(session_id) {
            Some(session) => {
                session.close();
                true
            }
            None => false,
        }
    }

    /// (total bytes, bytes per second) for a node with live sessions
    #[must_use]
    pub fn node_usage(&self, node: &str) -> Option<(u64, u64)> {
        self.limiter.node_usage(node)
    }

    /// Legs that were admitted but never paired
    #[must_use]
    pub fn failed_pairings(&self) -> u64 {
        self.failed_pairings.load(Ordering::Relaxed)
    }

    /// Stop accepting, close every session and wait for all tasks
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        self.reservations.write().await.clear();
        tracing::info!(relay = %self.config.relay_id, "Relay service stopped");
    }
}

impl Drop for RelayService {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
