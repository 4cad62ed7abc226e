//! Coordinator: envelope routing, strategy selection and relay allocation

use crate::error::CoordinatorError;
use crate::registry::{PeerHandle, Registry};
use crate::strategy::determine_strategy;
use pierce_nat::Strategy;
use pierce_relay::{
    RelayNode, RelaySelector, RelayService, Reservation, SelectorConfig, new_session_id,
};
use pierce_signal::{
    ConnectPayload, ErrorCode, NatReport, NodeId, RelayResponsePayload, Signal, SignalEnvelope,
};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Coordinator configuration
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Sender id on envelopes the coordinator originates
    pub node_id: NodeId,
    /// Peers silent this long are evicted
    pub inactivity_timeout: Duration,
    /// Period of the inactivity sweep
    pub sweep_interval: Duration,
    /// Outbound envelope queue per peer
    pub peer_queue: usize,
    /// Deadline for the WebSocket upgrade
    pub handshake_timeout: Duration,
    /// Relay scoring
    pub selector: SelectorConfig,
    /// Pick relays uniformly instead of by score
    pub random_relay_selection: bool,
    /// How long an allocation is reused for the same pair
    pub allocation_ttl: Duration,
    /// Bandwidth advertised for a co-located relay
    pub colocated_bandwidth_mbps: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            node_id: "coordinator".to_string(),
            inactivity_timeout: Duration::from_secs(90),
            sweep_interval: Duration::from_secs(30),
            peer_queue: 256,
            handshake_timeout: Duration::from_secs(10),
            selector: SelectorConfig::default(),
            random_relay_selection: false,
            allocation_ttl: Duration::from_secs(30),
            colocated_bandwidth_mbps: 1000,
        }
    }
}

/// Relay service running in the coordinator process
#[derive(Clone)]
pub struct ColocatedRelay {
    /// The service
    pub service: Arc<RelayService>,
    /// Address peers should dial
    pub advertised: SocketAddr,
}

struct Allocation {
    requester: NodeId,
    target: NodeId,
    payload: RelayResponsePayload,
    created: Instant,
}

impl Allocation {
    /// The payload as seen by `node`
    fn view_for(&self, node: &str) -> RelayResponsePayload {
        if node == self.requester {
            RelayResponsePayload {
                target_id: Some(self.target.clone()),
                ..self.payload.clone()
            }
        } else {
            RelayResponsePayload {
                source_id: Some(self.requester.clone()),
                ..self.payload.clone()
            }
        }
    }
}

fn pair_key(a: &str, b: &str) -> (NodeId, NodeId) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// Rendezvous coordinator
pub struct Coordinator {
    config: CoordinatorConfig,
    registry: Arc<Registry>,
    selector: RwLock<RelaySelector>,
    allocations: Mutex<HashMap<(NodeId, NodeId), Allocation>>,
    relay: RwLock<Option<ColocatedRelay>>,
    next_conn: AtomicU64,
    pub(crate) cancel: CancellationToken,
    pub(crate) tracker: TaskTracker,
}

impl Coordinator {
    /// Start a coordinator and its inactivity sweep
    pub fn start(config: CoordinatorConfig) -> Arc<Self> {
        let coordinator = Arc::new(Self {
            selector: RwLock::new(RelaySelector::new(config.selector.clone())),
            config,
            registry: Arc::new(Registry::new()),
            allocations: Mutex::new(HashMap::new()),
            relay: RwLock::new(None),
            next_conn: AtomicU64::new(1),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        });
        coordinator.spawn_sweep_task();
        coordinator
    }

    /// Configuration
    #[must_use]
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// The peer registry, usable as a `PeerDirectory`
    #[must_use]
    pub fn directory(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    /// Add a co-located relay to the candidate pool
    pub async fn attach_relay(&self, relay: ColocatedRelay) {
        let load = relay.service.session_count().await;
        let node = RelayNode::new(relay.service.config().relay_id.clone(), relay.advertised)
            .with_health(
                u32::try_from(load).unwrap_or(u32::MAX),
                self.colocated_latency(),
                self.config.colocated_bandwidth_mbps,
            );
        tracing::info!(
            "Co-located relay {} advertised at {}",
            node.node_id,
            relay.advertised
        );
        self.write_selector().upsert(node);
        *self.relay.write().unwrap_or_else(PoisonError::into_inner) = Some(relay);
    }

    /// Peers reach the co-located relay about as fast as they reach us
    fn colocated_latency(&self) -> Duration {
        self.registry.median_rtt().unwrap_or(Duration::ZERO)
    }

    fn colocated(&self) -> Option<ColocatedRelay> {
        self.relay
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn write_selector(&self) -> std::sync::RwLockWriteGuard<'_, RelaySelector> {
        self.selector.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_selector(&self) -> std::sync::RwLockReadGuard<'_, RelaySelector> {
        self.selector.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a connection id
    pub fn next_conn_id(&self) -> u64 {
        self.next_conn.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a live signaling connection
    pub fn register_peer(
        &self,
        node_id: &str,
        conn_id: u64,
        outbound: mpsc::Sender<SignalEnvelope>,
    ) -> PeerHandle {
        self.registry.register(node_id, conn_id, outbound)
    }

    /// Remove a peer whose connection ended
    pub fn unregister_peer(&self, node_id: &str, conn_id: u64) {
        if self.registry.unregister(node_id, conn_id).is_none() {
            return;
        }
        self.write_selector().remove(node_id);
        self.allocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(a, b), _| a != node_id && b != node_id);
    }

    /// Strategy two online peers should attempt
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::PeerOffline`] for an unknown peer.
    pub fn determine_strategy(&self, a: &str, b: &str) -> Result<Strategy, CoordinatorError> {
        let a = self
            .registry
            .get(a)
            .ok_or_else(|| CoordinatorError::PeerOffline(a.to_string()))?;
        let b = self
            .registry
            .get(b)
            .ok_or_else(|| CoordinatorError::PeerOffline(b.to_string()))?;
        Ok(determine_strategy(&a, &b))
    }

    /// Pick a relay for two peers, never one of the two
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::RelayUnavailable`] when the pool has no
    /// other candidate.
    pub fn select_relay_node(&self, exclude_a: &str, exclude_b: &str) -> Result<RelayNode, CoordinatorError> {
        let selector = self.read_selector();
        let picked = if self.config.random_relay_selection {
            selector.select_random(exclude_a, exclude_b)
        } else {
            selector.select_best(exclude_a, exclude_b)
        };
        picked.map_err(CoordinatorError::RelayUnavailable)
    }

    /// Number of relay candidates
    #[must_use]
    pub fn relay_pool_size(&self) -> usize {
        self.read_selector().len()
    }

    /// Record for an online peer
    #[must_use]
    pub fn peer_info(&self, node_id: &str) -> Option<pierce_signal::PeerRecord> {
        self.registry.get(node_id)
    }

    /// Handle one envelope from the connection bound to `sender`
    pub async fn handle_envelope(&self, sender: &str, envelope: SignalEnvelope) {
        self.registry.touch(sender);
        let receiver = envelope.receiver_id.clone();

        match (&envelope.body, receiver) {
            (Signal::Ping, _) => {
                self.reply(sender, Signal::Pong);
            }
            (Signal::Pong, _) => {
                self.on_pong(sender);
            }
            (Signal::Offer(report), None) => {
                self.on_report(sender, report);
            }
            (Signal::Connect(payload), Some(target)) => {
                let payload = payload.clone();
                self.on_connect(sender, &target, payload);
            }
            (Signal::RelayRequest, Some(target)) => {
                self.on_relay_request(sender, &target).await;
            }
            (
                Signal::Offer(_) | Signal::Answer(_) | Signal::IceCandidate(_) | Signal::Error(_),
                Some(target),
            ) => {
                self.forward(sender, &target, envelope.clone());
            }
            (Signal::RelayResponse(_), _) => {
                self.reply_error(
                    sender,
                    ErrorCode::InvalidEnvelope,
                    "relay-response is issued by the coordinator only",
                    None,
                );
            }
            (Signal::Error(payload), None) => {
                tracing::debug!("Peer {} reported error: {}", sender, payload.message);
            }
            (body, None) => {
                self.reply_error(
                    sender,
                    ErrorCode::InvalidEnvelope,
                    format!("{} envelope requires a receiverId", body.kind()),
                    None,
                );
            }
        }
    }

    fn reply(&self, to: &str, body: Signal) {
        let envelope = SignalEnvelope::new(self.config.node_id.clone(), body).to(to);
        if let Err(e) = self.registry.send_to(to, envelope) {
            tracing::debug!("Reply to {} dropped: {}", to, e);
        }
    }

    fn reply_error(&self, to: &str, code: ErrorCode, message: impl Into<String>, peer: Option<&str>) {
        self.reply(to, Signal::error(code, message, peer.map(str::to_string)));
    }

    fn forward(&self, sender: &str, target: &str, envelope: SignalEnvelope) {
        let kind = envelope.kind();
        match self.registry.send_to(target, envelope) {
            Ok(()) => tracing::trace!("Routed {} from {} to {}", kind, sender, target),
            Err(CoordinatorError::PeerOffline(_)) => self.reply_error(
                sender,
                ErrorCode::PeerOffline,
                format!("peer {target} is offline"),
                Some(target),
            ),
            Err(e) => tracing::warn!("Routing {} from {} to {} failed: {}", kind, sender, target, e),
        }
    }

    fn on_report(&self, sender: &str, report: &NatReport) {
        let Some(entry) = self.registry.apply_report(sender, report) else {
            return;
        };
        tracing::debug!(
            "Peer {} reports {} at {}",
            sender,
            report.nat_type,
            report.external_addr()
        );

        let relay_port = report
            .relay_port
            .filter(|_| entry.record.nat_class.is_relay_capable());
        let mut selector = self.write_selector();
        match relay_port {
            Some(port) => {
                let mut node = RelayNode::new(sender, SocketAddr::new(report.external_ip, port));
                if let Some(health) = report.health {
                    // Our own measurement beats the node's
                    let latency = self
                        .registry
                        .rtt(sender)
                        .unwrap_or(Duration::from_millis(u64::from(health.latency_ms)));
                    node = node.with_health(health.load, latency, health.bandwidth_mbps);
                }
                if selector.get(sender).is_none() {
                    tracing::info!("Peer {} joined the relay pool at {}", sender, node.addr);
                }
                selector.upsert(node);
            }
            None => {
                if selector.remove(sender).is_some() {
                    tracing::info!("Peer {} left the relay pool", sender);
                }
            }
        }
    }

    fn on_pong(&self, sender: &str) {
        let Some(rtt) = self.registry.pong_received(sender, tokio::time::Instant::now()) else {
            return;
        };
        tracing::trace!("Round trip to {} now {:?}", sender, rtt);
        self.write_selector().update_latency(sender, rtt);
    }

    /// Ping every peer; the pongs feed round-trip estimates
    fn ping_peers(&self) {
        let now = tokio::time::Instant::now();
        for node_id in self.registry.node_ids() {
            let ping = SignalEnvelope::new(self.config.node_id.clone(), Signal::Ping).to(node_id.clone());
            match self.registry.send_to(&node_id, ping) {
                Ok(()) => self.registry.ping_sent(&node_id, now),
                Err(e) => tracing::debug!("Ping to {} dropped: {}", node_id, e),
            }
        }
    }

    fn on_connect(&self, sender: &str, target: &str, payload: ConnectPayload) {
        let Some(target_record) = self.registry.get(target) else {
            self.reply_error(
                sender,
                ErrorCode::PeerOffline,
                format!("peer {target} is offline"),
                Some(target),
            );
            return;
        };
        let Some(initiator) = self.registry.update_addresses(
            sender,
            payload.nat_type,
            payload.external_addr(),
            payload.local_addr,
        ) else {
            return;
        };

        let strategy = determine_strategy(&initiator, &target_record);
        tracing::info!("Connect {} -> {}: {}", sender, target, strategy);

        let forwarded = SignalEnvelope::new(
            sender,
            Signal::Connect(ConnectPayload {
                connection_type: Some(strategy),
                source_id: Some(sender.to_string()),
                ..payload
            }),
        )
        .to(target);
        if let Err(e) = self.registry.send_to(target, forwarded) {
            tracing::warn!("Forwarding connect to {} failed: {}", target, e);
            self.reply_error(sender, ErrorCode::PeerOffline, e.to_string(), Some(target));
            return;
        }

        let external = target_record
            .external_addr
            .unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
        let answer = SignalEnvelope::new(
            target,
            Signal::Answer(ConnectPayload {
                nat_type: target_record.nat_class,
                external_ip: external.ip(),
                external_port: external.port(),
                local_addr: target_record.local_addr,
                connection_type: Some(strategy),
                source_id: Some(target.to_string()),
            }),
        )
        .to(sender);
        if let Err(e) = self.registry.send_to(sender, answer) {
            tracing::debug!("Answer to {} dropped: {}", sender, e);
        }
    }

    async fn on_relay_request(&self, sender: &str, target: &str) {
        if sender == target {
            self.reply_error(sender, ErrorCode::InvalidEnvelope, "cannot relay to self", None);
            return;
        }
        let Some(target_record) = self.registry.get(target) else {
            self.reply_error(
                sender,
                ErrorCode::PeerOffline,
                format!("peer {target} is offline"),
                Some(target),
            );
            return;
        };

        // Both sides tend to ask at once after a failed punch
        let key = pair_key(sender, target);
        let existing = {
            let allocations = self.allocations.lock().unwrap_or_else(PoisonError::into_inner);
            allocations
                .get(&key)
                .filter(|a| a.created.elapsed() < self.config.allocation_ttl)
                .map(|a| a.view_for(sender))
        };
        if let Some(payload) = existing {
            tracing::debug!("Reusing relay session {} for {} <-> {}", payload.session_id, sender, target);
            self.reply(sender, Signal::RelayResponse(payload));
            return;
        }

        let relay = match self.select_relay_node(sender, target) {
            Ok(relay) => relay,
            Err(e) => {
                tracing::warn!("No relay for {} -> {}: {}", sender, target, e);
                self.reply_error(sender, ErrorCode::RelayUnavailable, e.to_string(), Some(target));
                return;
            }
        };

        let source_addr = self.registry.get(sender).and_then(|r| r.external_addr);
        let payload = RelayResponsePayload {
            relay_id: relay.node_id.clone(),
            relay_host: relay.addr.ip(),
            relay_port: relay.addr.port(),
            session_id: new_session_id(),
            target_id: None,
            source_id: None,
            source_addr,
            target_addr: target_record.external_addr,
        };

        let colocated = self
            .colocated()
            .filter(|hosted| hosted.service.config().relay_id == relay.node_id);
        if let Some(colocated) = colocated {
            colocated
                .service
                .reserve(Reservation {
                    source_ip: source_addr.map(|a| a.ip()),
                    target_ip: target_record.external_addr.map(|a| a.ip()),
                    ..Reservation::new(payload.session_id.clone(), sender, target)
                })
                .await;
        } else {
            let reservation = RelayResponsePayload {
                source_id: Some(sender.to_string()),
                target_id: Some(target.to_string()),
                ..payload.clone()
            };
            if let Err(e) = self.registry.send_to(
                &relay.node_id,
                SignalEnvelope::new(self.config.node_id.clone(), Signal::RelayResponse(reservation))
                    .to(relay.node_id.clone()),
            ) {
                tracing::warn!("Relay node {} unreachable: {}", relay.node_id, e);
                self.write_selector().remove(&relay.node_id);
                self.reply_error(sender, ErrorCode::RelayUnavailable, e.to_string(), Some(target));
                return;
            }
        }

        let allocation = Allocation {
            requester: sender.to_string(),
            target: target.to_string(),
            payload,
            created: Instant::now(),
        };
        tracing::info!(
            session = %allocation.payload.session_id,
            "Relay {} allocated for {} <-> {}",
            relay.node_id,
            sender,
            target
        );
        self.reply(sender, Signal::RelayResponse(allocation.view_for(sender)));
        self.reply(target, Signal::RelayResponse(allocation.view_for(target)));
        self.allocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, allocation);
    }

    /// Evict inactive peers, expire allocations, ping the rest and refresh
    /// co-located relay health; returns the number of peers evicted
    pub async fn sweep(&self) -> usize {
        let inactive = self.registry.inactive(self.config.inactivity_timeout);
        for (node_id, conn_id) in &inactive {
            tracing::info!("Evicting inactive peer {}", node_id);
            self.unregister_peer(node_id, *conn_id);
        }

        let ttl = self.config.allocation_ttl;
        self.allocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, a| a.created.elapsed() < ttl);

        self.ping_peers();

        if let Some(relay) = self.colocated() {
            let load = relay.service.session_count().await;
            let latency = self.colocated_latency();
            self.write_selector().update_health(
                &relay.service.config().relay_id,
                u32::try_from(load).unwrap_or(u32::MAX),
                latency,
                self.config.colocated_bandwidth_mbps,
            );
        }

        inactive.len()
    }

    fn spawn_sweep_task(self: &Arc<Self>) {
        let coordinator = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let period = self.config.sweep_interval;
        self.tracker.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(coordinator) = coordinator.upgrade() else { break };
                        coordinator.sweep().await;
                    }
                }
            }
        });
    }

    /// Stop the sweep and every connection task
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("Coordinator stopped");
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
