//! Connection engine
//!
//! `connect` asks the coordinator for a strategy, then walks the fallback
//! chain starting there:
//!
//! ```text
//! (Direct | HolePunch) -> Relay
//!            HolePunch -> Relay
//!                         Relay
//! ```
//!
//! When the coordinator picks Direct, the direct connect and the hole punch
//! race under one cancellation token; the first to connect cancels the other
//! and both are joined before the stage ends. The remote side receives the
//! forwarded `connect` and walks the same chain as responder, so both ends
//! reach each stage at about the same time. Every stage failure is recorded;
//! only when the chain is exhausted does the caller see an error, carrying the
//! full [`AttemptReport`].

use crate::config::{ClientConfig, HostedRelayConfig};
use crate::error::{AttemptReport, ConnectError};
use crate::inbox::{Inbox, PeerInbox};
use crate::mapper::{MappingLease, MappingProtocol, PortMapper};
use pierce_nat::socket::unspecified_for;
use pierce_nat::{
    AttemptFailure, Conn, DirectRole, HolePuncher, NatClass, NatClassifier, PunchRole, Strategy,
    connect_direct,
};
use pierce_relay::{RelayService, Reservation, dial};
use pierce_signal::{
    ConnectPayload, NatReport, NodeId, RelayHealth, RelayResponsePayload, Signal, SignalEnvelope,
    SignalKind, SignalingChannel,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tokio::sync::{Mutex, mpsc};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Established connection to a peer
#[derive(Debug)]
pub struct Connection {
    /// Remote node
    pub peer_id: NodeId,
    /// Strategy that succeeded
    pub strategy: Strategy,
    /// Byte stream to the peer, owned by the caller
    pub conn: Conn,
    /// Stages that failed before this one
    pub report: AttemptReport,
}

/// This node as last classified
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalView {
    /// NAT class
    pub nat_class: NatClass,
    /// Reflected address
    pub external_addr: Option<SocketAddr>,
    /// Address on the local network
    pub local_addr: Option<SocketAddr>,
}

impl Default for LocalView {
    fn default() -> Self {
        Self {
            nat_class: NatClass::Unknown,
            external_addr: None,
            local_addr: None,
        }
    }
}

/// What this node knows about the remote side of an attempt
#[derive(Debug, Clone, Copy)]
struct PeerView {
    nat_class: NatClass,
    external_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
}

impl PeerView {
    fn from_payload(payload: &ConnectPayload) -> Self {
        let external = payload.external_addr();
        Self {
            nat_class: payload.nat_type,
            external_addr: (!external.ip().is_unspecified() && external.port() != 0).then_some(external),
            local_addr: payload.local_addr,
        }
    }
}

/// One step of the fallback chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    /// Direct connect raced against a hole punch
    DirectOrPunch,
    Punch,
    Relay,
}

/// Stages to walk, starting from the coordinator's pick
fn fallback_chain(start: Strategy) -> &'static [Stage] {
    match start {
        Strategy::Direct => &[Stage::DirectOrPunch, Stage::Relay],
        Strategy::HolePunch => &[Stage::Punch, Stage::Relay],
        Strategy::Relay => &[Stage::Relay],
    }
}

/// Run two stages concurrently and keep the first connection
///
/// The first success cancels `race`; the other stage is still awaited so its
/// sockets and leases are released before this returns. Failures that happen
/// before a winner is known are recorded in `report`.
async fn race_first<A, B>(
    (first_strategy, first): (Strategy, A),
    (second_strategy, second): (Strategy, B),
    race: &CancellationToken,
    report: &mut AttemptReport,
) -> Option<(Strategy, Conn)>
where
    A: Future<Output = Result<Conn, ConnectError>>,
    B: Future<Output = Result<Conn, ConnectError>>,
{
    let started = Instant::now();
    tokio::pin!(first, second);
    let (mut first_done, mut second_done) = (false, false);
    let mut winner = None;

    while !(first_done && second_done) {
        let (strategy, outcome) = tokio::select! {
            outcome = &mut first, if !first_done => {
                first_done = true;
                (first_strategy, outcome)
            }
            outcome = &mut second, if !second_done => {
                second_done = true;
                (second_strategy, outcome)
            }
        };
        match outcome {
            Ok(conn) if winner.is_none() => {
                race.cancel();
                winner = Some((strategy, conn));
            }
            Ok(conn) => tracing::debug!("{} also connected over {}, dropping it", strategy, conn.transport()),
            Err(e) if winner.is_some() => tracing::trace!("{} stopped after the race was won: {}", strategy, e),
            Err(e) => report.record(strategy, e, started.elapsed()),
        }
    }
    winner
}

/// Record a failed single stage; offline peers and shutdown end the walk
fn settle(
    strategy: Strategy,
    outcome: Result<Conn, ConnectError>,
    started: Instant,
    report: &mut AttemptReport,
) -> Result<Option<(Strategy, Conn)>, ConnectError> {
    match outcome {
        Ok(conn) => Ok(Some((strategy, conn))),
        Err(e @ (ConnectError::PeerOffline(_) | ConnectError::ShuttingDown)) => Err(e),
        Err(e) => {
            report.record(strategy, e, started.elapsed());
            Ok(None)
        }
    }
}

struct HostedRelay {
    service: Arc<RelayService>,
    port: u16,
    bandwidth_mbps: u32,
}

/// Work the signaling handlers hand to the client's tasks
enum Inbound {
    Connect(SignalEnvelope),
    Reserve(RelayResponsePayload),
}

/// Peer-side connection engine
pub struct PeerClient {
    config: ClientConfig,
    channel: SignalingChannel,
    mapper: Arc<dyn PortMapper>,
    puncher: HolePuncher,
    local: RwLock<LocalView>,
    inbox: Arc<Inbox>,
    relay: Option<HostedRelay>,
    accepted: Mutex<mpsc::Receiver<Connection>>,
    accepted_tx: mpsc::Sender<Connection>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl PeerClient {
    /// Classify, open the signaling channel and start serving inbound attempts
    ///
    /// A failed classification is not fatal: the node registers as
    /// [`NatClass::Unknown`] and is reclassified periodically.
    ///
    /// # Errors
    ///
    /// Returns an error if the hosted relay cannot bind its listener.
    pub async fn start(config: ClientConfig, mapper: Arc<dyn PortMapper>) -> Result<Arc<Self>, ConnectError> {
        let mut config = config;
        let port = config.punch_port();
        config.classifier.local_port = port;
        config.punch.local_port = port;

        let local = classify(&config).await;
        // Punch from the port the reflected address was learned on
        if let (0, Some(classified)) = (port, local.local_addr) {
            tracing::debug!("Pinning punch port to classified port {}", classified.port());
            config.classifier.local_port = classified.port();
            config.punch.local_port = classified.port();
        }
        let relay = match &config.hosted_relay {
            Some(hosted) if local.nat_class.is_relay_capable() => Some(host_relay(hosted).await?),
            Some(_) => {
                tracing::info!("Not hosting a relay behind {} NAT", local.nat_class);
                None
            }
            None => None,
        };

        let channel = SignalingChannel::open(config.signaling.clone());
        let (accepted_tx, accepted) = mpsc::channel(16);
        let client = Arc::new(Self {
            puncher: HolePuncher::new(config.punch.clone()),
            config,
            channel,
            mapper,
            local: RwLock::new(local),
            inbox: Arc::new(Inbox::default()),
            relay,
            accepted: Mutex::new(accepted),
            accepted_tx,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        });

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        client.register_handlers(inbound_tx);
        client.announce().await;
        client.spawn_inbound_task(inbound_rx);
        client.spawn_maintenance_task();

        tracing::info!(
            "Peer client {} started ({} NAT{})",
            client.node_id(),
            local.nat_class,
            if client.relay.is_some() { ", hosting relay" } else { "" }
        );
        Ok(client)
    }

    /// This node's id
    #[must_use]
    pub fn node_id(&self) -> &str {
        self.config.node_id()
    }

    /// Current classification
    #[must_use]
    pub fn local_view(&self) -> LocalView {
        *self.local.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// The signaling channel
    #[must_use]
    pub fn channel(&self) -> &SignalingChannel {
        &self.channel
    }

    /// Relay hosted by this node, if any
    #[must_use]
    pub fn hosted_relay(&self) -> Option<&Arc<RelayService>> {
        self.relay.as_ref().map(|r| &r.service)
    }

    /// Connect to `peer_id`
    ///
    /// # Errors
    ///
    /// [`ConnectError::PeerOffline`] straight away when the coordinator does
    /// not know the peer, [`ConnectError::Timeout`] when the coordinator does
    /// not answer, and [`ConnectError::Exhausted`] with every stage's failure
    /// when no strategy worked.
    pub async fn connect(&self, peer_id: &str) -> Result<Connection, ConnectError> {
        if self.cancel.is_cancelled() {
            return Err(ConnectError::ShuttingDown);
        }
        let mut replies = self.inbox.subscribe(peer_id);
        let local = self.local_view();
        let external = local
            .external_addr
            .unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));

        tracing::info!("Connecting to {}", peer_id);
        self.channel.signal(
            Some(peer_id),
            Signal::Connect(ConnectPayload {
                nat_type: local.nat_class,
                external_ip: external.ip(),
                external_port: external.port(),
                local_addr: local.local_addr,
                connection_type: None,
                source_id: None,
            }),
        )?;

        let answer = replies.answer(self.config.signal_timeout).await?;
        let strategy = answer.connection_type.unwrap_or(Strategy::HolePunch);
        tracing::debug!(
            "Coordinator picked {} for {} ({} NAT)",
            strategy,
            peer_id,
            answer.nat_type
        );
        let peer = PeerView::from_payload(&answer);
        self.walk(peer_id, peer, strategy, true, &mut replies).await
    }

    /// Next connection established by a remote peer's `connect`
    ///
    /// Returns `None` once the client has shut down.
    pub async fn accept(&self) -> Option<Connection> {
        let mut accepted = self.accepted.lock().await;
        tokio::select! {
            () = self.cancel.cancelled() => None,
            connection = accepted.recv() => connection,
        }
    }

    async fn walk(
        &self,
        peer_id: &str,
        peer: PeerView,
        start: Strategy,
        initiator: bool,
        replies: &mut PeerInbox,
    ) -> Result<Connection, ConnectError> {
        let cancel = self.cancel.child_token();
        let mut report = AttemptReport::new(peer_id);

        for &stage in fallback_chain(start) {
            let started = Instant::now();
            let won = match stage {
                Stage::DirectOrPunch => {
                    let race = cancel.child_token();
                    race_first(
                        (Strategy::Direct, self.try_direct(peer, initiator, &race)),
                        (Strategy::HolePunch, self.try_punch(peer, initiator, &race)),
                        &race,
                        &mut report,
                    )
                    .await
                }
                Stage::Punch => settle(
                    Strategy::HolePunch,
                    self.try_punch(peer, initiator, &cancel).await,
                    started,
                    &mut report,
                )?,
                Stage::Relay => settle(
                    Strategy::Relay,
                    self.try_relay(peer_id, replies).await,
                    started,
                    &mut report,
                )?,
            };
            if let Some((strategy, conn)) = won {
                tracing::info!(
                    "Connected to {} via {} ({}) after {} failed stage(s)",
                    peer_id,
                    strategy,
                    conn.transport(),
                    report.stages.len()
                );
                return Ok(Connection {
                    peer_id: peer_id.to_string(),
                    strategy,
                    conn,
                    report,
                });
            }
            if cancel.is_cancelled() {
                return Err(ConnectError::ShuttingDown);
            }
        }

        tracing::warn!("All strategies to {} failed: {}", peer_id, report);
        Err(ConnectError::Exhausted(report))
    }

    async fn try_direct(&self, peer: PeerView, initiator: bool, cancel: &CancellationToken) -> Result<Conn, ConnectError> {
        let local = self.local_view();
        let Some(external) = peer.external_addr else {
            return Err(ConnectError::stage(
                Strategy::Direct,
                AttemptFailure::Ineligible("peer address unknown".into()),
            ));
        };
        let same_lan = (local.local_addr.is_some() && local.local_addr == peer.external_addr)
            || (peer.local_addr.is_some() && peer.local_addr == local.external_addr);
        let role = DirectRole::decide(local.nat_class, peer.nat_class, initiator, same_lan);

        let mut targets = Vec::with_capacity(2);
        if same_lan {
            targets.extend(peer.local_addr);
        }
        targets.push(external);

        let port = self.config.punch.local_port;
        // The peer must reach us through our own NAT
        let lease = if role == DirectRole::Accept
            && !matches!(local.nat_class, NatClass::None | NatClass::Symmetric)
        {
            let external_port = local.external_addr.map_or(port, |a| a.port());
            MappingLease::acquire(&self.mapper, MappingProtocol::Tcp, port, external_port, self.config.mapping_lease)
                .await
        } else {
            None
        };

        let result = connect_direct(
            unspecified_for(external, port),
            targets,
            role,
            self.config.punch.retry_interval,
            self.config.direct_timeout,
            cancel,
        )
        .await;

        if let Some(lease) = lease {
            lease.release().await;
        }
        result
            .into_result()
            .map_err(|failure| ConnectError::stage(Strategy::Direct, failure))
    }

    async fn try_punch(&self, peer: PeerView, initiator: bool, cancel: &CancellationToken) -> Result<Conn, ConnectError> {
        let local = self.local_view();
        let Some(external) = peer.external_addr else {
            return Err(ConnectError::stage(
                Strategy::HolePunch,
                AttemptFailure::Ineligible("peer address unknown".into()),
            ));
        };
        if local.nat_class == NatClass::Symmetric && peer.nat_class == NatClass::Symmetric {
            return Err(ConnectError::stage(
                Strategy::HolePunch,
                AttemptFailure::Ineligible("both sides symmetric".into()),
            ));
        }
        let role = if initiator {
            PunchRole::Initiator
        } else {
            PunchRole::Responder
        };
        self.puncher
            .punch(local.nat_class, external, peer.nat_class, role, cancel)
            .await
            .into_result()
            .map_err(|failure| ConnectError::stage(Strategy::HolePunch, failure))
    }

    async fn try_relay(&self, peer_id: &str, replies: &mut PeerInbox) -> Result<Conn, ConnectError> {
        self.channel.signal(Some(peer_id), Signal::RelayRequest)?;
        let allocation = replies.relay(self.config.signal_timeout).await?;
        tracing::debug!(
            "Relay {} at {} allocated for {} (session {})",
            allocation.relay_id,
            allocation.relay_addr(),
            peer_id,
            allocation.session_id
        );
        let stream = dial(allocation.relay_addr(), peer_id, self.config.relay_timeout).await?;
        Ok(Conn::Tcp(stream))
    }

    /// Answer a forwarded `connect` as responder
    async fn respond(&self, envelope: SignalEnvelope) {
        let Signal::Connect(payload) = envelope.body else {
            return;
        };
        let initiator = payload
            .source_id
            .clone()
            .unwrap_or_else(|| envelope.sender_id.clone());
        let strategy = payload.connection_type.unwrap_or(Strategy::HolePunch);
        tracing::info!("Incoming connection from {} ({})", initiator, strategy);

        let mut replies = self.inbox.subscribe(&initiator);
        let peer = PeerView::from_payload(&payload);
        match self.walk(&initiator, peer, strategy, false, &mut replies).await {
            Ok(connection) => {
                if self.accepted_tx.send(connection).await.is_err() {
                    tracing::debug!("Dropping connection from {}, nobody accepting", initiator);
                }
            }
            Err(e) => tracing::warn!("Incoming connection from {} failed: {}", initiator, e),
        }
    }

    fn register_handlers(&self, inbound: mpsc::UnboundedSender<Inbound>) {
        let connects = inbound.clone();
        self.channel.register_handler(SignalKind::Connect, move |envelope| {
            if connects.send(Inbound::Connect(envelope.clone())).is_err() {
                tracing::debug!("Dropping connect from {}, client stopped", envelope.sender_id);
            }
        });

        let inbox = Arc::clone(&self.inbox);
        self.channel.register_handler(SignalKind::Answer, move |envelope| {
            inbox.deliver(envelope);
        });

        let inbox = Arc::clone(&self.inbox);
        let node_id = self.node_id().to_string();
        self.channel.register_handler(SignalKind::RelayResponse, move |envelope| {
            let Signal::RelayResponse(payload) = &envelope.body else {
                return;
            };
            // Reservation for the relay we host
            if payload.source_id.is_some() && payload.target_id.is_some() && payload.relay_id == node_id {
                if inbound.send(Inbound::Reserve(payload.clone())).is_err() {
                    tracing::debug!("Dropping relay reservation {}, client stopped", payload.session_id);
                }
            } else {
                inbox.deliver(envelope);
            }
        });

        let inbox = Arc::clone(&self.inbox);
        self.channel.register_handler(SignalKind::Error, move |envelope| {
            if !inbox.deliver(envelope) {
                if let Signal::Error(error) = &envelope.body {
                    tracing::debug!("Coordinator error: {} ({:?})", error.message, error.code);
                }
            }
        });
    }

    fn spawn_inbound_task(self: &Arc<Self>, mut inbound: mpsc::UnboundedReceiver<Inbound>) {
        let client = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            loop {
                let work = tokio::select! {
                    () = cancel.cancelled() => break,
                    work = inbound.recv() => work,
                };
                let Some(work) = work else { break };
                let Some(client) = client.upgrade() else { break };
                match work {
                    Inbound::Connect(envelope) => {
                        let attempt = Arc::clone(&client);
                        client.tracker.spawn(async move { attempt.respond(envelope).await });
                    }
                    Inbound::Reserve(payload) => client.reserve(payload).await,
                }
            }
        });
    }

    async fn reserve(&self, payload: RelayResponsePayload) {
        let (Some(relay), Some(source), Some(target)) = (&self.relay, payload.source_id, payload.target_id) else {
            tracing::debug!("Ignoring relay reservation {}, not hosting", payload.session_id);
            return;
        };
        tracing::debug!("Reserving relay session {} for {} -> {}", payload.session_id, source, target);
        relay
            .service
            .reserve(Reservation {
                source_ip: payload.source_addr.map(|a| a.ip()),
                target_ip: payload.target_addr.map(|a| a.ip()),
                ..Reservation::new(payload.session_id, source, target)
            })
            .await;
    }

    /// Current NAT report, with relay health when hosting
    async fn report(&self) -> NatReport {
        let local = self.local_view();
        let external = local
            .external_addr
            .unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
        let health = match &self.relay {
            Some(relay) => Some(RelayHealth {
                load: u32::try_from(relay.service.session_count().await).unwrap_or(u32::MAX),
                latency_ms: self
                    .channel
                    .rtt()
                    .map_or(0, |rtt| u32::try_from(rtt.as_millis()).unwrap_or(u32::MAX)),
                bandwidth_mbps: relay.bandwidth_mbps,
            }),
            None => None,
        };
        NatReport {
            nat_type: local.nat_class,
            external_ip: external.ip(),
            external_port: external.port(),
            local_addr: local.local_addr,
            relay_port: self.relay.as_ref().map(|r| r.port),
            health,
        }
    }

    /// Send the NAT report now and on every reconnect
    async fn announce(&self) {
        let envelope = SignalEnvelope::new(self.node_id(), Signal::Offer(self.report().await));
        self.channel.set_hello(envelope);
    }

    fn spawn_maintenance_task(self: &Arc<Self>) {
        let client: Weak<Self> = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let health_period = self.config.health_interval;
        let reclassify_period = self.config.reclassify_interval;
        self.tracker.spawn(async move {
            let mut health = tokio::time::interval_at(Instant::now() + health_period, health_period);
            health.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut reclassify =
                tokio::time::interval_at(Instant::now() + reclassify_period, reclassify_period);
            reclassify.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = health.tick() => {
                        let Some(client) = client.upgrade() else { break };
                        if client.relay.is_some() {
                            client.announce().await;
                        }
                    }
                    _ = reclassify.tick() => {
                        let Some(client) = client.upgrade() else { break };
                        client.reclassify().await;
                    }
                }
            }
        });
    }

    /// Rerun classification and report a change
    pub async fn reclassify(&self) {
        if self.config.classifier.reflectors.is_empty() {
            return;
        }
        let fresh = classify(&self.config).await;
        if fresh.nat_class == NatClass::Unknown {
            return;
        }
        let previous = {
            let mut local = self.local.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *local, fresh)
        };
        if previous != fresh {
            tracing::info!(
                "NAT changed from {} to {}",
                previous.nat_class,
                fresh.nat_class
            );
            self.announce().await;
        }
    }

    /// Close the channel, stop every task and the hosted relay
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.channel.shutdown().await;
        self.tracker.close();
        self.tracker.wait().await;
        if let Some(relay) = &self.relay {
            relay.service.shutdown().await;
        }
        tracing::info!("Peer client {} stopped", self.node_id());
    }
}

impl Drop for PeerClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn classify(config: &ClientConfig) -> LocalView {
    if config.classifier.reflectors.is_empty() {
        tracing::debug!("No reflectors configured, NAT class unknown");
        return LocalView::default();
    }
    match NatClassifier::new(config.classifier.clone()).classify().await {
        Ok(classification) => LocalView {
            nat_class: classification.nat_class,
            external_addr: Some(classification.external_addr),
            local_addr: Some(classification.local_addr),
        },
        Err(e) => {
            tracing::warn!("{}", ConnectError::ClassificationFailed(e));
            LocalView::default()
        }
    }
}

async fn host_relay(config: &HostedRelayConfig) -> Result<HostedRelay, ConnectError> {
    let service = RelayService::start(config.service.clone(), None);
    let bound = service.listen(config.listen).await?;
    Ok(HostedRelay {
        service,
        port: config.advertised_port.unwrap_or(bound.port()),
        bandwidth_mbps: config.bandwidth_mbps,
    })
}
