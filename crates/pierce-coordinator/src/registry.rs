//! Live peer registry
//!
//! One entry per node with an open signaling connection. Each entry carries
//! the node's [`PeerRecord`] plus the outbound queue of its connection, so
//! routing an envelope is a single lookup.

use crate::error::CoordinatorError;
use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use pierce_nat::NatClass;
use pierce_signal::{NatReport, NodeId, PeerDirectory, PeerRecord, RttEstimator, SignalEnvelope};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Registry entry for one connected peer
#[derive(Debug, Clone)]
pub struct PeerEntry {
    /// Public view of the peer
    pub record: PeerRecord,
    /// Relay listener port, for relay-capable peers
    pub relay_port: Option<u16>,
    /// Round trip of the coordinator's pings to this peer
    pub rtt: RttEstimator,
    conn_id: u64,
    outbound: mpsc::Sender<SignalEnvelope>,
    cancel: CancellationToken,
}

/// Connection-scoped handle returned by [`Registry::register`]
#[derive(Debug, Clone)]
pub struct PeerHandle {
    /// Identifier of this connection
    pub conn_id: u64,
    /// Cancelled when the registry evicts the peer
    pub cancel: CancellationToken,
}

/// Peer registry keyed by node id
#[derive(Debug, Default)]
pub struct Registry {
    peers: DashMap<NodeId, PeerEntry>,
}

impl Registry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            peers: DashMap::new(),
        }
    }

    /// Register a connection for `node_id`
    ///
    /// A previous connection for the same node is superseded and cancelled.
    pub fn register(
        &self,
        node_id: &str,
        conn_id: u64,
        outbound: mpsc::Sender<SignalEnvelope>,
    ) -> PeerHandle {
        let cancel = CancellationToken::new();
        let entry = PeerEntry {
            record: PeerRecord::new(node_id),
            relay_port: None,
            rtt: RttEstimator::new(),
            conn_id,
            outbound,
            cancel: cancel.clone(),
        };
        if let Some(previous) = self.peers.insert(node_id.to_string(), entry) {
            tracing::info!(
                "Peer {} reconnected, superseding connection {}",
                node_id,
                previous.conn_id
            );
            previous.cancel.cancel();
        } else {
            tracing::info!("Peer {} registered", node_id);
        }
        PeerHandle { conn_id, cancel }
    }

    /// Remove `node_id` if `conn_id` is still its current connection
    pub fn unregister(&self, node_id: &str, conn_id: u64) -> Option<PeerEntry> {
        let removed = self
            .peers
            .remove_if(node_id, |_, entry| entry.conn_id == conn_id)
            .map(|(_, entry)| entry);
        if let Some(entry) = &removed {
            entry.cancel.cancel();
            tracing::info!("Peer {} unregistered", node_id);
        }
        removed
    }

    /// Apply a NAT report to the peer's record
    pub fn apply_report(&self, node_id: &str, report: &NatReport) -> Option<PeerEntry> {
        let mut entry = self.peers.get_mut(node_id)?;
        update(&mut entry.record, report.nat_type, report.external_addr(), report.local_addr);
        entry.relay_port = report.relay_port;
        Some(entry.clone())
    }

    /// Refresh NAT class and addresses, as carried by a `connect`
    pub fn update_addresses(
        &self,
        node_id: &str,
        nat_class: NatClass,
        external: SocketAddr,
        local: Option<SocketAddr>,
    ) -> Option<PeerRecord> {
        let mut entry = self.peers.get_mut(node_id)?;
        update(&mut entry.record, nat_class, external, local);
        Some(entry.record.clone())
    }

    /// Refresh `last_seen`
    pub fn touch(&self, node_id: &str) {
        if let Some(mut entry) = self.peers.get_mut(node_id) {
            entry.record.last_seen = Utc::now();
        }
    }

    /// A ping to `node_id` went out at `at`
    pub fn ping_sent(&self, node_id: &str, at: Instant) {
        if let Some(mut entry) = self.peers.get_mut(node_id) {
            entry.rtt.ping_sent(at);
        }
    }

    /// A pong from `node_id` arrived at `at`; returns the updated estimate
    ///
    /// `None` when no ping was outstanding.
    pub fn pong_received(&self, node_id: &str, at: Instant) -> Option<Duration> {
        let mut entry = self.peers.get_mut(node_id)?;
        entry.rtt.pong_received(at)?;
        entry.rtt.smoothed()
    }

    /// Measured round trip to `node_id`
    #[must_use]
    pub fn rtt(&self, node_id: &str) -> Option<Duration> {
        self.peers.get(node_id).and_then(|entry| entry.rtt.smoothed())
    }

    /// Median round trip over every peer measured so far
    #[must_use]
    pub fn median_rtt(&self) -> Option<Duration> {
        let mut samples: Vec<Duration> = self
            .peers
            .iter()
            .filter_map(|entry| entry.rtt.smoothed())
            .collect();
        samples.sort_unstable();
        samples.get(samples.len() / 2).copied()
    }

    /// Record for an online peer
    #[must_use]
    pub fn get(&self, node_id: &str) -> Option<PeerRecord> {
        self.peers.get(node_id).map(|entry| entry.record.clone())
    }

    /// Full entry for an online peer
    #[must_use]
    pub fn entry(&self, node_id: &str) -> Option<PeerEntry> {
        self.peers.get(node_id).map(|entry| entry.clone())
    }

    /// Whether `node_id` is online
    #[must_use]
    pub fn contains(&self, node_id: &str) -> bool {
        self.peers.contains_key(node_id)
    }

    /// Queue `envelope` for delivery to `node_id`
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::PeerOffline`] if the node is not connected
    /// and [`CoordinatorError::Backpressure`] if its queue is full.
    pub fn send_to(&self, node_id: &str, envelope: SignalEnvelope) -> Result<(), CoordinatorError> {
        let outbound = self
            .peers
            .get(node_id)
            .map(|entry| entry.outbound.clone())
            .ok_or_else(|| CoordinatorError::PeerOffline(node_id.to_string()))?;
        outbound.try_send(envelope).map_err(|e| match e {
            TrySendError::Full(_) => CoordinatorError::Backpressure(node_id.to_string()),
            TrySendError::Closed(_) => CoordinatorError::PeerOffline(node_id.to_string()),
        })
    }

    /// Peers silent for longer than `timeout`, with their connection ids
    #[must_use]
    pub fn inactive(&self, timeout: Duration) -> Vec<(NodeId, u64)> {
        let Ok(timeout) = ChronoDuration::from_std(timeout) else {
            return Vec::new();
        };
        let cutoff = Utc::now() - timeout;
        self.peers
            .iter()
            .filter(|entry| entry.record.last_seen < cutoff)
            .map(|entry| (entry.key().clone(), entry.conn_id))
            .collect()
    }

    /// Online node ids
    #[must_use]
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.peers.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Number of online peers
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether no peer is online
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

fn update(record: &mut PeerRecord, nat_class: NatClass, external: SocketAddr, local: Option<SocketAddr>) {
    record.nat_class = nat_class;
    if !external.ip().is_unspecified() {
        record.external_addr = Some(external);
    }
    if local.is_some() {
        record.local_addr = local;
    }
    record.last_seen = Utc::now();
}

impl PeerDirectory for Registry {
    fn lookup(&self, node_id: &str) -> Option<PeerRecord> {
        self.get(node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pierce_signal::Signal;

    fn report(class: NatClass) -> NatReport {
        NatReport {
            nat_type: class,
            external_ip: "198.51.100.7".parse().unwrap(),
            external_port: 40000,
            local_addr: Some("192.168.0.5:40000".parse().unwrap()),
            relay_port: Some(7401),
            health: None,
        }
    }

    #[test]
    fn test_register_and_report() {
        let registry = Registry::new();
        let (tx, _rx) = mpsc::channel(4);
        registry.register("node-a", 1, tx);
        assert!(registry.contains("node-a"));
        assert_eq!(registry.get("node-a").unwrap().nat_class, NatClass::Unknown);

        let entry = registry
            .apply_report("node-a", &report(NatClass::FullCone))
            .unwrap();
        assert_eq!(entry.relay_port, Some(7401));
        let record = registry.lookup("node-a").unwrap();
        assert_eq!(record.nat_class, NatClass::FullCone);
        assert_eq!(
            record.external_addr,
            Some("198.51.100.7:40000".parse().unwrap())
        );
        assert!(registry.apply_report("ghost", &report(NatClass::None)).is_none());

        // An unspecified external address keeps the reflected one
        let record = registry
            .update_addresses("node-a", NatClass::RestrictedCone, "0.0.0.0:0".parse().unwrap(), None)
            .unwrap();
        assert_eq!(record.nat_class, NatClass::RestrictedCone);
        assert_eq!(
            record.external_addr,
            Some("198.51.100.7:40000".parse().unwrap())
        );
        assert_eq!(record.local_addr, Some("192.168.0.5:40000".parse().unwrap()));
    }

    #[test]
    fn test_superseded_connection() {
        let registry = Registry::new();
        let (tx1, _rx1) = mpsc::channel(4);
        let (tx2, _rx2) = mpsc::channel(4);
        let first = registry.register("node-a", 1, tx1);
        let second = registry.register("node-a", 2, tx2);
        assert!(first.cancel.is_cancelled());
        assert!(!second.cancel.is_cancelled());

        // Stale connection cannot remove the new registration
        assert!(registry.unregister("node-a", 1).is_none());
        assert!(registry.contains("node-a"));
        assert!(registry.unregister("node-a", 2).is_some());
        assert!(second.cancel.is_cancelled());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_send_to() {
        let registry = Registry::new();
        let (tx, mut rx) = mpsc::channel(1);
        registry.register("node-a", 1, tx);

        registry
            .send_to("node-a", SignalEnvelope::new("coordinator", Signal::Pong))
            .unwrap();
        assert!(matches!(
            registry.send_to("node-a", SignalEnvelope::new("coordinator", Signal::Pong)),
            Err(CoordinatorError::Backpressure(_))
        ));
        assert_eq!(rx.try_recv().unwrap().kind(), pierce_signal::SignalKind::Pong);
        assert!(matches!(
            registry.send_to("node-b", SignalEnvelope::new("coordinator", Signal::Pong)),
            Err(CoordinatorError::PeerOffline(_))
        ));
    }

    #[test]
    fn test_round_trips() {
        let registry = Registry::new();
        assert_eq!(registry.median_rtt(), None);
        let start = Instant::now();
        for (i, (id, ms)) in [("node-a", 10), ("node-b", 40), ("node-c", 90)].into_iter().enumerate() {
            let (tx, _rx) = mpsc::channel(1);
            registry.register(id, i as u64, tx);
            registry.ping_sent(id, start);
            assert_eq!(
                registry.pong_received(id, start + Duration::from_millis(ms)),
                Some(Duration::from_millis(ms))
            );
        }
        assert_eq!(registry.rtt("node-b"), Some(Duration::from_millis(40)));
        assert_eq!(registry.median_rtt(), Some(Duration::from_millis(40)));

        // Unsolicited pongs and unknown peers leave estimates alone
        assert_eq!(registry.pong_received("node-a", start + Duration::from_secs(5)), None);
        assert_eq!(registry.pong_received("ghost", start), None);
        assert_eq!(registry.rtt("node-a"), Some(Duration::from_millis(10)));
    }

    #[test]
    fn test_inactive() {
        let registry = Registry::new();
        let (tx, _rx) = mpsc::channel(1);
        registry.register("node-a", 7, tx);
        registry.peers.get_mut("node-a").unwrap().record.last_seen =
            Utc::now() - ChronoDuration::seconds(120);
        let (tx, _rx2) = mpsc::channel(1);
        registry.register("node-b", 8, tx);

        let inactive = registry.inactive(Duration::from_secs(90));
        assert_eq!(inactive, vec![("node-a".to_string(), 7)]);

        registry.touch("node-a");
        assert!(registry.inactive(Duration::from_secs(90)).is_empty());
    }
}
