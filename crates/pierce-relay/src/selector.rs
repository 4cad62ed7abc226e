//! Relay node selection.

use crate::error::RelayError;
use pierce_signal::NodeId;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// A relay-capable node and its last reported health
#[derive(Debug, Clone, PartialEq)]
pub struct RelayNode {
    /// Node identifier
    pub node_id: NodeId,
    /// Address peers dial for the relay handshake
    pub addr: SocketAddr,
    /// Active relay sessions on the node
    pub load: u32,
    /// Round-trip estimate to the coordinator
    pub latency: Duration,
    /// Available bandwidth estimate
    pub bandwidth_mbps: u32,
    /// When the health figures were last refreshed
    pub last_checked: Instant,
}

impl RelayNode {
    /// Create a node with no load and unknown latency
    #[must_use]
    pub fn new(node_id: impl Into<NodeId>, addr: SocketAddr) -> Self {
        Self {
            node_id: node_id.into(),
            addr,
            load: 0,
            latency: Duration::ZERO,
            bandwidth_mbps: 0,
            last_checked: Instant::now(),
        }
    }

    /// Set health figures
    #[must_use]
    pub fn with_health(mut self, load: u32, latency: Duration, bandwidth_mbps: u32) -> Self {
        self.load = load;
        self.latency = latency;
        self.bandwidth_mbps = bandwidth_mbps;
        self
    }
}

/// Weights of the composite score
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreWeights {
    /// Weight of `100 / (load + 1)`
    pub load: f64,
    /// Weight of `100 / (latency_ms + 1)`
    pub latency: f64,
    /// Weight of `bandwidth_mbps / 100`
    pub bandwidth: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            load: 0.4,
            latency: 0.3,
            bandwidth: 0.3,
        }
    }
}

/// Selector configuration
#[derive(Debug, Clone, PartialEq)]
pub struct SelectorConfig {
    /// Score weights
    pub weights: ScoreWeights,
    /// Health older than this is scored pessimistically
    pub stale_after: Duration,
    /// Multiplier applied to a stale node's score
    pub stale_factor: f64,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            weights: ScoreWeights::default(),
            stale_after: Duration::from_secs(60),
            stale_factor: 0.5,
        }
    }
}

/// Pool of relay candidates
#[derive(Debug, Default)]
pub struct RelaySelector {
    config: SelectorConfig,
    nodes: HashMap<NodeId, RelayNode>,
}

impl RelaySelector {
    /// Create an empty selector
    #[must_use]
    pub fn new(config: SelectorConfig) -> Self {
        Self {
            config,
            nodes: HashMap::new(),
        }
    }

    /// Add a node, replacing any previous entry with the same id
    pub fn upsert(&mut self, node: RelayNode) {
        self.nodes.insert(node.node_id.clone(), node);
    }

    /// Refresh a node's health; returns `false` for an unknown node
    pub fn update_health(
        &mut self,
        node_id: &str,
        load: u32,
        latency: Duration,
        bandwidth_mbps: u32,
    ) -> bool {
        match self.nodes.get_mut(node_id) {
            Some(node) => {
                node.load = load;
                node.latency = latency;
                node.bandwidth_mbps = bandwidth_mbps;
                node.last_checked = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Replace a node's latency with a fresh measurement
    ///
    /// Load and bandwidth keep their age; only a health report refreshes them.
    pub fn update_latency(&mut self, node_id: &str, latency: Duration) -> bool {
        match self.nodes.get_mut(node_id) {
            Some(node) => {
                node.latency = latency;
                true
            }
            None => false,
        }
    }

    /// Remove a node from the pool
    pub fn remove(&mut self, node_id: &str) -> Option<RelayNode> {
        self.nodes.remove(node_id)
    }

    /// Look up a node
    #[must_use]
    pub fn get(&self, node_id: &str) -> Option<&RelayNode> {
        self.nodes.get(node_id)
    }

    /// Number of candidates
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the pool is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Composite score of `node` as of `now`
    #[must_use]
    pub fn score(&self, node: &RelayNode, now: Instant) -> f64 {
        let w = self.config.weights;
        let latency_ms = node.latency.as_secs_f64() * 1000.0;
        let score = w.load * (100.0 / (f64::from(node.load) + 1.0))
            + w.latency * (100.0 / (latency_ms + 1.0))
            + w.bandwidth * (f64::from(node.bandwidth_mbps) / 100.0);

        if now.saturating_duration_since(node.last_checked) > self.config.stale_after {
            score * self.config.stale_factor
        } else {
            score
        }
    }

    fn eligible<'a>(
        &'a self,
        exclude_a: &'a str,
        exclude_b: &'a str,
    ) -> impl Iterator<Item = &'a RelayNode> + 'a {
        self.nodes
            .values()
            .filter(move |node| node.node_id != exclude_a && node.node_id != exclude_b)
    }

    /// Highest-scoring candidate other than the two excluded peers
    ///
    /// Ties go to the lexicographically smaller node id.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::NoCandidates`] if no node survives the exclusions.
    pub fn select_best(&self, exclude_a: &str, exclude_b: &str) -> Result<RelayNode, RelayError> {
        let now = Instant::now();
        self.eligible(exclude_a, exclude_b)
            .map(|node| (self.score(node, now), node))
            .max_by(|(sa, a), (sb, b)| sa.total_cmp(sb).then_with(|| b.node_id.cmp(&a.node_id)))
            .map(|(_, node)| node.clone())
            .ok_or(RelayError::NoCandidates)
    }

    /// Uniformly random candidate other than the two excluded peers
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::NoCandidates`] if no node survives the exclusions.
    pub fn select_random(&self, exclude_a: &str, exclude_b: &str) -> Result<RelayNode, RelayError> {
        let candidates: Vec<&RelayNode> = self.eligible(exclude_a, exclude_b).collect();
        candidates
            .choose(&mut rand::thread_rng())
            .map(|node| (*node).clone())
            .ok_or(RelayError::NoCandidates)
    }

    /// Up to `count` candidates ordered by preference
    #[must_use]
    pub fn select_fallbacks(&self, exclude_a: &str, exclude_b: &str, count: usize) -> Vec<RelayNode> {
        let now = Instant::now();
        let mut ranked: Vec<(f64, &RelayNode)> = self
            .eligible(exclude_a, exclude_b)
            .map(|node| (self.score(node, now), node))
            .collect();
        ranked.sort_by(|(sa, a), (sb, b)| sb.total_cmp(sa).then_with(|| a.node_id.cmp(&b.node_id)));
        ranked
            .into_iter()
            .take(count)
            .map(|(_, node)| node.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, port: u16, load: u32, latency_ms: u64, bw: u32) -> RelayNode {
        RelayNode::new(id, SocketAddr::from(([127, 0, 0, 1], port))).with_health(
            load,
            Duration::from_millis(latency_ms),
            bw,
        )
    }

    fn three() -> RelaySelector {
        let mut selector = RelaySelector::new(SelectorConfig::default());
        selector.upsert(node("r1", 9001, 10, 20, 80));
        selector.upsert(node("r2", 9002, 50, 10, 50));
        selector.upsert(node("r3", 9003, 5, 100, 100));
        selector
    }

    #[test]
    fn test_score_formula() {
        let selector = three();
        let now = Instant::now();
        let r1 = selector.score(selector.get("r1").unwrap(), now);
        // 0.4 * 100/11 + 0.3 * 100/21 + 0.3 * 0.8
        assert!((r1 - 5.304_935).abs() < 1e-4);
        let r2 = selector.score(selector.get("r2").unwrap(), now);
        assert!((r2 - 3.661_587).abs() < 1e-4);
        let r3 = selector.score(selector.get("r3").unwrap(), now);
        assert!((r3 - 7.263_697).abs() < 1e-4);
    }

    #[test]
    fn test_select_best_default_weights() {
        // The load term dominates with the default weights
        let best = three().select_best("a", "b").unwrap();
        assert_eq!(best.node_id, "r3");
    }

    #[test]
    fn test_select_best_tuned_weights() {
        let mut selector = three();
        selector.config.weights = ScoreWeights {
            load: 0.1,
            latency: 0.8,
            bandwidth: 0.1,
        };
        assert_eq!(selector.select_best("a", "b").unwrap().node_id, "r2");

        selector.config.weights = ScoreWeights {
            load: 0.0,
            latency: 0.0,
            bandwidth: 1.0,
        };
        assert_eq!(selector.select_best("a", "b").unwrap().node_id, "r3");
    }

    #[test]
    fn test_tie_breaks_on_node_id() {
        let mut selector = RelaySelector::default();
        selector.upsert(node("beta", 9001, 1, 1, 1));
        selector.upsert(node("alpha", 9002, 1, 1, 1));
        assert_eq!(selector.select_best("x", "y").unwrap().node_id, "alpha");
    }

    #[test]
    fn test_never_selects_excluded_peers() {
        let selector = three();
        for _ in 0..50 {
            let pick = selector.select_random("r3", "r1").unwrap();
            assert_eq!(pick.node_id, "r2");
        }
        assert_eq!(selector.select_best("r3", "r2").unwrap().node_id, "r1");
    }

    #[test]
    fn test_empty_pool_is_an_error() {
        let selector = RelaySelector::new(SelectorConfig::default());
        assert!(matches!(
            selector.select_best("a", "b"),
            Err(RelayError::NoCandidates)
        ));

        let mut selector = RelaySelector::default();
        selector.upsert(node("a", 9000, 0, 1, 100));
        assert!(matches!(
            selector.select_random("a", "b"),
            Err(RelayError::NoCandidates)
        ));
    }

    #[test]
    fn test_stale_node_penalised_not_excluded() {
        let mut selector = RelaySelector::new(SelectorConfig::default());
        let mut stale = node("stale", 9001, 0, 1, 100);
        if let Some(past) = Instant::now().checked_sub(Duration::from_secs(120)) {
            stale.last_checked = past;
        } else {
            return;
        }
        selector.upsert(stale);
        selector.upsert(node("fresh", 9002, 1, 1, 100));

        // stale: (40 + 15 + 0.3) * 0.5, fresh: 20 + 15 + 0.3
        assert_eq!(selector.select_best("a", "b").unwrap().node_id, "fresh");
        assert_eq!(selector.select_best("fresh", "b").unwrap().node_id, "stale");

        assert!(selector.update_health("stale", 0, Duration::from_millis(1), 100));
        assert_eq!(selector.select_best("a", "b").unwrap().node_id, "stale");
    }

    #[test]
    fn test_fallbacks_ordered() {
        let selector = three();
        let ids: Vec<_> = selector
            .select_fallbacks("x", "y", 2)
            .into_iter()
            .map(|n| n.node_id)
            .collect();
        assert_eq!(ids, vec!["r3".to_string(), "r1".to_string()]);
    }

    #[test]
    fn test_measured_latency_changes_the_pick() {
        let mut selector = RelaySelector::new(SelectorConfig::default());
        selector.upsert(node("relay-1", 9001, 4, 20, 100));
        selector.upsert(node("relay-2", 9002, 4, 20, 100));
        // Identical health: the tie goes to relay-1
        assert_eq!(selector.select_best("a", "b").unwrap().node_id, "relay-1");

        assert!(selector.update_latency("relay-1", Duration::from_millis(250)));
        assert!(!selector.update_latency("ghost", Duration::ZERO));
        let now = Instant::now();
        let slow = selector.score(selector.get("relay-1").unwrap(), now);
        let fast = selector.score(selector.get("relay-2").unwrap(), now);
        assert!(fast > slow);
        assert_eq!(selector.select_best("a", "b").unwrap().node_id, "relay-2");
    }

    #[test]
    fn test_remove() {
        let mut selector = three();
        assert!(selector.remove("r3").is_some());
        assert_eq!(selector.len(), 2);
        assert!(!selector.update_health("r3", 0, Duration::ZERO, 0));
        assert_eq!(selector.select_best("a", "b").unwrap().node_id, "r1");
    }
}
