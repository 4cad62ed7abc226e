//! Client configuration

use pierce_nat::{ClassifierConfig, PunchConfig};
use pierce_relay::RelayServiceConfig;
use pierce_signal::{ChannelConfig, NodeId};
use std::net::SocketAddr;
use std::time::Duration;

/// Relay this client hosts for others when its NAT allows
#[derive(Debug, Clone)]
pub struct HostedRelayConfig {
    /// Listen address
    pub listen: SocketAddr,
    /// Port advertised to the coordinator; defaults to the bound port
    pub advertised_port: Option<u16>,
    /// Relay service settings
    pub service: RelayServiceConfig,
    /// Bandwidth advertised in health reports
    pub bandwidth_mbps: u32,
}

impl Default for HostedRelayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 7401)),
            advertised_port: None,
            service: RelayServiceConfig::default(),
            bandwidth_mbps: 100,
        }
    }
}

/// Peer client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Signaling channel settings, including this node's id
    pub signaling: ChannelConfig,
    /// NAT classification settings; `local_port` is shared with punching
    pub classifier: ClassifierConfig,
    /// Hole punch settings
    pub punch: PunchConfig,
    /// Deadline for the direct stage
    pub direct_timeout: Duration,
    /// Deadline for the coordinator's answer or relay allocation
    pub signal_timeout: Duration,
    /// Relay handshake deadline
    pub relay_timeout: Duration,
    /// Reclassification period
    pub reclassify_interval: Duration,
    /// Relay health report period
    pub health_interval: Duration,
    /// Lease requested for gateway port mappings
    pub mapping_lease: Duration,
    /// Relay hosted by this client, if any
    pub hosted_relay: Option<HostedRelayConfig>,
}

impl ClientConfig {
    /// Defaults for a node connecting to `coordinator_url`
    #[must_use]
    pub fn new(coordinator_url: impl Into<String>, node_id: impl Into<NodeId>) -> Self {
        Self {
            signaling: ChannelConfig::new(coordinator_url, node_id),
            classifier: ClassifierConfig::default(),
            punch: PunchConfig::default(),
            direct_timeout: Duration::from_secs(5),
            signal_timeout: Duration::from_secs(10),
            relay_timeout: Duration::from_secs(10),
            reclassify_interval: Duration::from_secs(300),
            health_interval: Duration::from_secs(30),
            mapping_lease: Duration::from_secs(300),
            hosted_relay: None,
        }
    }

    /// This node's id
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.signaling.node_id
    }

    /// Local port used for classification and punching
    #[must_use]
    pub fn punch_port(&self) -> u16 {
        if self.punch.local_port != 0 {
            self.punch.local_port
        } else {
            self.classifier.local_port
        }
    }
}
