//! Configuration system for the Pierce CLI.

use pierce_client::{ClientConfig, HostedRelayConfig};
use pierce_coordinator::CoordinatorConfig;
use pierce_nat::{ClassifierConfig, PunchConfig};
use pierce_relay::{BandwidthCaps, RelayServiceConfig, ScoreWeights, SelectorConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Pierce configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Node identity and coordinator
    #[serde(default)]
    pub node: NodeSection,
    /// NAT classification and punching
    #[serde(default)]
    pub nat: NatSection,
    /// Signaling, client and server side
    #[serde(default)]
    pub signaling: SignalingSection,
    /// Relay service
    #[serde(default)]
    pub relay: RelaySection,
    /// Relay selection
    #[serde(default)]
    pub selector: SelectorSection,
    /// Logging
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    /// This node's id
    #[serde(default = "default_node_id")]
    pub id: String,
    /// Coordinator URL
    #[serde(default = "default_coordinator_url")]
    pub coordinator_url: String,
    /// Bearer token presented to the coordinator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

/// NAT configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatSection {
    /// STUN reflectors (host:port)
    #[serde(default)]
    pub reflectors: Vec<String>,
    /// Local port shared by classification and punching
    #[serde(default = "default_punch_port")]
    pub punch_port: u16,
    /// STUN exchange timeout in milliseconds
    #[serde(default = "default_stun_timeout_ms")]
    pub stun_timeout_ms: u64,
    /// Run CHANGE-REQUEST filtering probes
    #[serde(default = "default_true")]
    pub probe_filtering: bool,
    /// Punch deadline in seconds
    #[serde(default = "default_punch_timeout_secs")]
    pub punch_timeout_secs: u64,
    /// Delay between probes in milliseconds
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    /// Maximum UDP probes
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Allow TCP simultaneous open
    #[serde(default = "default_true")]
    pub enable_tcp: bool,
    /// Run a STUN reflector on this address (serve only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reflector_bind: Option<String>,
}

/// Signaling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingSection {
    /// Coordinator listen address (serve)
    #[serde(default = "default_signaling_listen")]
    pub listen_addr: String,
    /// Keepalive period in seconds
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    /// First reconnect delay in milliseconds
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,
    /// Reconnect delay ceiling in seconds
    #[serde(default = "default_reconnect_max_secs")]
    pub reconnect_max_secs: u64,
    /// Outbound queue capacity
    #[serde(default = "default_send_queue")]
    pub send_queue: usize,
    /// Peers silent this long are evicted (serve)
    #[serde(default = "default_inactivity_secs")]
    pub inactivity_timeout_secs: u64,
    /// Accepted bearer tokens and the node each one pins (serve); empty accepts all
    #[serde(default)]
    pub tokens: HashMap<String, String>,
}

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySection {
    /// Relay listen address
    #[serde(default = "default_relay_listen")]
    pub listen_addr: String,
    /// Address peers are told to dial, when it differs from the listen address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advertise_addr: Option<String>,
    /// Host a relay from `connect`/`listen` when the NAT allows
    #[serde(default)]
    pub host: bool,
    /// Per-node cap in bytes per second
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_cap: Option<u64>,
    /// Per-session cap in bytes per second
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_cap: Option<u64>,
    /// Idle session timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Pairing window in seconds
    #[serde(default = "default_pairing_timeout_secs")]
    pub pairing_timeout_secs: u64,
    /// Maximum concurrent sessions
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Bandwidth advertised to the coordinator
    #[serde(default = "default_bandwidth_mbps")]
    pub bandwidth_mbps: u32,
}

/// Relay selection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorSection {
    /// Weight of the load term
    #[serde(default = "default_load_weight")]
    pub load_weight: f64,
    /// Weight of the latency term
    #[serde(default = "default_latency_weight")]
    pub latency_weight: f64,
    /// Weight of the bandwidth term
    #[serde(default = "default_bandwidth_weight")]
    pub bandwidth_weight: f64,
    /// Health older than this many seconds is scored pessimistically
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    /// Pick relays uniformly at random
    #[serde(default)]
    pub random: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Log level or filter directive
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_node_id() -> String {
    "node".to_string()
}

fn default_coordinator_url() -> String {
    "ws://127.0.0.1:7400".to_string()
}

fn default_punch_port() -> u16 {
    40000
}

fn default_stun_timeout_ms() -> u64 {
    3000
}

fn default_true() -> bool {
    true
}

fn default_punch_timeout_secs() -> u64 {
    10
}

fn default_retry_interval_ms() -> u64 {
    1000
}

fn default_max_retries() -> u32 {
    10
}

fn default_signaling_listen() -> String {
    "0.0.0.0:7400".to_string()
}

fn default_keepalive_secs() -> u64 {
    30
}

fn default_reconnect_initial_ms() -> u64 {
    1000
}

fn default_reconnect_max_secs() -> u64 {
    30
}

fn default_send_queue() -> usize {
    256
}

fn default_inactivity_secs() -> u64 {
    90
}

fn default_relay_listen() -> String {
    "0.0.0.0:7401".to_string()
}

fn default_idle_timeout_secs() -> u64 {
    300
}

fn default_pairing_timeout_secs() -> u64 {
    30
}

fn default_max_sessions() -> usize {
    1024
}

fn default_bandwidth_mbps() -> u32 {
    100
}

fn default_load_weight() -> f64 {
    0.4
}

fn default_latency_weight() -> f64 {
    0.3
}

fn default_bandwidth_weight() -> f64 {
    0.3
}

fn default_stale_after_secs() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            id: default_node_id(),
            coordinator_url: default_coordinator_url(),
            auth_token: None,
        }
    }
}

impl Default for NatSection {
    fn default() -> Self {
        Self {
            reflectors: Vec::new(),
            punch_port: default_punch_port(),
            stun_timeout_ms: default_stun_timeout_ms(),
            probe_filtering: true,
            punch_timeout_secs: default_punch_timeout_secs(),
            retry_interval_ms: default_retry_interval_ms(),
            max_retries: default_max_retries(),
            enable_tcp: true,
            reflector_bind: None,
        }
    }
}

impl Default for SignalingSection {
    fn default() -> Self {
        Self {
            listen_addr: default_signaling_listen(),
            keepalive_secs: default_keepalive_secs(),
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_secs: default_reconnect_max_secs(),
            send_queue: default_send_queue(),
            inactivity_timeout_secs: default_inactivity_secs(),
            tokens: HashMap::new(),
        }
    }
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            listen_addr: default_relay_listen(),
            advertise_addr: None,
            host: false,
            node_cap: None,
            session_cap: None,
            idle_timeout_secs: default_idle_timeout_secs(),
            pairing_timeout_secs: default_pairing_timeout_secs(),
            max_sessions: default_max_sessions(),
            bandwidth_mbps: default_bandwidth_mbps(),
        }
    }
}

impl Default for SelectorSection {
    fn default() -> Self {
        Self {
            load_weight: default_load_weight(),
            latency_weight: default_latency_weight(),
            bandwidth_weight: default_bandwidth_weight(),
            stale_after_secs: default_stale_after_secs(),
            random: false,
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("pierce/config.toml")
    }

    /// Load configuration from the default path, or use defaults when absent
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.node.id.trim().is_empty() || self.node.id.contains(char::is_whitespace) {
            anyhow::bail!("Node id '{}' must be non-empty and contain no whitespace", self.node.id);
        }
        if !(self.node.coordinator_url.starts_with("ws://") || self.node.coordinator_url.starts_with("wss://")) {
            anyhow::bail!(
                "Coordinator URL '{}' must start with ws:// or wss://",
                self.node.coordinator_url
            );
        }

        self.reflectors()?;
        self.signaling_listen()?;
        self.relay_listen()?;
        self.relay_advertise()?;
        if let Some(bind) = &self.nat.reflector_bind {
            parse_addr(bind, "Reflector bind address")?;
        }

        if self.nat.stun_timeout_ms == 0 || self.nat.punch_timeout_secs == 0 || self.nat.retry_interval_ms == 0 {
            anyhow::bail!("NAT timeouts and retry interval must be non-zero");
        }
        if self.signaling.keepalive_secs == 0 || self.signaling.send_queue == 0 {
            anyhow::bail!("Signaling keepalive and send queue must be non-zero");
        }
        if self.signaling.reconnect_initial_ms > self.signaling.reconnect_max_secs * 1000 {
            anyhow::bail!("Initial reconnect delay exceeds the reconnect ceiling");
        }
        if self.relay.node_cap == Some(0) || self.relay.session_cap == Some(0) {
            anyhow::bail!("Bandwidth caps must be positive when set");
        }
        if self.relay.max_sessions == 0 {
            anyhow::bail!("Relay max_sessions must be at least 1");
        }

        let weights = [
            self.selector.load_weight,
            self.selector.latency_weight,
            self.selector.bandwidth_weight,
        ];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            anyhow::bail!("Selector weights must be finite and non-negative");
        }
        if weights.iter().all(|w| *w == 0.0) {
            anyhow::bail!("At least one selector weight must be positive");
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }

    /// Parsed reflector list
    ///
    /// # Errors
    ///
    /// Returns an error if an entry is not `ip:port`.
    pub fn reflectors(&self) -> anyhow::Result<Vec<SocketAddr>> {
        self.nat
            .reflectors
            .iter()
            .map(|r| parse_addr(r, "Reflector"))
            .collect()
    }

    /// Coordinator listen address
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn signaling_listen(&self) -> anyhow::Result<SocketAddr> {
        parse_addr(&self.signaling.listen_addr, "Signaling listen address")
    }

    /// Relay listen address
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn relay_listen(&self) -> anyhow::Result<SocketAddr> {
        parse_addr(&self.relay.listen_addr, "Relay listen address")
    }

    /// Relay address advertised to peers, if configured
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn relay_advertise(&self) -> anyhow::Result<Option<SocketAddr>> {
        self.relay
            .advertise_addr
            .as_deref()
            .map(|a| parse_addr(a, "Relay advertise address"))
            .transpose()
    }

    /// Relay service settings
    #[must_use]
    pub fn relay_service(&self) -> RelayServiceConfig {
        RelayServiceConfig {
            relay_id: self.node.id.clone(),
            pairing_timeout: Duration::from_secs(self.relay.pairing_timeout_secs),
            idle_timeout: Duration::from_secs(self.relay.idle_timeout_secs),
            caps: BandwidthCaps {
                node: self.relay.node_cap,
                session: self.relay.session_cap,
            },
            max_sessions: self.relay.max_sessions,
            ..RelayServiceConfig::default()
        }
    }

    /// Coordinator settings
    #[must_use]
    pub fn coordinator(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            node_id: self.node.id.clone(),
            inactivity_timeout: Duration::from_secs(self.signaling.inactivity_timeout_secs),
            peer_queue: self.signaling.send_queue,
            selector: SelectorConfig {
                weights: ScoreWeights {
                    load: self.selector.load_weight,
                    latency: self.selector.latency_weight,
                    bandwidth: self.selector.bandwidth_weight,
                },
                stale_after: Duration::from_secs(self.selector.stale_after_secs),
                ..SelectorConfig::default()
            },
            random_relay_selection: self.selector.random,
            colocated_bandwidth_mbps: self.relay.bandwidth_mbps,
            ..CoordinatorConfig::default()
        }
    }

    /// Peer client settings
    ///
    /// # Errors
    ///
    /// Returns an error if an address cannot be parsed.
    pub fn client(&self) -> anyhow::Result<ClientConfig> {
        let mut config = ClientConfig::new(self.node.coordinator_url.clone(), self.node.id.clone());
        config.signaling.keepalive = Duration::from_secs(self.signaling.keepalive_secs);
        config.signaling.reconnect_initial = Duration::from_millis(self.signaling.reconnect_initial_ms);
        config.signaling.reconnect_max = Duration::from_secs(self.signaling.reconnect_max_secs);
        config.signaling.send_queue = self.signaling.send_queue;
        config.signaling.auth_token = self.node.auth_token.clone();
        config.classifier = ClassifierConfig {
            reflectors: self.reflectors()?,
            timeout: Duration::from_millis(self.nat.stun_timeout_ms),
            local_port: self.nat.punch_port,
            probe_filtering: self.nat.probe_filtering,
        };
        config.punch = PunchConfig {
            local_port: self.nat.punch_port,
            retry_interval: Duration::from_millis(self.nat.retry_interval_ms),
            max_retries: self.nat.max_retries,
            timeout: Duration::from_secs(self.nat.punch_timeout_secs),
            enable_tcp: self.nat.enable_tcp,
        };
        if self.relay.host {
            config.hosted_relay = Some(HostedRelayConfig {
                listen: self.relay_listen()?,
                advertised_port: self.relay_advertise()?.map(|a| a.port()),
                service: self.relay_service(),
                bandwidth_mbps: self.relay.bandwidth_mbps,
            });
        }
        Ok(config)
    }
}

fn parse_addr(addr: &str, name: &str) -> anyhow::Result<SocketAddr> {
    let parsed: SocketAddr = addr
        .parse()
        .map_err(|_| anyhow::anyhow!("{} '{}' is not a valid ip:port", name, addr))?;
    Ok(parsed)
}
