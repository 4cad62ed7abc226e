//! NAT Classification
//!
//! Determines the external address and NAT behavior class by probing STUN
//! reflectors from the local punch port:
//!
//! 1. Binding request to the first reflector that answers. A public local IP
//!    equal to the mapped IP means there is no NAT.
//! 2. Binding request to a second reflector from the same socket. A different
//!    mapping per destination means Symmetric NAT.
//! 3. Filtering probes with CHANGE-REQUEST against the first reflector: an
//!    answer from another IP means Full Cone, an answer from another port means
//!    Restricted Cone, silence on both means Port Restricted Cone. A reflector
//!    that ignores CHANGE-REQUEST gives no filtering information and the result
//!    stays at Restricted Cone.
//!
//! Malformed replies are discarded, never interpreted.

use crate::socket::{bind_udp_reuse, outbound_ip, unspecified_for};
use crate::stun::{CHANGE_IP, CHANGE_PORT, StunClient, StunError};
use crate::types::{NatClass, is_public_ip};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;

/// NAT classification error
#[derive(Debug, Error)]
pub enum NatError {
    /// No reflectors configured
    #[error("No STUN reflectors configured")]
    NoReflectors,
    /// No reflector produced a usable mapping
    #[error("Classification failed: {0}")]
    ClassificationFailed(#[source] StunError),
    /// Local socket setup failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NatError {
    /// Whether retrying (later, or with other reflectors) may help
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ClassificationFailed(_))
    }
}

/// Classifier configuration
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    /// Reflector addresses, tried in order
    pub reflectors: Vec<SocketAddr>,
    /// Per-exchange timeout
    pub timeout: Duration,
    /// Local port to classify from; must match the punch port (0 = ephemeral)
    pub local_port: u16,
    /// Run the CHANGE-REQUEST filtering probes
    pub probe_filtering: bool,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            reflectors: Vec::new(),
            timeout: Duration::from_secs(3),
            local_port: 0,
            probe_filtering: true,
        }
    }
}

/// Outcome of a classification run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    /// Behavior class
    pub nat_class: NatClass,
    /// Externally mapped address reported by the first reflector
    pub external_addr: SocketAddr,
    /// Local address the probes were sent from
    pub local_addr: SocketAddr,
}

/// Reply observed for a CHANGE-REQUEST probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterProbe {
    /// Answered from a different IP than the one queried
    OtherIp,
    /// Answered from the same IP but a different port
    OtherPort,
    /// Answered from the queried address; the request was ignored
    SameSource,
    /// No valid answer before the timeout
    NoReply,
}

impl FilterProbe {
    fn observe(reflector: SocketAddr, responder: Option<SocketAddr>) -> Self {
        match responder {
            None => Self::NoReply,
            Some(from) if from.ip() != reflector.ip() => Self::OtherIp,
            Some(from) if from.port() != reflector.port() => Self::OtherPort,
            Some(_) => Self::SameSource,
        }
    }
}

/// Everything the decision needs, gathered from the network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observations {
    /// IP of the interface the probes left through
    pub local_ip: IpAddr,
    /// Mapping reported by the first reflector
    pub first: SocketAddr,
    /// Mapping reported by a second reflector, when one answered
    pub second: Option<SocketAddr>,
    /// Reply to CHANGE-REQUEST(change IP + port)
    pub change_both: Option<FilterProbe>,
    /// Reply to CHANGE-REQUEST(change port)
    pub change_port: Option<FilterProbe>,
}

/// Map observations to a NAT class
#[must_use]
pub fn decide(obs: &Observations) -> NatClass {
    if is_public_ip(&obs.local_ip) && obs.local_ip == obs.first.ip() {
        return NatClass::None;
    }
    if let Some(second) = obs.second {
        if second != obs.first {
            return NatClass::Symmetric;
        }
    }
    match (obs.change_both, obs.change_port) {
        (Some(FilterProbe::OtherIp), _) => NatClass::FullCone,
        (_, Some(FilterProbe::OtherPort | FilterProbe::OtherIp)) => NatClass::RestrictedCone,
        (Some(FilterProbe::NoReply), Some(FilterProbe::NoReply)) => NatClass::PortRestrictedCone,
        _ => NatClass::RestrictedCone,
    }
}

/// NAT classifier
#[derive(Debug, Clone)]
pub struct NatClassifier {
    config: ClassifierConfig,
}

impl NatClassifier {
    /// Create a classifier
    #[must_use]
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    /// Classify from a fresh socket on the configured local port
    ///
    /// The socket is closed before returning so that the punch path can bind
    /// the same port.
    ///
    /// # Errors
    ///
    /// Returns `NatError` if no reflectors are configured, the socket cannot
    /// be bound, or no reflector returns a valid mapping.
    pub async fn classify(&self) -> Result<Classification, NatError> {
        let first = self.config.reflectors.first().ok_or(NatError::NoReflectors)?;
        let socket = bind_udp_reuse(unspecified_for(*first, self.config.local_port))?;
        self.classify_on(&socket).await
    }

    /// Classify using an existing socket
    ///
    /// # Errors
    ///
    /// Same as [`NatClassifier::classify`].
    pub async fn classify_on(&self, socket: &UdpSocket) -> Result<Classification, NatError> {
        if self.config.reflectors.is_empty() {
            return Err(NatError::NoReflectors);
        }
        let client = StunClient::new(socket, self.config.timeout);
        let mut local_addr = socket.local_addr()?;

        // Test 1: first reflector that yields a valid mapping
        let mut last_error = StunError::Timeout;
        let mut primary = None;
        for (index, reflector) in self.config.reflectors.iter().enumerate() {
            match client.get_mapped_address(*reflector).await {
                Ok(mapped) => {
                    primary = Some((index, *reflector, mapped));
                    break;
                }
                Err(e) => {
                    tracing::warn!("Reflector {} failed: {}", reflector, e);
                    last_error = e;
                }
            }
        }
        let (index, reflector, first) = primary.ok_or(NatError::ClassificationFailed(last_error))?;

        let local_ip = if local_addr.ip().is_unspecified() {
            outbound_ip(reflector).await.unwrap_or(local_addr.ip())
        } else {
            local_addr.ip()
        };
        local_addr.set_ip(local_ip);

        let mut obs = Observations {
            local_ip,
            first,
            second: None,
            change_both: None,
            change_port: None,
        };

        if decide(&obs) != NatClass::None {
            // Test 2: mapping stability across destinations
            for other in &self.config.reflectors[index + 1..] {
                if other.ip() == reflector.ip() {
                    continue;
                }
                match client.get_mapped_address(*other).await {
                    Ok(mapped) => {
                        obs.second = Some(mapped);
                        break;
                    }
                    Err(e) => tracing::debug!("Second reflector {} failed: {}", other, e),
                }
            }

            // Test 3: filtering behavior
            if self.config.probe_filtering && obs.second.is_none_or(|m| m == first) {
                let both = client.binding(reflector, CHANGE_IP | CHANGE_PORT).await;
                let both = FilterProbe::observe(reflector, both.ok().map(|r| r.responder));
                obs.change_both = Some(both);
                if both == FilterProbe::NoReply {
                    let port = client.binding(reflector, CHANGE_PORT).await;
                    obs.change_port =
                        Some(FilterProbe::observe(reflector, port.ok().map(|r| r.responder)));
                }
            }
        }

        let nat_class = decide(&obs);
        tracing::info!(
            "NAT classified as {} (external {}, local {})",
            nat_class,
            first,
            local_addr
        );
        Ok(Classification {
            nat_class,
            external_addr: first,
            local_addr,
        })
    }
}

/// Classify from an ephemeral port
///
/// # Errors
///
/// See [`NatClassifier::classify`].
pub async fn classify(
    reflectors: &[SocketAddr],
    timeout: Duration,
) -> Result<(NatClass, SocketAddr), NatError> {
    let classifier = NatClassifier::new(ClassifierConfig {
        reflectors: reflectors.to_vec(),
        timeout,
        ..ClassifierConfig::default()
    });
    let classification = classifier.classify().await?;
    Ok((classification.nat_class, classification.external_addr))
}
