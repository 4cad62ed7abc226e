//! Gateway port mapping (UPnP / NAT-PMP)
//!
//! The gateway protocols themselves live outside this crate; the engine only
//! decides when a mapping is worth asking for and releases it when the
//! attempt ends.

use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Transport a mapping applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MappingProtocol {
    /// TCP
    Tcp,
    /// UDP
    Udp,
}

/// Port mapping errors
#[derive(Debug, Error)]
pub enum MapperError {
    /// No gateway supports port mapping
    #[error("port mapping unavailable")]
    Unavailable,
    /// The gateway refused the request
    #[error("gateway refused mapping: {0}")]
    Refused(String),
}

/// Gateway port-mapping capability
#[async_trait]
pub trait PortMapper: Send + Sync {
    /// Forward `external_port` on the gateway to `local_port` on this host
    ///
    /// Returns the external port actually mapped.
    async fn add_mapping(
        &self,
        protocol: MappingProtocol,
        local_port: u16,
        external_port: u16,
        lease: Duration,
    ) -> Result<u16, MapperError>;

    /// Remove a mapping added by [`add_mapping`](Self::add_mapping)
    async fn remove_mapping(&self, protocol: MappingProtocol, external_port: u16) -> Result<(), MapperError>;

    /// Gateway's public address
    async fn external_ip(&self) -> Result<IpAddr, MapperError>;
}

/// Mapper for hosts without a controllable gateway
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMapper;

#[async_trait]
impl PortMapper for NoopMapper {
    async fn add_mapping(
        &self,
        _protocol: MappingProtocol,
        _local_port: u16,
        _external_port: u16,
        _lease: Duration,
    ) -> Result<u16, MapperError> {
        Err(MapperError::Unavailable)
    }

    async fn remove_mapping(&self, _protocol: MappingProtocol, _external_port: u16) -> Result<(), MapperError> {
        Ok(())
    }

    async fn external_ip(&self) -> Result<IpAddr, MapperError> {
        Err(MapperError::Unavailable)
    }
}

/// A mapping held for the duration of one attempt
pub(crate) struct MappingLease {
    mapper: Arc<dyn PortMapper>,
    protocol: MappingProtocol,
    external_port: u16,
}

impl MappingLease {
    /// Ask `mapper` for a mapping; `None` when the gateway declines
    pub(crate) async fn acquire(
        mapper: &Arc<dyn PortMapper>,
        protocol: MappingProtocol,
        local_port: u16,
        external_port: u16,
        lease: Duration,
    ) -> Option<Self> {
        match mapper.add_mapping(protocol, local_port, external_port, lease).await {
            Ok(mapped) => {
                if mapped != external_port {
                    tracing::debug!("Gateway mapped {:?} {} to external {}", protocol, local_port, mapped);
                }
                tracing::info!("Port mapping {:?} {} -> {} added", protocol, mapped, local_port);
                Some(Self {
                    mapper: Arc::clone(mapper),
                    protocol,
                    external_port: mapped,
                })
            }
            Err(e) => {
                tracing::debug!("No port mapping for {:?} {}: {}", protocol, local_port, e);
                None
            }
        }
    }

    /// Remove the mapping
    pub(crate) async fn release(self) {
        if let Err(e) = self.mapper.remove_mapping(self.protocol, self.external_port).await {
            tracing::warn!("Removing port mapping {:?} {} failed: {}", self.protocol, self.external_port, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Gateway that accepts everything and remembers what is mapped
    #[derive(Default)]
    struct RecordingMapper {
        mapped: Mutex<Vec<(MappingProtocol, u16)>>,
    }

    #[async_trait]
    impl PortMapper for RecordingMapper {
        async fn add_mapping(
            &self,
            protocol: MappingProtocol,
            _local_port: u16,
            external_port: u16,
            _lease: Duration,
        ) -> Result<u16, MapperError> {
            self.mapped.lock().unwrap().push((protocol, external_port));
            Ok(external_port)
        }

        async fn remove_mapping(&self, protocol: MappingProtocol, external_port: u16) -> Result<(), MapperError> {
            self.mapped
                .lock()
                .unwrap()
                .retain(|m| *m != (protocol, external_port));
            Ok(())
        }

        async fn external_ip(&self) -> Result<IpAddr, MapperError> {
            Ok("198.51.100.77".parse().unwrap())
        }
    }

    #[tokio::test]
    async fn test_noop_mapper_declines() {
        let mapper: Arc<dyn PortMapper> = Arc::new(NoopMapper);
        assert!(
            MappingLease::acquire(&mapper, MappingProtocol::Tcp, 4000, 4000, Duration::from_secs(60))
                .await
                .is_none()
        );
        assert!(matches!(mapper.external_ip().await, Err(MapperError::Unavailable)));
    }

    #[tokio::test]
    async fn test_lease_release_removes_mapping() {
        let recording = Arc::new(RecordingMapper::default());
        let mapper: Arc<dyn PortMapper> = recording.clone();
        let lease = MappingLease::acquire(&mapper, MappingProtocol::Tcp, 4000, 41000, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(*recording.mapped.lock().unwrap(), vec![(MappingProtocol::Tcp, 41000)]);
        lease.release().await;
        assert!(recording.mapped.lock().unwrap().is_empty());
    }
}
