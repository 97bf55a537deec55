//! Server configuration.
//!
//! A plain struct with builder-style setters; `Default` gives a usable
//! local setup (ephemeral ports, no registry registration). Deployments
//! that keep settings in a file can load them with
//! [`ServerConfig::from_json`].

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::error::{Result, RpcError};
use crate::pool::{DEFAULT_LARGE_PACKET_SIZE, DEFAULT_PACKET_CEILING, DEFAULT_SMALL_PACKET_SIZE};
use crate::portmap::PORTMAP_PORT;
use crate::worker::{DEFAULT_WORKERS, MAX_WORKERS, MIN_WORKERS};

/// Startup configuration for an [`RpcServer`](crate::server::RpcServer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind both listeners to.
    pub bind_addr: IpAddr,
    /// TCP listening port; 0 picks an ephemeral port.
    pub tcp_port: u16,
    /// UDP listening port; 0 picks an ephemeral port.
    pub udp_port: u16,
    /// Largest message accepted on either transport.
    pub max_message_size: usize,
    /// Worker count; 0 selects inline (zero-worker) mode, anything
    /// else is clamped to `[min_workers, max_workers]`.
    pub workers: usize,
    /// Lower clamp for the worker count.
    pub min_workers: usize,
    /// Upper clamp for the worker count.
    pub max_workers: usize,
    /// Message capacity of small pooled packets.
    pub small_packet_size: usize,
    /// Message capacity of large pooled packets.
    pub large_packet_size: usize,
    /// Small-class allocation ceiling; `None` = unbounded.
    pub small_packet_ceiling: Option<usize>,
    /// Large-class allocation ceiling; `None` = unbounded.
    pub large_packet_ceiling: Option<usize>,
    /// Whether to advertise port mappings to the registry at startup.
    pub register_port_mappings: bool,
    /// The port-mapping registry address.
    pub registry_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            tcp_port: 0,
            udp_port: 0,
            max_message_size: DEFAULT_LARGE_PACKET_SIZE,
            workers: DEFAULT_WORKERS,
            min_workers: MIN_WORKERS,
            max_workers: MAX_WORKERS,
            small_packet_size: DEFAULT_SMALL_PACKET_SIZE,
            large_packet_size: DEFAULT_LARGE_PACKET_SIZE,
            small_packet_ceiling: Some(DEFAULT_PACKET_CEILING),
            large_packet_ceiling: Some(DEFAULT_PACKET_CEILING),
            register_port_mappings: false,
            registry_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), PORTMAP_PORT),
        }
    }
}

impl ServerConfig {
    /// Set the bind address.
    pub fn bind_addr(mut self, addr: IpAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the TCP port.
    pub fn tcp_port(mut self, port: u16) -> Self {
        self.tcp_port = port;
        self
    }

    /// Set the UDP port.
    pub fn udp_port(mut self, port: u16) -> Self {
        self.udp_port = port;
        self
    }

    /// Set the worker count (0 = inline mode).
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the maximum accepted message size.
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Set the pool geometry: class sizes and ceilings.
    pub fn packet_pool(
        mut self,
        small_size: usize,
        small_ceiling: Option<usize>,
        large_size: usize,
        large_ceiling: Option<usize>,
    ) -> Self {
        self.small_packet_size = small_size;
        self.small_packet_ceiling = small_ceiling;
        self.large_packet_size = large_size;
        self.large_packet_ceiling = large_ceiling;
        self
    }

    /// Enable registry registration against `registry`.
    pub fn register_with(mut self, registry: SocketAddr) -> Self {
        self.register_port_mappings = true;
        self.registry_addr = registry;
        self
    }

    /// Load a configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject geometries the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.small_packet_size == 0 {
            return Err(RpcError::InvalidConfig(
                "small packet size must be non-zero".to_string(),
            ));
        }
        if self.small_packet_size >= self.large_packet_size {
            return Err(RpcError::InvalidConfig(format!(
                "small packet size {} must be below large packet size {}",
                self.small_packet_size, self.large_packet_size
            )));
        }
        if self.max_message_size > self.large_packet_size {
            return Err(RpcError::InvalidConfig(format!(
                "max message size {} exceeds large packet size {}",
                self.max_message_size, self.large_packet_size
            )));
        }
        if self.min_workers > self.max_workers {
            return Err(RpcError::InvalidConfig(format!(
                "worker clamp range [{}, {}] is inverted",
                self.min_workers, self.max_workers
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        ServerConfig::default().validate().unwrap();
    }

    #[test]
    fn test_builder_style_setters() {
        let config = ServerConfig::default()
            .tcp_port(2049)
            .udp_port(2049)
            .workers(4)
            .max_message_size(32768)
            .packet_pool(1024, Some(10), 32768, None)
            .register_with("10.0.0.1:111".parse().unwrap());

        assert_eq!(config.tcp_port, 2049);
        assert_eq!(config.workers, 4);
        assert_eq!(config.small_packet_size, 1024);
        assert_eq!(config.large_packet_ceiling, None);
        assert!(config.register_port_mappings);
        config.validate().unwrap();
    }

    #[test]
    fn test_json_roundtrip() {
        let config = ServerConfig::default().tcp_port(2049).workers(2);
        let json = serde_json::to_string(&config).unwrap();
        let loaded = ServerConfig::from_json(&json).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let loaded = ServerConfig::from_json(r#"{"tcp_port": 3049}"#).unwrap();
        assert_eq!(loaded.tcp_port, 3049);
        assert_eq!(loaded.workers, DEFAULT_WORKERS);
    }

    #[test]
    fn test_inverted_pool_geometry_rejected() {
        let config = ServerConfig::default().packet_pool(65536, None, 512, None);
        assert!(matches!(
            config.validate(),
            Err(RpcError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_oversized_message_limit_rejected() {
        let mut config = ServerConfig::default();
        config.max_message_size = config.large_packet_size + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_small_size_rejected() {
        let mut config = ServerConfig::default();
        config.small_packet_size = 0;
        assert!(config.validate().is_err());
    }
}
