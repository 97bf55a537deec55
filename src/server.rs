//! Server assembly: pool + queue + workers + both session layers.
//!
//! [`RpcServer::builder`] wires a [`ServerConfig`], an [`RpcProcessor`]
//! and an [`RpcAuthenticator`] into a running server. With a non-zero
//! worker count both transports feed one shared request queue drained
//! by the worker pool; with zero workers each I/O task processes its
//! requests inline.
//!
//! # Example
//!
//! ```ignore
//! let server = RpcServer::builder(ServerConfig::default())
//!     .processor(Arc::new(MyProcessor))
//!     .program(RpcProgram::single(100005, 1))
//!     .start()
//!     .await?;
//! // ...
//! server.shutdown().await;
//! ```

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::auth::{NullAuthenticator, RpcAuthenticator};
use crate::config::ServerConfig;
use crate::error::{Result, RpcError};
use crate::pool::PacketPool;
use crate::portmap::{PortMapperClient, PortMapping};
use crate::processor::{RpcProcessor, RpcProgram};
use crate::queue::RequestQueue;
use crate::transport::{RpcMessage, TcpSessionHandler, Transport, UdpDatagramHandler};
use crate::worker::{Dispatch, RequestHandler, WorkerPool};

/// Builder for [`RpcServer`].
pub struct RpcServerBuilder {
    config: ServerConfig,
    processor: Option<Arc<dyn RpcProcessor>>,
    authenticator: Arc<dyn RpcAuthenticator>,
    programs: Vec<RpcProgram>,
}

impl RpcServerBuilder {
    /// Start building a server around `config`.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            processor: None,
            authenticator: Arc::new(NullAuthenticator),
            programs: Vec::new(),
        }
    }

    /// Install the request processor (required).
    pub fn processor(mut self, processor: Arc<dyn RpcProcessor>) -> Self {
        self.processor = Some(processor);
        self
    }

    /// Install an authenticator (defaults to [`NullAuthenticator`]).
    pub fn authenticator(mut self, authenticator: Arc<dyn RpcAuthenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    /// Add a program this server answers for. Programs are screened
    /// before the processor runs and advertised to the registry when
    /// registration is enabled.
    pub fn program(mut self, program: RpcProgram) -> Self {
        self.programs.push(program);
        self
    }

    /// Validate, bind, spawn, and (optionally) register.
    pub async fn start(self) -> Result<RpcServer> {
        let Self {
            config,
            processor,
            authenticator,
            programs,
        } = self;

        config.validate()?;
        let processor = processor.ok_or_else(|| {
            RpcError::InvalidConfig("a request processor must be installed".to_string())
        })?;

        let token = CancellationToken::new();
        let pool = Arc::new(PacketPool::new(
            config.small_packet_size,
            config.small_packet_ceiling,
            config.large_packet_size,
            config.large_packet_ceiling,
        ));
        let handler = Arc::new(RequestHandler::new(
            processor,
            authenticator,
            programs.clone(),
        ));

        // Zero workers = inline mode on the I/O tasks.
        let (dispatch, queue, workers) = if config.workers == 0 {
            (Dispatch::Inline(handler), None, None)
        } else {
            let queue = Arc::new(RequestQueue::<RpcMessage>::new());
            let workers = WorkerPool::spawn(
                config.workers.clamp(config.min_workers, config.max_workers),
                queue.clone(),
                handler,
                &token,
            );
            (Dispatch::Queued(queue.clone()), Some(queue), Some(workers))
        };

        let tcp = TcpSessionHandler::bind(
            (config.bind_addr, config.tcp_port).into(),
            pool.clone(),
            dispatch.clone(),
            config.max_message_size,
            &token,
        )
        .await?;
        let udp = UdpDatagramHandler::bind(
            (config.bind_addr, config.udp_port).into(),
            pool.clone(),
            dispatch,
            config.max_message_size,
            &token,
        )
        .await?;

        let mut server = RpcServer {
            token,
            pool,
            queue,
            workers,
            tcp: Some(tcp),
            udp: Some(udp),
            registry: None,
            mappings: Vec::new(),
        };

        if config.register_port_mappings {
            let registry = PortMapperClient::new(config.registry_addr);
            let mappings = server.build_mappings(&programs);
            for mapping in &mappings {
                match registry.register(mapping).await {
                    Ok(true) => {
                        tracing::debug!(?mapping, "port mapping registered");
                    }
                    Ok(false) => {
                        server.teardown().await;
                        return Err(RpcError::Registration(format!(
                            "registry refused mapping {:?}",
                            mapping
                        )));
                    }
                    Err(e) => {
                        server.teardown().await;
                        return Err(RpcError::Registration(e.to_string()));
                    }
                }
            }
            server.registry = Some(registry);
            server.mappings = mappings;
        }

        tracing::debug!(
            tcp = server.tcp_port(),
            udp = server.udp_port(),
            "RPC server started"
        );
        Ok(server)
    }
}

/// A running ONC/RPC server.
pub struct RpcServer {
    token: CancellationToken,
    pool: Arc<PacketPool>,
    queue: Option<Arc<RequestQueue<RpcMessage>>>,
    workers: Option<WorkerPool>,
    tcp: Option<TcpSessionHandler>,
    udp: Option<UdpDatagramHandler>,
    registry: Option<PortMapperClient>,
    mappings: Vec<PortMapping>,
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("tcp_port", &self.tcp_port())
            .field("udp_port", &self.udp_port())
            .field("mappings", &self.mappings.len())
            .finish_non_exhaustive()
    }
}

impl RpcServer {
    /// Start building a server.
    pub fn builder(config: ServerConfig) -> RpcServerBuilder {
        RpcServerBuilder::new(config)
    }

    /// The bound TCP port.
    pub fn tcp_port(&self) -> u16 {
        self.tcp.as_ref().map(|t| t.port()).unwrap_or(0)
    }

    /// The bound UDP port.
    pub fn udp_port(&self) -> u16 {
        self.udp.as_ref().map(|u| u.port()).unwrap_or(0)
    }

    /// The shared packet pool (diagnostics).
    pub fn pool(&self) -> &PacketPool {
        &self.pool
    }

    /// Advisory depth of the request queue; 0 in inline mode.
    pub fn queue_depth(&self) -> usize {
        self.queue.as_ref().map(|q| q.len()).unwrap_or(0)
    }

    fn build_mappings(&self, programs: &[RpcProgram]) -> Vec<PortMapping> {
        let mut mappings = Vec::new();
        for p in programs {
            for version in p.low_version..=p.high_version {
                mappings.push(PortMapping::new(
                    p.program,
                    version,
                    Transport::Udp,
                    self.udp_port(),
                ));
                mappings.push(PortMapping::new(
                    p.program,
                    version,
                    Transport::Tcp,
                    self.tcp_port(),
                ));
            }
        }
        mappings
    }

    async fn teardown(&mut self) {
        self.token.cancel();
        if let Some(tcp) = self.tcp.take() {
            tcp.shutdown().await;
        }
        if let Some(udp) = self.udp.take() {
            udp.shutdown().await;
        }
        if let Some(workers) = self.workers.take() {
            workers.shutdown().await;
        }
    }

    /// Withdraw registrations, stop accepting, and drain the workers.
    /// In-flight requests may be abandoned; their packets return to the
    /// pool as they are dropped.
    pub async fn shutdown(mut self) {
        if let Some(registry) = self.registry.take() {
            for mapping in &self.mappings {
                if let Err(e) = registry.unregister(mapping).await {
                    tracing::warn!(?mapping, "port mapping withdrawal failed: {}", e);
                }
            }
        }
        self.teardown().await;
        tracing::debug!("RPC server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RpcPacket;
    use crate::transport::ClientEndpoint;
    use async_trait::async_trait;

    struct NoopProcessor;

    #[async_trait]
    impl RpcProcessor for NoopProcessor {
        async fn process(
            &self,
            _packet: RpcPacket,
            _endpoint: &ClientEndpoint,
        ) -> Result<Option<RpcPacket>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_start_binds_ephemeral_ports() {
        let server = RpcServer::builder(ServerConfig::default())
            .processor(Arc::new(NoopProcessor))
            .start()
            .await
            .unwrap();

        assert_ne!(server.tcp_port(), 0);
        assert_ne!(server.udp_port(), 0);
        assert_eq!(server.queue_depth(), 0);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_missing_processor_is_a_config_error() {
        let err = RpcServer::builder(ServerConfig::default())
            .start()
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_unreachable_registry_aborts_startup() {
        let config = ServerConfig::default().register_with("127.0.0.1:1".parse().unwrap());
        let err = RpcServer::builder(config)
            .processor(Arc::new(NoopProcessor))
            .program(RpcProgram::single(100005, 1))
            .start()
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Registration(_)));
    }

    #[tokio::test]
    async fn test_inline_mode_starts_without_workers() {
        let server = RpcServer::builder(ServerConfig::default().workers(0))
            .processor(Arc::new(NoopProcessor))
            .start()
            .await
            .unwrap();
        assert_eq!(server.queue_depth(), 0);
        server.shutdown().await;
    }
}
