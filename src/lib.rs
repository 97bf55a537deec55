//! # rpcwire
//!
//! An ONC/RPC (RFC 5531) transport and dispatch engine. It accepts RPC
//! calls over TCP and UDP, frames and unframes the wire format, pools
//! fixed-size packet buffers, and fans requests out to a bounded pool
//! of workers that invoke a pluggable request processor.
//!
//! What it deliberately does not do: program semantics (NFS, MOUNT,
//! PORTMAP procedure bodies), persistence, credential validation, or
//! transport security. Those live behind the two plug points:
//!
//! - [`RpcProcessor`]: turns a decoded call into a reply packet
//! - [`RpcAuthenticator`]: maps call credentials to a session key
//!
//! ## Architecture
//!
//! ```text
//! TCP conns ──readers──┐                    ┌─► processor ─► reply sink ─► TCP writer
//!                      ├─► request queue ───┤     (N workers)
//! UDP socket ──recv────┘                    └─► processor ─► reply sink ─► UDP sender
//!        ▲                                                                    │
//!        └───────────────────── packet pool ◄─────────────────────────────────┘
//! ```
//!
//! Packets are borrowed from a two-class pool (small/large) and return
//! to it when dropped, wherever in the pipeline that happens. Within
//! one connection, concurrent requests may complete out of order; the
//! XID is the only correlation token.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use rpcwire::{RpcServer, ServerConfig, RpcProgram};
//!
//! #[tokio::main]
//! async fn main() -> rpcwire::Result<()> {
//!     let server = RpcServer::builder(ServerConfig::default().workers(8))
//!         .processor(Arc::new(MyProcessor))
//!         .program(RpcProgram::single(100005, 1))
//!         .start()
//!         .await?;
//!     // ... serve ...
//!     server.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod pool;
pub mod portmap;
pub mod processor;
pub mod protocol;
pub mod queue;
pub mod server;
pub mod transport;
pub mod worker;

pub use auth::{NullAuthenticator, RpcAuthenticator};
pub use config::ServerConfig;
pub use error::{Result, RpcError};
pub use pool::PacketPool;
pub use portmap::{PortMapperClient, PortMapping};
pub use processor::{RpcProcessor, RpcProgram};
pub use protocol::RpcPacket;
pub use server::{RpcServer, RpcServerBuilder};
pub use transport::{ClientEndpoint, Transport};
