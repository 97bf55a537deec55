//! Error types for rpcwire.

use thiserror::Error;

/// Main error type for all rpcwire operations.
#[derive(Debug, Error)]
pub enum RpcError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed wire data: bad fragment length, short message,
    /// or a field that would overrun the packet buffer.
    #[error("Framing error: {0}")]
    Framing(String),

    /// The caller spoke an RPC version other than 2.
    #[error("RPC version mismatch (supported {low}..={high})")]
    VersionMismatch {
        /// Lowest supported RPC version.
        low: u32,
        /// Highest supported RPC version.
        high: u32,
    },

    /// Authentication rejected; carries the `auth_status` sub-code
    /// that goes into the denied reply.
    #[error("Authentication failure (status {0})")]
    AuthFailure(u32),

    /// A blocking pool allocation was cancelled before a packet
    /// became available. Transient, not a protocol error.
    #[error("Packet allocation cancelled")]
    PoolCancelled,

    /// Requested packet size exceeds the largest pool class.
    #[error("Requested packet size {0} exceeds pool maximum {1}")]
    PacketTooLarge(usize, usize),

    /// Peer closed the connection or the reply channel is gone.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Port-mapper registration failed. Fatal at server startup.
    #[error("Port mapper registration failed: {0}")]
    Registration(String),

    /// Invalid server configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// JSON error while loading a configuration file.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias using RpcError.
pub type Result<T> = std::result::Result<T, RpcError>;
