//! The request-processor plug point.
//!
//! The dispatch engine decodes and screens calls; everything
//! program-specific (procedure semantics, result encoding) lives behind
//! [`RpcProcessor`]. Implementations typically call
//! [`position_at_parameters`](crate::protocol::RpcPacket::position_at_parameters),
//! decode their arguments, then rewrite the packet as a reply with
//! [`build_reply_header`](crate::protocol::RpcPacket::build_reply_header)
//! and append results.

use async_trait::async_trait;

use crate::error::Result;
use crate::protocol::RpcPacket;
use crate::transport::ClientEndpoint;

/// Processes one decoded call and produces the reply, if any.
#[async_trait]
pub trait RpcProcessor: Send + Sync {
    /// Called once per decoded request.
    ///
    /// The processor owns the request packet and may reuse its buffer
    /// for the reply (the common case) or allocate a different packet.
    /// Returning `None` sends nothing; every packet involved finds its
    /// way back to its pool when dropped. An error is logged by the
    /// worker and the request is dropped without a reply, so one bad
    /// request never stalls the service.
    async fn process(
        &self,
        packet: RpcPacket,
        endpoint: &ClientEndpoint,
    ) -> Result<Option<RpcPacket>>;
}

/// A program this server answers for, used to screen calls before the
/// processor runs: unknown programs get ProgUnavail, known programs at
/// an unsupported version get ProgMismatch with this version range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcProgram {
    /// Program id.
    pub program: u32,
    /// Lowest supported program version.
    pub low_version: u32,
    /// Highest supported program version.
    pub high_version: u32,
}

impl RpcProgram {
    /// A program supported at exactly one version.
    pub fn single(program: u32, version: u32) -> Self {
        Self {
            program,
            low_version: version,
            high_version: version,
        }
    }
}
