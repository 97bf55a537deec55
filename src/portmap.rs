//! Port-mapper records and the minimal outbound client.
//!
//! A server advertises its (program, version, transport, port) tuples
//! to the host's port-mapping registry (program 100000, version 2) at
//! startup and withdraws them at shutdown. The client here is as small
//! as that job: one TCP connection, one write, one blocking read per
//! mapping. No pooling, no retry; a failed registration is surfaced to
//! the caller, which treats it as fatal at startup.

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{Result, RpcError};
use crate::protocol::wire::{
    accept_status, auth_flavor, msg_type, reject_status, reply_state, FRAGMENT_LENGTH_MASK,
    LAST_FRAGMENT,
};
use crate::protocol::RpcPacket;
use crate::transport::Transport;

/// Port-mapper program id.
pub const PORTMAP_PROGRAM: u32 = 100000;

/// Port-mapper program version.
pub const PORTMAP_VERSION: u32 = 2;

/// Well-known port-mapper port.
pub const PORTMAP_PORT: u16 = 111;

/// SET procedure: register a mapping.
pub const PROC_SET: u32 = 1;

/// UNSET procedure: withdraw a mapping.
pub const PROC_UNSET: u32 = 2;

/// Largest reply the client will accept from the registry.
const MAX_REPLY_SIZE: usize = 1024;

/// One (program, version, transport, port) registration record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    /// Program id being advertised.
    pub program: u32,
    /// Program version being advertised.
    pub version: u32,
    /// Transport the program listens on.
    pub transport: Transport,
    /// Listening port.
    pub port: u16,
}

impl PortMapping {
    /// Create a mapping record.
    pub fn new(program: u32, version: u32, transport: Transport, port: u16) -> Self {
        Self {
            program,
            version,
            transport,
            port,
        }
    }

    /// Pack the four mapping words as SET/UNSET arguments.
    pub(crate) fn pack(&self, pkt: &mut RpcPacket) -> Result<()> {
        pkt.put_u32(self.program)?;
        pkt.put_u32(self.version)?;
        pkt.put_u32(self.transport.id())?;
        pkt.put_u32(self.port as u32)?;
        Ok(())
    }
}

/// Minimal synchronous request/response client for the registry.
pub struct PortMapperClient {
    registry: SocketAddr,
}

impl PortMapperClient {
    /// Client for the registry at `registry`.
    pub fn new(registry: SocketAddr) -> Self {
        Self { registry }
    }

    /// Register one mapping. `Ok(false)` means the registry refused it.
    pub async fn register(&self, mapping: &PortMapping) -> Result<bool> {
        self.call(PROC_SET, mapping).await
    }

    /// Withdraw one mapping.
    pub async fn unregister(&self, mapping: &PortMapping) -> Result<bool> {
        self.call(PROC_UNSET, mapping).await
    }

    async fn call(&self, procedure: u32, mapping: &PortMapping) -> Result<bool> {
        let mut stream = TcpStream::connect(self.registry).await?;

        let mut pkt = RpcPacket::new(128);
        let xid = pkt.build_call_header(
            PORTMAP_PROGRAM,
            PORTMAP_VERSION,
            procedure,
            auth_flavor::AUTH_NULL,
            &[],
            auth_flavor::AUTH_NULL,
            &[],
        )?;
        mapping.pack(&mut pkt)?;

        pkt.write_fragment_header(LAST_FRAGMENT | pkt.message_len() as u32);
        stream.write_all(pkt.frame()).await?;
        stream.flush().await?;

        let mut reply = read_reply(&mut stream).await?;
        decode_set_reply(&mut reply, xid)
    }
}

/// One blocking read of a single-fragment reply.
async fn read_reply(stream: &mut TcpStream) -> Result<RpcPacket> {
    let mut word = [0u8; 4];
    stream.read_exact(&mut word).await?;
    let word = u32::from_be_bytes(word);

    if word & LAST_FRAGMENT == 0 {
        return Err(RpcError::Framing(
            "registry sent a multi-fragment reply".to_string(),
        ));
    }
    let len = (word & FRAGMENT_LENGTH_MASK) as usize;
    if len > MAX_REPLY_SIZE {
        return Err(RpcError::Framing(format!(
            "registry reply of {} bytes exceeds maximum {}",
            len, MAX_REPLY_SIZE
        )));
    }

    let mut reply = RpcPacket::new(len);
    stream
        .read_exact(
            &mut reply.buf_mut()[RpcPacket::HEADER_RESERVE..RpcPacket::HEADER_RESERVE + len],
        )
        .await?;
    reply.set_end(RpcPacket::HEADER_RESERVE + len);
    reply.set_read_pos(RpcPacket::HEADER_RESERVE);
    Ok(reply)
}

/// Walk an accepted SET/UNSET reply down to its boolean result.
fn decode_set_reply(reply: &mut RpcPacket, expect_xid: u32) -> Result<bool> {
    let xid = reply.get_u32()?;
    if xid != expect_xid {
        return Err(RpcError::Registration(format!(
            "reply XID {:#x} does not match call XID {:#x}",
            xid, expect_xid
        )));
    }
    if reply.get_u32()? != msg_type::REPLY {
        return Err(RpcError::Registration("registry sent a non-reply".to_string()));
    }
    if reply.get_u32()? != reply_state::ACCEPTED {
        let reject = reply.get_u32()?;
        if reject == reject_status::RPC_MISMATCH {
            let low = reply.get_u32()?;
            let high = reply.get_u32()?;
            return Err(RpcError::VersionMismatch { low, high });
        }
        if reject == reject_status::AUTH_ERROR {
            return Err(RpcError::AuthFailure(reply.get_u32()?));
        }
        return Err(RpcError::Registration(format!(
            "registry denied the call (reject status {})",
            reject
        )));
    }

    // Skip the verifier.
    let _verf_type = reply.get_u32()?;
    let verf_len = reply.get_u32()? as usize;
    reply.skip(verf_len + crate::protocol::pad4(verf_len))?;

    let status = reply.get_u32()?;
    if status != accept_status::SUCCESS {
        return Err(RpcError::Registration(format!(
            "registry returned accept status {}",
            status
        )));
    }
    Ok(reply.get_u32()? != 0)
}
