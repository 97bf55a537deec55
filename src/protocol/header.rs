//! Call/reply header codec for [`RpcPacket`].
//!
//! Call layout (offsets relative to the start of the message):
//!
//! ```text
//! ┌──────┬─────────┬─────────┬──────┬──────┬──────┬───────────┬───────────┬────────┐
//! │ xid  │ msgType │ rpcVers │ prog │ vers │ proc │ credential│ verifier  │ params │
//! │  4   │    4    │    4    │  4   │  4   │  4   │ 8 + body  │ 8 + body  │  ...   │
//! └──────┴─────────┴─────────┴──────┴──────┴──────┴───────────┴───────────┴────────┘
//! ```
//!
//! Credential and verifier bodies are variable length, so the verifier
//! and parameter offsets are derived, never stored. Reply builders
//! rewrite the message in place from the message-type word on, keeping
//! the caller's XID and echoing the caller's verifier where the reply
//! shape carries one.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Result, RpcError};
use crate::protocol::packet::{pad4, RpcPacket};
use crate::protocol::wire::{
    accept_status, auth_flavor, msg_type, reject_status, reply_state, MAX_AUTH_BYTES, RPC_VERSION,
};

// Absolute buffer offsets (header reservation included).
const XID_OFFSET: usize = 4;
const MSG_TYPE_OFFSET: usize = 8;
const RPC_VERSION_OFFSET: usize = 12;
const PROGRAM_OFFSET: usize = 16;
const PROGRAM_VERSION_OFFSET: usize = 20;
const PROCEDURE_OFFSET: usize = 24;
const CREDENTIAL_TYPE_OFFSET: usize = 28;
const CREDENTIAL_LENGTH_OFFSET: usize = 32;
const CREDENTIAL_DATA_OFFSET: usize = 36;

/// Shortest well-formed call: fixed header words plus empty
/// credential and verifier.
const MIN_CALL_LEN: usize = 40;

/// Synthesize a transaction id from the wall clock.
///
/// Uniqueness is best-effort only: the value is a truncated mix of the
/// current time, and two calls in the same nanosecond (or after a clock
/// step) can collide. Callers must not treat the XID as a strict nonce;
/// it exists to correlate a Reply with its Call.
fn next_xid() -> u32 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    (nanos ^ (nanos >> 32)) as u32
}

impl RpcPacket {
    // ------------------------------------------------------------------
    // Call header accessors
    // ------------------------------------------------------------------

    /// Transaction id.
    pub fn xid(&self) -> Result<u32> {
        self.peek_u32_at(XID_OFFSET)
    }

    /// Message type: Call (0) or Reply (1).
    pub fn message_type(&self) -> Result<u32> {
        self.peek_u32_at(MSG_TYPE_OFFSET)
    }

    /// RPC protocol version claimed by the call.
    pub fn rpc_version(&self) -> Result<u32> {
        self.peek_u32_at(RPC_VERSION_OFFSET)
    }

    /// Program id.
    pub fn program_id(&self) -> Result<u32> {
        self.peek_u32_at(PROGRAM_OFFSET)
    }

    /// Program version.
    pub fn program_version(&self) -> Result<u32> {
        self.peek_u32_at(PROGRAM_VERSION_OFFSET)
    }

    /// Procedure id.
    pub fn procedure_id(&self) -> Result<u32> {
        self.peek_u32_at(PROCEDURE_OFFSET)
    }

    /// Credential flavor.
    pub fn credential_type(&self) -> Result<u32> {
        self.peek_u32_at(CREDENTIAL_TYPE_OFFSET)
    }

    /// Credential body length in bytes.
    pub fn credential_length(&self) -> Result<usize> {
        let len = self.peek_u32_at(CREDENTIAL_LENGTH_OFFSET)? as usize;
        if len > MAX_AUTH_BYTES {
            return Err(RpcError::Framing(format!(
                "credential length {} exceeds maximum {}",
                len, MAX_AUTH_BYTES
            )));
        }
        Ok(len)
    }

    /// Credential body bytes.
    pub fn credential(&self) -> Result<&[u8]> {
        let len = self.credential_length()?;
        if CREDENTIAL_DATA_OFFSET + len > self.end() {
            return Err(RpcError::Framing(
                "credential body overruns message end".to_string(),
            ));
        }
        Ok(&self.frame()[CREDENTIAL_DATA_OFFSET..CREDENTIAL_DATA_OFFSET + len])
    }

    /// Derived offset of the verifier (type word), past the padded
    /// credential body.
    pub fn verifier_offset(&self) -> Result<usize> {
        let cred_len = self.credential_length()?;
        Ok(CREDENTIAL_DATA_OFFSET + cred_len + pad4(cred_len))
    }

    /// Verifier flavor.
    pub fn verifier_type(&self) -> Result<u32> {
        self.peek_u32_at(self.verifier_offset()?)
    }

    /// Verifier body length in bytes.
    pub fn verifier_length(&self) -> Result<usize> {
        let len = self.peek_u32_at(self.verifier_offset()? + 4)? as usize;
        if len > MAX_AUTH_BYTES {
            return Err(RpcError::Framing(format!(
                "verifier length {} exceeds maximum {}",
                len, MAX_AUTH_BYTES
            )));
        }
        Ok(len)
    }

    /// Verifier body bytes.
    pub fn verifier(&self) -> Result<&[u8]> {
        let off = self.verifier_offset()? + 8;
        let len = self.verifier_length()?;
        if off + len > self.end() {
            return Err(RpcError::Framing(
                "verifier body overruns message end".to_string(),
            ));
        }
        Ok(&self.frame()[off..off + len])
    }

    /// Derived offset of the procedure parameters, past the padded
    /// verifier body.
    pub fn parameters_offset(&self) -> Result<usize> {
        let verf_len = self.verifier_length()?;
        Ok(self.verifier_offset()? + 8 + verf_len + pad4(verf_len))
    }

    /// Position the read cursor at the start of the procedure
    /// parameters.
    pub fn position_at_parameters(&mut self) -> Result<()> {
        let off = self.parameters_offset()?;
        self.set_read_pos(off);
        Ok(())
    }

    /// Structural validation of a received call: long enough for the
    /// fixed header, message type is Call, credential and verifier fit
    /// inside the message. Does not check the RPC version; a version
    /// mismatch gets its own synthesized reply rather than a framing
    /// error.
    pub fn validate_call(&self) -> Result<()> {
        if self.message_len() < MIN_CALL_LEN {
            return Err(RpcError::Framing(format!(
                "call message of {} bytes is shorter than minimum {}",
                self.message_len(),
                MIN_CALL_LEN
            )));
        }
        let mt = self.message_type()?;
        if mt != msg_type::CALL {
            return Err(RpcError::Framing(format!(
                "expected call message, got type {}",
                mt
            )));
        }
        let params = self.parameters_offset()?;
        if params > self.end() {
            return Err(RpcError::Framing(
                "credential/verifier overrun message end".to_string(),
            ));
        }
        Ok(())
    }

    /// Reply state of a received reply: Accepted (0) or Denied (1).
    pub fn reply_state(&self) -> Result<u32> {
        self.peek_u32_at(RPC_VERSION_OFFSET)
    }

    // ------------------------------------------------------------------
    // Builders
    // ------------------------------------------------------------------

    /// Write a full Call header and leave the write cursor at the
    /// parameter area. The XID is synthesized from the wall clock; see
    /// the module notes on its (weak) uniqueness.
    #[allow(clippy::too_many_arguments)]
    pub fn build_call_header(
        &mut self,
        program: u32,
        version: u32,
        procedure: u32,
        cred_type: u32,
        cred: &[u8],
        verf_type: u32,
        verf: &[u8],
    ) -> Result<u32> {
        self.reset();
        let xid = next_xid();
        self.put_u32(xid)?;
        self.put_u32(msg_type::CALL)?;
        self.put_u32(RPC_VERSION)?;
        self.put_u32(program)?;
        self.put_u32(version)?;
        self.put_u32(procedure)?;
        self.put_u32(cred_type)?;
        self.put_opaque(cred)?;
        self.put_u32(verf_type)?;
        self.put_opaque(verf)?;
        Ok(xid)
    }

    /// The originating call's verifier, or the null verifier when the
    /// call is too malformed to carry one.
    fn verifier_or_null(&self) -> (u32, Vec<u8>) {
        match (self.verifier_type(), self.verifier()) {
            (Ok(vt), Ok(body)) => (vt, body.to_vec()),
            _ => (auth_flavor::AUTH_NULL, Vec::new()),
        }
    }

    /// Rewrite this packet as an Accepted/Success reply, echoing the
    /// call's verifier. Leaves the write cursor at the results area so
    /// the processor can append result data.
    pub fn build_reply_header(&mut self) -> Result<()> {
        let (verf_type, verf) = self.verifier_or_null();
        self.set_write_pos(MSG_TYPE_OFFSET);
        self.put_u32(msg_type::REPLY)?;
        self.put_u32(reply_state::ACCEPTED)?;
        self.put_u32(verf_type)?;
        self.put_opaque(&verf)?;
        self.put_u32(accept_status::SUCCESS)?;
        self.set_end(self.write_pos());
        Ok(())
    }

    /// Rewrite this packet as an Accepted reply carrying the given
    /// accept status and no results.
    pub fn build_error_reply(&mut self, status: u32) -> Result<()> {
        let (verf_type, verf) = self.verifier_or_null();
        self.set_write_pos(MSG_TYPE_OFFSET);
        self.put_u32(msg_type::REPLY)?;
        self.put_u32(reply_state::ACCEPTED)?;
        self.put_u32(verf_type)?;
        self.put_opaque(&verf)?;
        self.put_u32(status)?;
        self.set_end(self.write_pos());
        Ok(())
    }

    /// Rewrite this packet as an Accepted/ProgMismatch reply carrying
    /// the supported version range.
    pub fn build_program_mismatch(&mut self, low: u32, high: u32) -> Result<()> {
        self.build_error_reply(accept_status::PROG_MISMATCH)?;
        self.put_u32(low)?;
        self.put_u32(high)?;
        self.set_end(self.write_pos());
        Ok(())
    }

    /// Rewrite this packet as a Denied/RpcMismatch reply. Only version
    /// 2 is spoken, so low and high are both 2.
    pub fn build_rpc_mismatch(&mut self) -> Result<()> {
        self.set_write_pos(MSG_TYPE_OFFSET);
        self.put_u32(msg_type::REPLY)?;
        self.put_u32(reply_state::DENIED)?;
        self.put_u32(reject_status::RPC_MISMATCH)?;
        self.put_u32(RPC_VERSION)?;
        self.put_u32(RPC_VERSION)?;
        self.set_end(self.write_pos());
        Ok(())
    }

    /// Rewrite this packet as a Denied/AuthError reply with the given
    /// auth status sub-code.
    pub fn build_auth_failure(&mut self, status: u32) -> Result<()> {
        self.set_write_pos(MSG_TYPE_OFFSET);
        self.put_u32(msg_type::REPLY)?;
        self.put_u32(reply_state::DENIED)?;
        self.put_u32(reject_status::AUTH_ERROR)?;
        self.put_u32(status)?;
        self.set_end(self.write_pos());
        Ok(())
    }
}
