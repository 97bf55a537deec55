//! ONC/RPC wire constants (RFC 5531).
//!
//! All values are transmitted as big-endian 32-bit words. Status codes
//! are grouped into modules mirroring the two-level reply encoding:
//! a reply is either *accepted* (then carries an accept status) or
//! *denied* (then carries a reject status with sub-codes).

/// The only RPC protocol version this crate speaks.
pub const RPC_VERSION: u32 = 2;

/// Stream framing: high bit of the fragment word marks the last
/// fragment of a message.
pub const LAST_FRAGMENT: u32 = 0x8000_0000;

/// Stream framing: low 31 bits of the fragment word are the fragment
/// byte length.
pub const FRAGMENT_LENGTH_MASK: u32 = 0x7FFF_FFFF;

/// Upper bound on credential/verifier body length (RFC 5531 §8.2).
pub const MAX_AUTH_BYTES: usize = 400;

/// Message types.
pub mod msg_type {
    /// A call message.
    pub const CALL: u32 = 0;
    /// A reply message.
    pub const REPLY: u32 = 1;
}

/// Reply states (first level of the reply encoding).
pub mod reply_state {
    /// The call was accepted; an accept status follows the verifier.
    pub const ACCEPTED: u32 = 0;
    /// The call was denied; a reject status follows immediately.
    pub const DENIED: u32 = 1;
}

/// Accept statuses (second level, accepted branch).
pub mod accept_status {
    /// Procedure executed, results follow.
    pub const SUCCESS: u32 = 0;
    /// Program not exported by this server.
    pub const PROG_UNAVAIL: u32 = 1;
    /// Program exported but not at the requested version;
    /// low/high supported versions follow.
    pub const PROG_MISMATCH: u32 = 2;
    /// Procedure not recognized.
    pub const PROC_UNAVAIL: u32 = 3;
    /// Parameters could not be decoded.
    pub const GARBAGE_ARGS: u32 = 4;
}

/// Reject statuses (second level, denied branch).
pub mod reject_status {
    /// RPC version mismatch; low/high supported versions follow.
    pub const RPC_MISMATCH: u32 = 0;
    /// Authentication failure; an auth status follows.
    pub const AUTH_ERROR: u32 = 1;
}

/// Authentication failure sub-codes.
pub mod auth_status {
    /// Bad credential (seal broken).
    pub const BAD_CRED: u32 = 1;
    /// Client must begin a new session.
    pub const REJECTED_CRED: u32 = 2;
    /// Bad verifier.
    pub const BAD_VERF: u32 = 3;
    /// Verifier expired or replayed.
    pub const REJECTED_VERF: u32 = 4;
    /// Rejected for security reasons.
    pub const TOO_WEAK: u32 = 5;
}

/// Credential/verifier flavors.
pub mod auth_flavor {
    /// No authentication.
    pub const AUTH_NULL: u32 = 0;
    /// Unix uid/gid style credentials.
    pub const AUTH_UNIX: u32 = 1;
}

/// Transport protocol identifiers, as used in port-mapper records and
/// log keys. Not wire-visible in RPC messages themselves.
pub mod transport_id {
    /// TCP (IPPROTO_TCP).
    pub const TCP: u32 = 6;
    /// UDP (IPPROTO_UDP).
    pub const UDP: u32 = 17;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragment_word_split() {
        let word = LAST_FRAGMENT | 354;
        assert_eq!(word & FRAGMENT_LENGTH_MASK, 354);
        assert_ne!(word & LAST_FRAGMENT, 0);

        let word = 354;
        assert_eq!(word & FRAGMENT_LENGTH_MASK, 354);
        assert_eq!(word & LAST_FRAGMENT, 0);
    }

    #[test]
    fn test_status_code_values() {
        // Values are pinned by RFC 5531; a change here is a protocol break.
        assert_eq!(msg_type::CALL, 0);
        assert_eq!(msg_type::REPLY, 1);
        assert_eq!(reply_state::ACCEPTED, 0);
        assert_eq!(reply_state::DENIED, 1);
        assert_eq!(accept_status::GARBAGE_ARGS, 4);
        assert_eq!(reject_status::AUTH_ERROR, 1);
        assert_eq!(auth_status::TOO_WEAK, 5);
    }

    #[test]
    fn test_transport_ids() {
        assert_eq!(transport_id::TCP, 6);
        assert_eq!(transport_id::UDP, 17);
    }
}
