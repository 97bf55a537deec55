//! The authenticator plug point.
//!
//! The engine never validates credentials itself; it asks the installed
//! [`RpcAuthenticator`] to map a call's credential to a session key and,
//! on demand, to a client identity. A rejected credential turns into a
//! Denied/AuthError reply carrying the sub-code from the returned
//! [`RpcError::AuthFailure`](crate::error::RpcError::AuthFailure).

use async_trait::async_trait;

use crate::error::Result;
use crate::protocol::wire::auth_flavor;
use crate::protocol::RpcPacket;

/// Opaque session key produced by an authenticator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey(pub u64);

/// Client identity resolved from a session key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    /// User name, if the credential carried one.
    pub name: String,
    /// Unix uid (0 for anonymous).
    pub uid: u32,
    /// Unix primary gid.
    pub gid: u32,
    /// Supplementary groups.
    pub groups: Vec<u32>,
}

impl ClientIdentity {
    /// The anonymous identity used by null authentication.
    pub fn anonymous() -> Self {
        Self {
            name: "anonymous".to_string(),
            uid: 0,
            gid: 0,
            groups: Vec::new(),
        }
    }
}

/// Maps request credentials to session keys and client identities.
#[async_trait]
pub trait RpcAuthenticator: Send + Sync {
    /// Credential flavors this authenticator accepts. Calls carrying
    /// any other flavor are denied with `auth_status::TOO_WEAK`.
    fn supported_types(&self) -> &[u32];

    /// Map the call's credential to a session key.
    ///
    /// Returns [`RpcError::AuthFailure`](crate::error::RpcError::AuthFailure)
    /// with the appropriate sub-code to reject the call.
    async fn identify(&self, cred_type: u32, packet: &RpcPacket) -> Result<SessionKey>;

    /// Resolve the client identity behind a session key.
    async fn client_info(&self, key: SessionKey, packet: &RpcPacket) -> Result<ClientIdentity>;
}

/// Accepts AUTH_NULL credentials only and maps every caller to the
/// anonymous identity.
pub struct NullAuthenticator;

const NULL_TYPES: &[u32] = &[auth_flavor::AUTH_NULL];

#[async_trait]
impl RpcAuthenticator for NullAuthenticator {
    fn supported_types(&self) -> &[u32] {
        NULL_TYPES
    }

    async fn identify(&self, _cred_type: u32, _packet: &RpcPacket) -> Result<SessionKey> {
        Ok(SessionKey(0))
    }

    async fn client_info(&self, _key: SessionKey, _packet: &RpcPacket) -> Result<ClientIdentity> {
        Ok(ClientIdentity::anonymous())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_null_authenticator_accepts_null_flavor() {
        let auth = NullAuthenticator;
        assert_eq!(auth.supported_types(), &[auth_flavor::AUTH_NULL]);

        let pkt = RpcPacket::new(64);
        let key = auth.identify(auth_flavor::AUTH_NULL, &pkt).await.unwrap();
        assert_eq!(key, SessionKey(0));

        let info = auth.client_info(key, &pkt).await.unwrap();
        assert_eq!(info, ClientIdentity::anonymous());
    }
}
