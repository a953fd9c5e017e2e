//! Pluggable callbacks invoked by the gateway.
//!
//! All hooks are plain synchronous closures. The handshake hook runs inline
//! during the handshake window; the others are dispatched through a
//! [`super::HookDispatcher`] and never run on a session's read loop.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::Request;
use bytes::Bytes;
use serde::Serialize;

use super::ConnectionRecord;
use crate::codec::Packet;

/// Verdict of the handshake hook, mirroring the CONNACK return codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeResult {
    /// Connection accepted.
    Success,
    /// Unsupported protocol version.
    ProtocolError,
    /// Client identifier rejected.
    IdRejected,
    /// Server unavailable.
    ServerUnavailable,
    /// Bad user name or password.
    CredentialsRejected,
    /// Not authorized.
    Unauthorized,
}

impl HandshakeResult {
    /// Returns the MQTT 3.1.1 CONNACK return code for this verdict.
    #[must_use]
    pub const fn return_code(self) -> u8 {
        match self {
            Self::Success => 0x00,
            Self::ProtocolError => 0x01,
            Self::IdRejected => 0x02,
            Self::ServerUnavailable => 0x03,
            Self::CredentialsRejected => 0x04,
            Self::Unauthorized => 0x05,
        }
    }
}

/// Identity extracted from a CONNECT, valid only during the handshake.
#[derive(Clone, PartialEq, Eq)]
pub struct HandshakeRecord {
    /// Client identifier from the CONNECT.
    pub client_id: String,
    /// Optional user name.
    pub username: Option<String>,
    /// Optional password.
    pub password: Option<Bytes>,
    /// Peer address, when known.
    pub remote_addr: Option<SocketAddr>,
}

impl fmt::Debug for HandshakeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeRecord")
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

/// Decides whether a CONNECT may become a session.
pub type HandshakeHook = Arc<dyn Fn(&HandshakeRecord) -> HandshakeResult + Send + Sync>;

/// Notified with the client id after a session is registered.
pub type ConnectedHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Notified with the final snapshot after a session is removed.
pub type DisconnectedHook = Arc<dyn Fn(ConnectionRecord) + Send + Sync>;

/// Receives every control packet read from a session.
pub type PacketHook = Arc<dyn Fn(&str, Packet) + Send + Sync>;

/// Extra validation of a WebSocket upgrade request; `Err` carries the
/// reason returned to the client.
pub type UpgradeHook = Arc<dyn Fn(&Request) -> Result<(), String> + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn return_codes_follow_connack() {
        assert_eq!(HandshakeResult::Success.return_code(), 0);
        assert_eq!(HandshakeResult::CredentialsRejected.return_code(), 4);
        assert_eq!(HandshakeResult::Unauthorized.return_code(), 5);
    }

    #[test]
    fn debug_redacts_password() {
        let record = HandshakeRecord {
            client_id: "c1".to_string(),
            username: Some("u".to_string()),
            password: Some(Bytes::from_static(b"hunter2")),
            remote_addr: None,
        };
        let text = format!("{record:?}");
        assert!(!text.contains("hunter2"));
    }
}
