//! Immutable session snapshots.

use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::ConnectionId;
use crate::error::SessionError;

/// Transport a session arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// Raw MQTT over TCP.
    Tcp,
    /// MQTT over WebSocket binary frames.
    WebSocket,
}

impl Protocol {
    /// Returns the lowercase protocol tag.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::WebSocket => "websocket",
        }
    }
}

/// Session liveness. Moves from `Active` to `Inactive` once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Read loop is running.
    Active,
    /// Read loop has exited.
    Inactive,
}

/// Point-in-time snapshot of a session.
///
/// Handed to callers of the registry and to the disconnected hook; never
/// mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionRecord {
    /// MQTT client identifier (registry key).
    pub client_id: String,
    /// Identifier of the underlying connection.
    pub connection_id: ConnectionId,
    /// Transport tag.
    pub protocol: Protocol,
    /// Peer address, when known.
    pub remote_addr: Option<SocketAddr>,
    /// When the session was created.
    pub connected_at: DateTime<Utc>,
    /// When the read loop exited; never earlier than `connected_at`.
    pub closed_at: Option<DateTime<Utc>>,
    /// Bytes received (zero unless statistics are enabled).
    pub bytes_read: u64,
    /// Bytes sent (zero unless statistics are enabled).
    pub bytes_written: u64,
    /// WebSocket pings that could not be written.
    pub ping_failures: u64,
    /// Liveness at snapshot time.
    pub status: SessionStatus,
    /// Whether traffic statistics are collected.
    pub statistics_enabled: bool,
    /// Terminal error, if the session ended abnormally.
    pub last_error: Option<SessionError>,
}

impl ConnectionRecord {
    /// Returns `true` while the session's read loop is running.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }
}
