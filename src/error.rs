//! Gateway error types.
//!
//! [`GatewayError`] is returned to callers of the registry. [`SessionError`]
//! is the terminal cause recorded in a session's final snapshot, and
//! [`HandshakeError`] / [`UpgradeError`] describe why a connection never
//! became a session. [`CodecError`] covers both wire codecs.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::domain::HandshakeResult;

/// Caller-facing error for registry and session operations.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// No live session is registered under the given client id.
    #[error("client not found: {0}")]
    ClientNotFound(String),

    /// The session is no longer running and cannot be written to.
    #[error("client is disconnected: {0}")]
    Disconnected(String),

    /// The registry is stopped; connections are not admitted.
    #[error("gateway is not running")]
    NotRunning,

    /// A listener could not be bound during start.
    #[error("failed to bind {transport} listener on {addr}: {source}")]
    Bind {
        /// Transport name (`tcp`, `websocket`, `udp`).
        transport: &'static str,
        /// Address the bind was attempted on.
        addr: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Socket read or write failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Packet or frame encoding failure.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Invalid configuration or another internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Broad category of a terminal session error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Socket read/write failure or peer close.
    Transport,
    /// Malformed frame or packet, unknown opcode.
    Protocol,
    /// Idle or handshake deadline expired.
    Timeout,
}

/// Terminal cause of a session, stored in its final snapshot.
///
/// A session closed on request (registry `close_once`, peer close frame)
/// ends without an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum SessionError {
    /// Read or write failure, including the peer closing the socket.
    #[error("transport error: {0}")]
    Transport(String),

    /// The peer sent something the codecs reject.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No complete packet or frame arrived within the idle timeout.
    #[error("client heartbeat timed out")]
    IdleTimeout,

    /// A newer connection registered the same client id.
    #[error("session taken over by a newer connection")]
    TakenOver,
}

impl SessionError {
    /// Returns the observability category of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(_) | Self::TakenOver => ErrorKind::Transport,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::IdleTimeout => ErrorKind::Timeout,
        }
    }
}

/// Why a connection failed before becoming a session.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    /// No CONNECT arrived within the handshake timeout.
    #[error("handshake timed out")]
    Timeout,

    /// The peer closed the connection before sending a CONNECT.
    #[error("connection closed during handshake")]
    Closed,

    /// The first packet was not a CONNECT.
    #[error("first packet is not CONNECT: {0}")]
    NotConnect(String),

    /// The WebSocket peer sent a frame that is not allowed before CONNECT.
    #[error("unexpected frame during handshake: {0}")]
    UnexpectedFrame(String),

    /// The handshake hook refused the connection.
    #[error("connect handshake rejected: {0:?}")]
    Rejected(HandshakeResult),

    /// Socket failure while reading the CONNECT.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The CONNECT could not be decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

impl HandshakeError {
    /// Returns the observability category of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout => ErrorKind::Timeout,
            Self::Closed | Self::Io(_) => ErrorKind::Transport,
            Self::NotConnect(_)
            | Self::UnexpectedFrame(_)
            | Self::Rejected(_)
            | Self::Codec(_) => ErrorKind::Protocol,
        }
    }
}

/// Rejection of a WebSocket upgrade request.
///
/// Rendered as a plain-text HTTP error response; the connection is never
/// upgraded when one of these is returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpgradeError {
    /// Method is not `GET`.
    #[error("bad method")]
    BadMethod,

    /// `Connection` header missing or without `upgrade`.
    #[error("missing or bad upgrade")]
    MissingUpgrade,

    /// `Upgrade` header missing or without `websocket`.
    #[error("missing or bad WebSocket-Protocol")]
    BadProtocol,

    /// `Sec-WebSocket-Version` is not `13`.
    #[error("bad protocol version")]
    BadVersion,

    /// `Sec-WebSocket-Key` missing or not 16 base64-encoded bytes.
    #[error("bad 'Sec-WebSocket-Key'")]
    BadKey,

    /// The configured extra check refused the request.
    #[error("{0}")]
    Rejected(String),

    /// The HTTP connection carries no upgrade capability.
    #[error("connection is not upgradable")]
    NotUpgradable,
}

impl UpgradeError {
    /// Returns the HTTP status code for this variant.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::BadMethod => StatusCode::METHOD_NOT_ALLOWED,
            Self::MissingUpgrade | Self::BadProtocol | Self::BadVersion | Self::BadKey => {
                StatusCode::BAD_REQUEST
            }
            Self::Rejected(_) => StatusCode::FORBIDDEN,
            Self::NotUpgradable => StatusCode::UPGRADE_REQUIRED,
        }
    }
}

impl IntoResponse for UpgradeError {
    fn into_response(self) -> Response {
        let reason = match &self {
            Self::Rejected(reason) if reason.is_empty() => {
                self.status_code().canonical_reason().unwrap_or("rejected").to_string()
            }
            _ => self.to_string(),
        };
        (self.status_code(), reason).into_response()
    }
}

/// Wire decoding/encoding failure for MQTT packets and WebSocket frames.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Packet type nibble 0 is reserved.
    #[error("reserved packet type {0}")]
    ReservedPacketType(u8),

    /// Remaining length uses more than four bytes.
    #[error("malformed remaining length")]
    MalformedRemainingLength,

    /// Remaining length exceeds the protocol maximum.
    #[error("remaining length {0} exceeds protocol maximum")]
    RemainingLengthTooLarge(usize),

    /// A packet's declared size exceeds the configured maximum.
    #[error("packet of {size} bytes exceeds limit of {max}")]
    PacketTooLarge {
        /// Declared wire size, fixed header included.
        size: usize,
        /// Configured limit.
        max: usize,
    },

    /// A fragmented WebSocket message grew past the configured maximum.
    #[error("fragmented message of {size} bytes exceeds limit of {max}")]
    MessageTooLarge {
        /// Bytes accumulated so far.
        size: usize,
        /// Configured limit.
        max: usize,
    },

    /// The CONNECT body is malformed.
    #[error("malformed CONNECT: {0}")]
    MalformedConnect(String),

    /// A frame sets RSV bits although no extension was negotiated.
    #[error("reserved frame bits set")]
    ReservedBits,

    /// A control frame is fragmented or carries more than 125 bytes.
    #[error("invalid control frame: {0}")]
    InvalidControlFrame(String),

    /// A frame payload exceeds the configured maximum.
    #[error("frame payload of {size} bytes exceeds limit of {max}")]
    FrameTooLarge {
        /// Declared payload size.
        size: u64,
        /// Configured limit.
        max: usize,
    },
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn idle_timeout_is_tagged_as_timeout() {
        assert_eq!(SessionError::IdleTimeout.kind(), ErrorKind::Timeout);
        assert_eq!(
            SessionError::Transport("reset".to_string()).kind(),
            ErrorKind::Transport
        );
        assert_eq!(HandshakeError::Timeout.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn upgrade_errors_map_to_http_status() {
        assert_eq!(UpgradeError::BadMethod.status_code(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(UpgradeError::BadVersion.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            UpgradeError::Rejected("nope".to_string()).status_code(),
            StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn session_error_serializes_with_kind_tag() {
        let json = serde_json::to_value(SessionError::Protocol("bad opcode".to_string())).ok();
        let Some(json) = json else {
            panic!("serialization failed");
        };
        assert_eq!(json["kind"], "protocol");
        assert_eq!(json["message"], "bad opcode");

        let json = serde_json::to_value(SessionError::IdleTimeout).ok();
        let Some(json) = json else {
            panic!("serialization failed");
        };
        assert_eq!(json["kind"], "idle_timeout");
    }
}
