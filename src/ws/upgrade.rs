//! HTTP upgrade validation and the `Sec-WebSocket-Accept` key.

use axum::http::{HeaderMap, Method, header};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha1::{Digest, Sha1};

use crate::error::UpgradeError;

/// GUID appended to the client key before hashing (RFC 6455, section 1.3).
const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Checks that a request asks for a WebSocket upgrade this gateway accepts.
///
/// # Errors
///
/// Returns the first failing check: method, `Connection`, `Upgrade`,
/// `Sec-WebSocket-Version`, then `Sec-WebSocket-Key`.
pub fn validate_upgrade(method: &Method, headers: &HeaderMap) -> Result<(), UpgradeError> {
    if method != Method::GET {
        return Err(UpgradeError::BadMethod);
    }
    if !header_contains(headers, header::CONNECTION, "upgrade") {
        return Err(UpgradeError::MissingUpgrade);
    }
    if !header_contains(headers, header::UPGRADE, "websocket") {
        return Err(UpgradeError::BadProtocol);
    }
    let version = headers
        .get(header::SEC_WEBSOCKET_VERSION)
        .and_then(|v| v.to_str().ok())
        .map(str::trim);
    if version != Some("13") {
        return Err(UpgradeError::BadVersion);
    }
    let key = headers
        .get(header::SEC_WEBSOCKET_KEY)
        .and_then(|v| v.to_str().ok())
        .ok_or(UpgradeError::BadKey)?;
    match STANDARD.decode(key.trim()) {
        Ok(decoded) if decoded.len() == 16 => Ok(()),
        _ => Err(UpgradeError::BadKey),
    }
}

/// Computes `base64(SHA-1(key ++ GUID))` for the handshake response.
#[must_use]
pub fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.trim().as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Case-insensitive substring match on every value of `name`.
fn header_contains(headers: &HeaderMap, name: header::HeaderName, needle: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains(needle))
}
