//! WebSocket transport: HTTP upgrade validation and the upgrade handler.
//!
//! The upgrade path is an axum route. A valid request is answered with
//! `101 Switching Protocols`; the upgraded byte stream is then negotiated
//! like a TCP connection, except that MQTT travels inside binary frames.

pub mod handler;
pub mod upgrade;

pub use handler::{router, upgrade_handler};
pub use upgrade::{compute_accept_key, validate_upgrade};
