//! # mqtt-gateway
//!
//! Connection layer of an MQTT broker: accepts MQTT clients over raw TCP
//! and WebSocket, validates their CONNECT, keeps one live session per
//! client id and hands every decoded control packet to a user hook.
//!
//! The gateway does not interpret packets beyond the CONNECT; protocol
//! logic (subscriptions, QoS flows, CONNACK on success) belongs to the
//! application behind the hooks.
//!
//! ## Architecture
//!
//! ```text
//! Clients (TCP, WebSocket)
//!     │
//!     ├── Listeners (listener.rs, ws/)
//!     │       └── HTTP upgrade validation (ws/upgrade.rs)
//!     │
//!     ├── Handshake (handshake.rs)
//!     │       └── CONNECT + handshake hook
//!     │
//!     ├── Sessions (session/)
//!     │       ├── TCP read loop
//!     │       └── WebSocket read loop + frame reassembly
//!     │
//!     ├── Registry (domain/)
//!     │       └── HookDispatcher per hook category
//!     │
//!     └── Codecs (codec/)
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use mqtt_gateway::domain::{OptionsUpdate, Registry};
//!
//! # async fn run() -> Result<(), mqtt_gateway::error::GatewayError> {
//! let registry = Registry::new(
//!     OptionsUpdate::default()
//!         .on_packet(|client_id, packet| {
//!             println!("{client_id}: {:?}", packet.packet_type());
//!         }),
//! );
//! registry.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod app_state;
pub mod codec;
pub mod config;
pub mod domain;
pub mod error;
pub mod handshake;
pub mod listener;
pub mod session;
pub mod ws;
