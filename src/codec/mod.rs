//! Wire codecs consumed by the sessions.
//!
//! - [`mqtt`]: MQTT control packet framing and CONNECT parsing.
//! - [`frame`]: RFC 6455 WebSocket frames.
//!
//! Both decoders work on a [`bytes::BytesMut`] read buffer and return
//! `Ok(None)` while a unit is still incomplete, so callers can keep
//! reading with cancel-safe `read_buf` calls.

pub mod frame;
pub mod mqtt;

pub use frame::{Frame, Opcode};
pub use mqtt::{ConnectPacket, Packet, PacketType};
