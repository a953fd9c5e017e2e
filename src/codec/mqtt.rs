//! MQTT control packet framing.
//!
//! Packets are kept as raw units (`type`, `flags`, `body`); the gateway
//! forwards them untouched. Only CONNECT is parsed, to extract the
//! identity used by the handshake.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::{CodecError, GatewayError};

/// Maximum value of the remaining-length field (268,435,455).
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Default cap on one packet's wire size, fixed header included.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1024 * 1024;

/// MQTT control packet type (upper nibble of the first header byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// Client request to connect.
    Connect,
    /// Connect acknowledgment.
    ConnAck,
    /// Publish message.
    Publish,
    /// Publish acknowledgment (QoS 1).
    PubAck,
    /// Publish received (QoS 2, part 1).
    PubRec,
    /// Publish release (QoS 2, part 2).
    PubRel,
    /// Publish complete (QoS 2, part 3).
    PubComp,
    /// Subscribe request.
    Subscribe,
    /// Subscribe acknowledgment.
    SubAck,
    /// Unsubscribe request.
    Unsubscribe,
    /// Unsubscribe acknowledgment.
    UnsubAck,
    /// Ping request.
    PingReq,
    /// Ping response.
    PingResp,
    /// Disconnect notification.
    Disconnect,
    /// Authentication exchange (MQTT 5).
    Auth,
}

impl PacketType {
    /// Returns the 4-bit wire code.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Connect => 1,
            Self::ConnAck => 2,
            Self::Publish => 3,
            Self::PubAck => 4,
            Self::PubRec => 5,
            Self::PubRel => 6,
            Self::PubComp => 7,
            Self::Subscribe => 8,
            Self::SubAck => 9,
            Self::Unsubscribe => 10,
            Self::UnsubAck => 11,
            Self::PingReq => 12,
            Self::PingResp => 13,
            Self::Disconnect => 14,
            Self::Auth => 15,
        }
    }
}

impl TryFrom<u8> for PacketType {
    type Error = CodecError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Ok(match code {
            1 => Self::Connect,
            2 => Self::ConnAck,
            3 => Self::Publish,
            4 => Self::PubAck,
            5 => Self::PubRec,
            6 => Self::PubRel,
            7 => Self::PubComp,
            8 => Self::Subscribe,
            9 => Self::SubAck,
            10 => Self::Unsubscribe,
            11 => Self::UnsubAck,
            12 => Self::PingReq,
            13 => Self::PingResp,
            14 => Self::Disconnect,
            15 => Self::Auth,
            other => return Err(CodecError::ReservedPacketType(other)),
        })
    }
}

/// A raw MQTT control packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    packet_type: PacketType,
    flags: u8,
    body: Bytes,
}

impl Packet {
    /// Creates a packet from its type, header flags (lower nibble) and body
    /// (variable header plus payload).
    #[must_use]
    pub fn new(packet_type: PacketType, flags: u8, body: impl Into<Bytes>) -> Self {
        Self {
            packet_type,
            flags: flags & 0x0F,
            body: body.into(),
        }
    }

    /// Returns the control packet type.
    #[must_use]
    pub const fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    /// Returns the fixed-header flags.
    #[must_use]
    pub const fn flags(&self) -> u8 {
        self.flags
    }

    /// Returns the variable header and payload.
    #[must_use]
    pub const fn body(&self) -> &Bytes {
        &self.body
    }

    /// Returns the number of bytes [`Packet::encode`] produces.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        1 + remaining_length_len(self.body.len()) + self.body.len()
    }

    /// Appends the wire encoding to `dst`, returning the bytes written.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::RemainingLengthTooLarge`] if the body does not
    /// fit the remaining-length field.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<usize, CodecError> {
        let remaining = self.body.len();
        if remaining > MAX_REMAINING_LENGTH {
            return Err(CodecError::RemainingLengthTooLarge(remaining));
        }
        let start = dst.len();
        dst.reserve(self.encoded_len());
        dst.put_u8((self.packet_type.code() << 4) | self.flags);
        encode_remaining_length(dst, remaining);
        dst.extend_from_slice(&self.body);
        Ok(dst.len() - start)
    }

    /// Returns the wire encoding as a standalone buffer.
    ///
    /// # Errors
    ///
    /// See [`Packet::encode`].
    pub fn to_bytes(&self) -> Result<Bytes, CodecError> {
        let mut dst = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut dst)?;
        Ok(dst.freeze())
    }

    /// Encodes and writes the packet, returning the bytes written.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Codec`] if the packet cannot be encoded and
    /// [`GatewayError::Io`] if the write fails.
    pub async fn write_to<W>(&self, writer: &mut W) -> Result<usize, GatewayError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let bytes = self.to_bytes()?;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(bytes.len())
    }
}

/// Decodes one packet from the front of `buf`.
///
/// Returns `Ok(None)` when `buf` does not yet hold a complete packet; the
/// buffer is left untouched in that case. On success the packet's bytes
/// are removed and its wire length returned alongside it.
///
/// The size check runs on the fixed header, so an oversized packet is
/// refused before its body is buffered.
///
/// # Errors
///
/// Returns a [`CodecError`] for a reserved packet type, a malformed
/// remaining-length field or a packet larger than `max_packet_size`.
pub fn decode_packet(
    buf: &mut BytesMut,
    max_packet_size: usize,
) -> Result<Option<(usize, Packet)>, CodecError> {
    let Some((first, header_len, remaining)) = peek_fixed_header(buf)? else {
        return Ok(None);
    };
    let packet_type = PacketType::try_from(first >> 4)?;
    let total = header_len + remaining;
    if total > max_packet_size {
        return Err(CodecError::PacketTooLarge {
            size: total,
            max: max_packet_size,
        });
    }
    if buf.len() < total {
        return Ok(None);
    }
    let mut unit = buf.split_to(total);
    unit.advance(header_len);
    Ok(Some((
        total,
        Packet {
            packet_type,
            flags: first & 0x0F,
            body: unit.freeze(),
        },
    )))
}

/// Extracts every complete packet from `buf`, in wire order.
///
/// Any trailing partial packet stays in `buf` for the next call.
///
/// # Errors
///
/// See [`decode_packet`]. Packets decoded before the error are dropped.
pub fn read_stream(buf: &mut BytesMut, max_packet_size: usize) -> Result<Vec<Packet>, CodecError> {
    let mut packets = Vec::new();
    while let Some((_, packet)) = decode_packet(buf, max_packet_size)? {
        packets.push(packet);
    }
    Ok(packets)
}

/// Peeks the fixed header: first byte, header length, remaining length.
fn peek_fixed_header(buf: &[u8]) -> Result<Option<(u8, usize, usize)>, CodecError> {
    let mut bytes = buf.iter().copied();
    let Some(first) = bytes.next() else {
        return Ok(None);
    };
    let mut remaining = 0usize;
    let mut multiplier = 1usize;
    for used in 1..=4 {
        let Some(byte) = bytes.next() else {
            return Ok(None);
        };
        remaining += usize::from(byte & 0x7F) * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((first, 1 + used, remaining)));
        }
        multiplier *= 128;
    }
    Err(CodecError::MalformedRemainingLength)
}

fn encode_remaining_length(dst: &mut BytesMut, mut value: usize) {
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        dst.put_u8(byte);
        if value == 0 {
            break;
        }
    }
}

const fn remaining_length_len(value: usize) -> usize {
    match value {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    }
}

/// Will message carried by a CONNECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    /// Topic the will is published to.
    pub topic: String,
    /// Will payload.
    pub payload: Bytes,
    /// Requested QoS (0..=2).
    pub qos: u8,
    /// Whether the will is retained.
    pub retain: bool,
}

/// Parsed CONNECT packet.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectPacket {
    /// `"MQTT"` (3.1.1 / 5) or `"MQIsdp"` (3.1).
    pub protocol_name: String,
    /// Protocol level: 3, 4 or 5.
    pub protocol_level: u8,
    /// Clean session / clean start flag.
    pub clean_session: bool,
    /// Keep-alive interval in seconds.
    pub keep_alive: u16,
    /// Client identifier; may be empty.
    pub client_id: String,
    /// Optional will message.
    pub will: Option<Will>,
    /// Optional user name.
    pub username: Option<String>,
    /// Optional password (binary data).
    pub password: Option<Bytes>,
}

impl fmt::Debug for ConnectPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectPacket")
            .field("protocol_name", &self.protocol_name)
            .field("protocol_level", &self.protocol_level)
            .field("clean_session", &self.clean_session)
            .field("keep_alive", &self.keep_alive)
            .field("client_id", &self.client_id)
            .field("will", &self.will)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl ConnectPacket {
    /// Creates an MQTT 3.1.1 CONNECT with clean session and a 60 s keep-alive.
    #[must_use]
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            protocol_name: "MQTT".to_string(),
            protocol_level: 4,
            clean_session: true,
            keep_alive: 60,
            client_id: client_id.into(),
            will: None,
            username: None,
            password: None,
        }
    }

    /// Sets user name and password.
    #[must_use]
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<Bytes>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Parses the body of a CONNECT packet.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::MalformedConnect`] if `packet` is not a CONNECT,
    /// declares an unsupported protocol level, or is truncated.
    pub fn parse(packet: &Packet) -> Result<Self, CodecError> {
        if packet.packet_type() != PacketType::Connect {
            return Err(malformed(format!("{:?} is not CONNECT", packet.packet_type())));
        }
        let mut body = packet.body().clone();

        let protocol_name = read_string(&mut body, "protocol name")?;
        let protocol_level = read_u8(&mut body, "protocol level")?;
        if !matches!(protocol_level, 3..=5) {
            return Err(malformed(format!("unsupported protocol level {protocol_level}")));
        }
        let flags = read_u8(&mut body, "connect flags")?;
        if flags & 0x01 != 0 {
            return Err(malformed("reserved connect flag set".to_string()));
        }
        let keep_alive = read_u16(&mut body, "keep alive")?;
        if protocol_level == 5 {
            skip_properties(&mut body)?;
        }

        let client_id = read_string(&mut body, "client identifier")?;
        let will = if flags & 0x04 != 0 {
            if protocol_level == 5 {
                skip_properties(&mut body)?;
            }
            Some(Will {
                topic: read_string(&mut body, "will topic")?,
                payload: read_binary(&mut body, "will payload")?,
                qos: (flags >> 3) & 0x03,
                retain: flags & 0x20 != 0,
            })
        } else {
            None
        };
        let username = if flags & 0x80 != 0 {
            Some(read_string(&mut body, "user name")?)
        } else {
            None
        };
        let password = if flags & 0x40 != 0 {
            Some(read_binary(&mut body, "password")?)
        } else {
            None
        };

        Ok(Self {
            protocol_name,
            protocol_level,
            clean_session: flags & 0x02 != 0,
            keep_alive,
            client_id,
            will,
            username,
            password,
        })
    }

    /// Encodes this CONNECT as a raw [`Packet`].
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::MalformedConnect`] if a string or binary field
    /// exceeds 65,535 bytes.
    pub fn to_packet(&self) -> Result<Packet, CodecError> {
        let mut flags = 0u8;
        if self.clean_session {
            flags |= 0x02;
        }
        if let Some(will) = &self.will {
            flags |= 0x04 | ((will.qos & 0x03) << 3);
            if will.retain {
                flags |= 0x20;
            }
        }
        if self.password.is_some() {
            flags |= 0x40;
        }
        if self.username.is_some() {
            flags |= 0x80;
        }

        let mut body = BytesMut::new();
        put_binary(&mut body, self.protocol_name.as_bytes())?;
        body.put_u8(self.protocol_level);
        body.put_u8(flags);
        body.put_u16(self.keep_alive);
        if self.protocol_level == 5 {
            body.put_u8(0);
        }
        put_binary(&mut body, self.client_id.as_bytes())?;
        if let Some(will) = &self.will {
            if self.protocol_level == 5 {
                body.put_u8(0);
            }
            put_binary(&mut body, will.topic.as_bytes())?;
            put_binary(&mut body, &will.payload)?;
        }
        if let Some(username) = &self.username {
            put_binary(&mut body, username.as_bytes())?;
        }
        if let Some(password) = &self.password {
            put_binary(&mut body, password)?;
        }
        Ok(Packet::new(PacketType::Connect, 0, body.freeze()))
    }
}

fn malformed(reason: String) -> CodecError {
    CodecError::MalformedConnect(reason)
}

fn truncated(field: &str) -> CodecError {
    malformed(format!("truncated {field}"))
}

fn read_u8(buf: &mut Bytes, field: &str) -> Result<u8, CodecError> {
    if buf.remaining() < 1 {
        return Err(truncated(field));
    }
    Ok(buf.get_u8())
}

fn read_u16(buf: &mut Bytes, field: &str) -> Result<u16, CodecError> {
    if buf.remaining() < 2 {
        return Err(truncated(field));
    }
    Ok(buf.get_u16())
}

fn read_binary(buf: &mut Bytes, field: &str) -> Result<Bytes, CodecError> {
    let len = usize::from(read_u16(buf, field)?);
    if buf.remaining() < len {
        return Err(truncated(field));
    }
    Ok(buf.split_to(len))
}

fn read_string(buf: &mut Bytes, field: &str) -> Result<String, CodecError> {
    let raw = read_binary(buf, field)?;
    String::from_utf8(raw.to_vec()).map_err(|_| malformed(format!("{field} is not valid UTF-8")))
}

fn skip_properties(buf: &mut Bytes) -> Result<(), CodecError> {
    let mut len = 0usize;
    let mut multiplier = 1usize;
    let mut complete = false;
    for _ in 0..4 {
        let byte = read_u8(buf, "property length")?;
        len += usize::from(byte & 0x7F) * multiplier;
        if byte & 0x80 == 0 {
            complete = true;
            break;
        }
        multiplier *= 128;
    }
    if !complete {
        return Err(malformed("property length exceeds four bytes".to_string()));
    }
    if buf.remaining() < len {
        return Err(truncated("properties"));
    }
    buf.advance(len);
    Ok(())
}

fn put_binary(dst: &mut BytesMut, value: &[u8]) -> Result<(), CodecError> {
    let len = u16::try_from(value.len())
        .map_err(|_| malformed(format!("field of {} bytes is too long", value.len())))?;
    dst.put_u16(len);
    dst.extend_from_slice(value);
    Ok(())
}
