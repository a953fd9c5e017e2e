//! CONNECT negotiation on freshly accepted streams.
//!
//! Both transports read until the first control packet is complete, under
//! the handshake deadline. That packet must be a CONNECT; its identity is
//! handed to the handshake hook, and only an accepted connection turns into
//! a [`Session`]. A refused connection gets a CONNACK carrying the hook's
//! return code before it is closed.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::codec::frame::{auto_chunk_binary_frames, build_pong_frame, decode_frame};
use crate::codec::mqtt::decode_packet;
use crate::codec::{ConnectPacket, Opcode, Packet, PacketType};
use crate::domain::{HandshakeRecord, HandshakeResult, ManagerOptions, Protocol};
use crate::error::{GatewayError, HandshakeError};
use crate::session::{MessageAssembler, Session};

/// A connection that passed the handshake.
#[derive(Debug)]
pub struct Negotiated {
    /// Transport the CONNECT arrived on.
    pub protocol: Protocol,
    /// Parsed CONNECT (client id already assigned when it was empty).
    pub connect: ConnectPacket,
    /// The CONNECT exactly as received.
    pub packet: Packet,
    /// Identity presented to the handshake hook.
    pub record: HandshakeRecord,
    /// Bytes read after the CONNECT that are not yet decoded.
    pub read_buffer: BytesMut,
    /// Reassembled WebSocket message bytes following the CONNECT.
    pub pending_message_bytes: BytesMut,
}

impl Negotiated {
    /// Client identifier the session is registered under.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.connect.client_id
    }

    /// Builds the session for `stream`, configured from `options`.
    ///
    /// The CONNECT is forwarded as the session's first packet.
    #[must_use]
    pub fn into_session<S>(self, stream: S, options: &ManagerOptions) -> Session<S>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut session = match self.protocol {
            Protocol::Tcp => Session::tcp(stream, self.connect.client_id, self.record.remote_addr),
            Protocol::WebSocket => {
                Session::websocket(stream, self.connect.client_id, self.record.remote_addr)
            }
        };
        let _ = session.set_idle_timeout(options.idle_timeout_secs);
        session.set_statistics(options.statistics_enabled);
        session.set_max_frame_size(options.websocket_max_frame_size);
        session.set_max_packet_size(options.max_packet_size);
        session
            .with_read_buffer(self.read_buffer)
            .with_pending_message_bytes(self.pending_message_bytes)
            .with_connect_packet(self.packet)
    }
}

/// Negotiates a raw TCP connection.
///
/// # Errors
///
/// Returns [`HandshakeError::Timeout`] if no complete packet arrives in
/// time, [`HandshakeError::NotConnect`] if the first packet is something
/// else and [`HandshakeError::Rejected`] if the hook refuses it.
pub async fn negotiate_tcp<S>(
    stream: &mut S,
    remote_addr: Option<SocketAddr>,
    options: &ManagerOptions,
) -> Result<Negotiated, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut read_buffer = BytesMut::with_capacity(1024);
    let packet = tokio::time::timeout(
        options.handshake_timeout(),
        read_first_packet(stream, &mut read_buffer, options.max_packet_size),
    )
    .await
    .map_err(|_| HandshakeError::Timeout)??;

    let (connect, record) = match authorize(&packet, remote_addr, options).await {
        Ok(accepted) => accepted,
        Err(HandshakeError::Rejected(verdict)) => {
            reject(stream, verdict, None, options).await;
            return Err(HandshakeError::Rejected(verdict));
        }
        Err(e) => return Err(e),
    };
    Ok(Negotiated {
        protocol: Protocol::Tcp,
        connect,
        packet,
        record,
        read_buffer,
        pending_message_bytes: BytesMut::new(),
    })
}

/// Negotiates an upgraded WebSocket connection.
///
/// `read_buffer` holds any bytes the HTTP layer read past the upgrade
/// request. Pings received before the CONNECT are answered.
///
/// # Errors
///
/// As [`negotiate_tcp`], plus [`HandshakeError::UnexpectedFrame`] for an
/// unknown opcode and [`HandshakeError::Closed`] for a close frame.
pub async fn negotiate_websocket<S>(
    stream: &mut S,
    mut read_buffer: BytesMut,
    remote_addr: Option<SocketAddr>,
    options: &ManagerOptions,
) -> Result<Negotiated, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut pending = BytesMut::new();
    let packet = tokio::time::timeout(
        options.handshake_timeout(),
        read_first_message_packet(
            stream,
            &mut read_buffer,
            &mut pending,
            options.websocket_max_frame_size,
            options.max_packet_size,
        ),
    )
    .await
    .map_err(|_| HandshakeError::Timeout)??;

    let (connect, record) = match authorize(&packet, remote_addr, options).await {
        Ok(accepted) => accepted,
        Err(HandshakeError::Rejected(verdict)) => {
            let max = options.websocket_max_frame_size;
            reject(stream, verdict, Some(max), options).await;
            return Err(HandshakeError::Rejected(verdict));
        }
        Err(e) => return Err(e),
    };
    Ok(Negotiated {
        protocol: Protocol::WebSocket,
        connect,
        packet,
        record,
        read_buffer,
        pending_message_bytes: pending,
    })
}

async fn read_first_packet<S>(
    stream: &mut S,
    buffer: &mut BytesMut,
    max_packet_size: usize,
) -> Result<Packet, HandshakeError>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some((_, packet)) = decode_packet(buffer, max_packet_size)? {
            return Ok(packet);
        }
        if stream.read_buf(buffer).await? == 0 {
            return Err(HandshakeError::Closed);
        }
    }
}

async fn read_first_message_packet<S>(
    stream: &mut S,
    buffer: &mut BytesMut,
    pending: &mut BytesMut,
    max_frame_size: usize,
    max_packet_size: usize,
) -> Result<Packet, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut assembler = MessageAssembler::new(max_packet_size);
    loop {
        while let Some((_, frame)) = decode_frame(buffer, max_frame_size)? {
            match frame.opcode {
                Opcode::Continuation | Opcode::Text | Opcode::Binary => {
                    let Some(message) = assembler.push(frame)? else {
                        continue;
                    };
                    pending.extend_from_slice(&message);
                    if let Some((_, packet)) = decode_packet(pending, max_packet_size)? {
                        return Ok(packet);
                    }
                }
                Opcode::Ping => {
                    stream.write_all(&build_pong_frame(&frame.payload)).await?;
                    stream.flush().await?;
                }
                Opcode::Pong => {}
                Opcode::Close => return Err(HandshakeError::Closed),
                Opcode::Reserved(code) => {
                    return Err(HandshakeError::UnexpectedFrame(format!(
                        "unknown opcode {code:#x}"
                    )));
                }
            }
        }
        if stream.read_buf(buffer).await? == 0 {
            return Err(HandshakeError::Closed);
        }
    }
}

/// Parses the CONNECT and runs the handshake hook.
async fn authorize(
    packet: &Packet,
    remote_addr: Option<SocketAddr>,
    options: &ManagerOptions,
) -> Result<(ConnectPacket, HandshakeRecord), HandshakeError> {
    if packet.packet_type() != PacketType::Connect {
        return Err(HandshakeError::NotConnect(format!(
            "{:?}",
            packet.packet_type()
        )));
    }
    let mut connect = ConnectPacket::parse(packet)?;
    if connect.client_id.is_empty() {
        if !connect.clean_session {
            return Err(HandshakeError::Rejected(HandshakeResult::IdRejected));
        }
        connect.client_id = format!("auto-{}", uuid::Uuid::new_v4());
        debug!(client_id = %connect.client_id, "assigned client id");
    }

    let record = HandshakeRecord {
        client_id: connect.client_id.clone(),
        username: connect.username.clone(),
        password: connect.password.clone(),
        remote_addr,
    };

    if let Some(hook) = &options.handshake_hook {
        let hook = Arc::clone(hook);
        let candidate = record.clone();
        let verdict = match tokio::task::spawn_blocking(move || hook(&candidate)).await {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!(client_id = %record.client_id, error = %e, "handshake hook panicked");
                HandshakeResult::ServerUnavailable
            }
        };
        if verdict != HandshakeResult::Success {
            return Err(HandshakeError::Rejected(verdict));
        }
    }
    Ok((connect, record))
}

/// Best-effort CONNACK carrying the refusal code.
async fn reject<S>(
    stream: &mut S,
    verdict: HandshakeResult,
    websocket_frame_size: Option<usize>,
    options: &ManagerOptions,
) where
    S: AsyncWrite + Unpin,
{
    let connack = Packet::new(PacketType::ConnAck, 0, vec![0x00, verdict.return_code()]);
    let write = async {
        match websocket_frame_size {
            None => connack.write_to(stream).await.map(drop),
            Some(max) => {
                let wire = auto_chunk_binary_frames(&connack.to_bytes()?, max);
                stream.write_all(&wire).await?;
                stream.flush().await?;
                Ok::<(), GatewayError>(())
            }
        }
    };
    match tokio::time::timeout(options.handshake_timeout(), write).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "failed to send CONNACK refusal"),
        Err(_) => debug!("timed out sending CONNACK refusal"),
    }
}
