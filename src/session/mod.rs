//! Per-connection sessions.
//!
//! A [`Session`] wraps a stream that already passed the handshake. It is
//! inert until [`Session::start`] spawns its read loop; from then on the
//! loop task exclusively owns the read half, the idle timer and the
//! reassembly buffers. Everything else reaches the session through a
//! cloneable [`SessionHandle`].
//!
//! ```text
//! Session (idle) ──start()──► read loop task ──exit──► SessionOutcome
//!                                │      ▲
//!                     forwarder ◄┘      │ stop signal / writes
//!                                  SessionHandle
//! ```

pub mod assembler;
mod tcp;
mod websocket;

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use assembler::MessageAssembler;

use crate::codec::Packet;
use crate::codec::mqtt::DEFAULT_MAX_PACKET_SIZE;
use crate::codec::frame::{
    DEFAULT_MAX_FRAME_PAYLOAD, auto_chunk_binary_frames, build_close_frame, build_ping_frame,
};
use crate::domain::options::{DEFAULT_IDLE_TIMEOUT_SECS, is_valid_idle_timeout};
use crate::domain::{ConnectionId, ConnectionRecord, Protocol, SessionStatus};
use crate::error::{CodecError, GatewayError, SessionError};

/// Payload carried by keep-alive pings.
const PING_PAYLOAD: &[u8] = b"hello";
/// Pings are sent this long before the idle deadline.
const PING_LEAD: Duration = Duration::from_secs(5);
/// WebSocket close status for a normal closure.
const CLOSE_NORMAL: u16 = 1000;
/// Longest wait for the close frame and socket shutdown.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(1);

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Receives every control packet a session decodes, in wire order.
///
/// The read loop awaits `forward` before reading on, so an implementation
/// that blocks applies backpressure to its session. A pending `forward` is
/// dropped when the session is asked to stop.
pub trait PacketForwarder: Send + Sync + 'static {
    /// Hands one decoded packet over for processing.
    fn forward(&self, client_id: &str, packet: Packet) -> impl Future<Output = ()> + Send;
}

/// How outgoing packets are framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Raw,
    WebSocket { max_frame_size: usize },
}

/// One-shot disconnect request.
#[derive(Debug, Clone, Default)]
struct DisconnectSignal {
    suppress: bool,
    cause: Option<SessionError>,
}

/// Final state of a session, returned by its read loop task.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOutcome {
    /// Snapshot taken after the loop exited.
    pub record: ConnectionRecord,
    /// Whether the disconnected hook must be skipped.
    pub suppressed: bool,
    /// Whether a newer connection replaced this session in the registry.
    pub evicted: bool,
}

/// A handshaken connection whose read loop has not started.
///
/// Idle timeout, statistics and frame size can only be changed here; once
/// started, the session's configuration is fixed.
pub struct Session<S> {
    stream: S,
    client_id: String,
    connection_id: ConnectionId,
    protocol: Protocol,
    remote_addr: Option<SocketAddr>,
    idle_timeout: Duration,
    statistics_enabled: bool,
    max_frame_size: usize,
    max_packet_size: usize,
    read_buffer: BytesMut,
    pending_message_bytes: BytesMut,
    connect_packet: Option<Packet>,
}

impl<S> fmt::Debug for Session<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("client_id", &self.client_id)
            .field("connection_id", &self.connection_id)
            .field("protocol", &self.protocol)
            .field("remote_addr", &self.remote_addr)
            .field("idle_timeout", &self.idle_timeout)
            .field("statistics_enabled", &self.statistics_enabled)
            .finish_non_exhaustive()
    }
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Creates a session speaking raw MQTT over `stream`.
    #[must_use]
    pub fn tcp(stream: S, client_id: impl Into<String>, remote_addr: Option<SocketAddr>) -> Self {
        Self::new(stream, client_id.into(), remote_addr, Protocol::Tcp)
    }

    /// Creates a session speaking MQTT inside WebSocket binary frames.
    #[must_use]
    pub fn websocket(
        stream: S,
        client_id: impl Into<String>,
        remote_addr: Option<SocketAddr>,
    ) -> Self {
        Self::new(stream, client_id.into(), remote_addr, Protocol::WebSocket)
    }

    fn new(
        stream: S,
        client_id: String,
        remote_addr: Option<SocketAddr>,
        protocol: Protocol,
    ) -> Self {
        Self {
            stream,
            client_id,
            connection_id: ConnectionId::new(),
            protocol,
            remote_addr,
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            statistics_enabled: false,
            max_frame_size: DEFAULT_MAX_FRAME_PAYLOAD,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            read_buffer: BytesMut::new(),
            pending_message_bytes: BytesMut::new(),
            connect_packet: None,
        }
    }

    /// Client identifier this session will be registered under.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Connection identifier assigned at construction.
    #[must_use]
    pub const fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Sets the idle timeout in seconds.
    ///
    /// Values outside 10..=300 are ignored and `false` is returned.
    pub fn set_idle_timeout(&mut self, secs: u64) -> bool {
        if !is_valid_idle_timeout(secs) {
            return false;
        }
        self.idle_timeout = Duration::from_secs(secs);
        true
    }

    /// Enables or disables byte counters.
    pub fn set_statistics(&mut self, enabled: bool) {
        self.statistics_enabled = enabled;
    }

    /// Sets the largest frame payload read or written (WebSocket only).
    pub fn set_max_frame_size(&mut self, size: usize) {
        self.max_frame_size = size.max(1);
    }

    /// Sets the largest packet, or fragmented message, accepted from the
    /// peer.
    pub fn set_max_packet_size(&mut self, size: usize) {
        self.max_packet_size = size.max(1);
    }

    /// Seeds the read buffer with bytes received after the handshake.
    #[must_use]
    pub fn with_read_buffer(mut self, buffer: BytesMut) -> Self {
        self.read_buffer = buffer;
        self
    }

    /// Seeds the reassembled-message buffer (WebSocket only).
    #[must_use]
    pub fn with_pending_message_bytes(mut self, pending: BytesMut) -> Self {
        self.pending_message_bytes = pending;
        self
    }

    /// Forwards `packet` as the first packet once the loop starts.
    #[must_use]
    pub fn with_connect_packet(mut self, packet: Packet) -> Self {
        self.connect_packet = Some(packet);
        self
    }

    /// Spawns the read loop.
    ///
    /// Returns the handle used to query, write to and stop the session, and
    /// the task that resolves to its [`SessionOutcome`].
    pub fn start<F>(self, forwarder: F) -> (SessionHandle, JoinHandle<SessionOutcome>)
    where
        F: PacketForwarder,
    {
        let (reader, writer) = tokio::io::split(self.stream);
        let framing = match self.protocol {
            Protocol::Tcp => Framing::Raw,
            Protocol::WebSocket => Framing::WebSocket {
                max_frame_size: self.max_frame_size,
            },
        };
        let boxed: BoxedWriter = Box::new(writer);
        let (closing, stop) = watch::channel(false);
        let shared = Arc::new(SessionShared {
            client_id: self.client_id,
            connection_id: self.connection_id,
            protocol: self.protocol,
            remote_addr: self.remote_addr,
            connected_at: Utc::now(),
            closed_at: OnceLock::new(),
            statistics_enabled: self.statistics_enabled,
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            ping_failures: AtomicU64::new(0),
            active: AtomicBool::new(true),
            evicted: AtomicBool::new(false),
            ping_in_flight: AtomicBool::new(false),
            write_torn: AtomicBool::new(false),
            disconnect: OnceLock::new(),
            closing,
            last_error: OnceLock::new(),
            writer: Mutex::new(Some(boxed)),
            framing,
        });
        let state = LoopState {
            reader,
            buffer: self.read_buffer,
            pending: self.pending_message_bytes,
            idle_timeout: self.idle_timeout,
            max_frame_size: self.max_frame_size,
            max_packet_size: self.max_packet_size,
            connect_packet: self.connect_packet,
            stop,
        };
        let handle = SessionHandle {
            shared: Arc::clone(&shared),
        };
        let task = tokio::spawn(run(shared, state, forwarder));
        (handle, task)
    }
}

/// State owned by the read loop task.
struct LoopState<R> {
    reader: R,
    buffer: BytesMut,
    pending: BytesMut,
    idle_timeout: Duration,
    max_frame_size: usize,
    max_packet_size: usize,
    connect_packet: Option<Packet>,
    stop: watch::Receiver<bool>,
}

async fn run<S, F>(
    shared: Arc<SessionShared>,
    mut state: LoopState<ReadHalf<S>>,
    forwarder: F,
) -> SessionOutcome
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    F: PacketForwarder,
{
    info!(
        client_id = %shared.client_id,
        connection_id = %shared.connection_id,
        protocol = shared.protocol.as_str(),
        "session started"
    );
    let result = 'session: {
        let connect = state.connect_packet.take();
        if let Some(packet) = connect {
            let flow = forward_or_stop(&shared, &mut state.stop, &forwarder, packet).await;
            if let ControlFlow::Break(stopped) = flow {
                break 'session stopped;
            }
        }
        match shared.protocol {
            Protocol::Tcp => tcp::read_loop(&shared, &mut state, &forwarder).await,
            Protocol::WebSocket => websocket::read_loop(&shared, &mut state, &forwarder).await,
        }
    };
    drop(state);
    shared.finish(result).await
}

/// State shared between the read loop and every [`SessionHandle`].
struct SessionShared {
    client_id: String,
    connection_id: ConnectionId,
    protocol: Protocol,
    remote_addr: Option<SocketAddr>,
    connected_at: DateTime<Utc>,
    closed_at: OnceLock<DateTime<Utc>>,
    statistics_enabled: bool,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    ping_failures: AtomicU64,
    active: AtomicBool,
    evicted: AtomicBool,
    ping_in_flight: AtomicBool,
    /// Set when a write was abandoned part-way, so no close frame may follow.
    write_torn: AtomicBool,
    disconnect: OnceLock<DisconnectSignal>,
    /// Raised on a disconnect request and again on teardown.
    closing: watch::Sender<bool>,
    last_error: OnceLock<SessionError>,
    writer: Mutex<Option<BoxedWriter>>,
    framing: Framing,
}

impl SessionShared {
    fn record_read(&self, len: usize) {
        if self.statistics_enabled {
            let _ = self.bytes_read.fetch_add(len as u64, Ordering::Relaxed);
        }
    }

    fn record_written(&self, len: usize) {
        if self.statistics_enabled {
            let _ = self.bytes_written.fetch_add(len as u64, Ordering::Relaxed);
        }
    }

    /// Writes one complete wire unit under the writer lock.
    ///
    /// Gives up, releasing the lock, as soon as the session starts closing,
    /// so a peer that stopped reading cannot hold up teardown.
    async fn write_bytes(&self, bytes: &[u8]) -> Result<(), GatewayError> {
        let mut closing = self.closing.subscribe();
        let started = AtomicBool::new(false);
        let write = async {
            let mut guard = self.writer.lock().await;
            let Some(writer) = guard.as_mut() else {
                return Err(GatewayError::Disconnected(self.client_id.clone()));
            };
            started.store(true, Ordering::SeqCst);
            writer.write_all(bytes).await?;
            writer.flush().await?;
            self.record_written(bytes.len());
            Ok(())
        };
        tokio::select! {
            biased;
            () = stop_requested(&mut closing) => {
                if started.load(Ordering::SeqCst) {
                    self.write_torn.store(true, Ordering::SeqCst);
                }
                Err(GatewayError::Disconnected(self.client_id.clone()))
            }
            result = write => result,
        }
    }

    /// Sends a keep-alive ping on its own task, unless the previous one is
    /// still pending. A skipped or failed ping counts as a ping failure.
    fn spawn_ping(self: &Arc<Self>) {
        if self.ping_in_flight.swap(true, Ordering::SeqCst) {
            let _ = self.ping_failures.fetch_add(1, Ordering::Relaxed);
            debug!(client_id = %self.client_id, "previous ping still pending");
            return;
        }
        let shared = Arc::clone(self);
        drop(tokio::spawn(async move {
            if let Err(e) = shared.write_bytes(&build_ping_frame(PING_PAYLOAD)).await {
                let _ = shared.ping_failures.fetch_add(1, Ordering::Relaxed);
                warn!(client_id = %shared.client_id, error = %e, "failed to send ping");
            }
            shared.ping_in_flight.store(false, Ordering::SeqCst);
        }));
    }

    /// Records the first disconnect request and wakes the read loop.
    fn request_disconnect(&self, suppress: bool, cause: Option<SessionError>) -> bool {
        if self.disconnect.set(DisconnectSignal { suppress, cause }).is_err() {
            return false;
        }
        let _ = self.closing.send_replace(true);
        true
    }

    /// Result the read loop returns when stopped by a disconnect request.
    fn stop_result(&self) -> Result<(), SessionError> {
        match self.disconnect.get().and_then(|signal| signal.cause.clone()) {
            Some(cause) => Err(cause),
            None => Ok(()),
        }
    }

    /// Terminal result for a write the read loop could not complete.
    fn write_failed(&self, error: &GatewayError) -> Result<(), SessionError> {
        if self.disconnect.get().is_some() {
            return self.stop_result();
        }
        Err(SessionError::Transport(error.to_string()))
    }

    async fn finish(&self, result: Result<(), SessionError>) -> SessionOutcome {
        let _ = self.disconnect.set(DisconnectSignal::default());
        let _ = self.closing.send_replace(true);
        self.active.store(false, Ordering::SeqCst);
        let _ = self.closed_at.set(Utc::now().max(self.connected_at));
        if let Err(error) = &result {
            let _ = self.last_error.set(error.clone());
        }

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let send_close = matches!(self.framing, Framing::WebSocket { .. })
                && !matches!(result, Err(SessionError::Transport(_)))
                && !self.write_torn.load(Ordering::SeqCst);
            let teardown = async {
                if send_close {
                    let frame = build_close_frame(CLOSE_NORMAL);
                    writer.write_all(&frame).await?;
                    self.record_written(frame.len());
                }
                writer.shutdown().await
            };
            match tokio::time::timeout(TEARDOWN_TIMEOUT, teardown).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(client_id = %self.client_id, error = %e, "shutdown after close failed");
                }
                Err(_) => debug!(client_id = %self.client_id, "timed out closing the connection"),
            }
        }

        match &result {
            Ok(()) => info!(client_id = %self.client_id, "session closed"),
            Err(e) => info!(
                client_id = %self.client_id,
                error = %e,
                kind = ?e.kind(),
                "session closed"
            ),
        }
        SessionOutcome {
            record: self.snapshot(),
            suppressed: self.disconnect.get().is_some_and(|signal| signal.suppress),
            evicted: self.evicted.load(Ordering::SeqCst),
        }
    }

    fn snapshot(&self) -> ConnectionRecord {
        let status = if self.active.load(Ordering::SeqCst) {
            SessionStatus::Active
        } else {
            SessionStatus::Inactive
        };
        ConnectionRecord {
            client_id: self.client_id.clone(),
            connection_id: self.connection_id,
            protocol: self.protocol,
            remote_addr: self.remote_addr,
            connected_at: self.connected_at,
            closed_at: self.closed_at.get().copied(),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            ping_failures: self.ping_failures.load(Ordering::Relaxed),
            status,
            statistics_enabled: self.statistics_enabled,
            last_error: self.last_error.get().cloned(),
        }
    }
}

/// Cloneable reference to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<SessionShared>,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("client_id", &self.shared.client_id)
            .field("connection_id", &self.shared.connection_id)
            .field("protocol", &self.shared.protocol)
            .field("active", &self.is_active())
            .finish()
    }
}

impl SessionHandle {
    /// Client identifier.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.shared.client_id
    }

    /// Identifier of the underlying connection.
    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.shared.connection_id
    }

    /// Transport tag.
    #[must_use]
    pub fn protocol(&self) -> Protocol {
        self.shared.protocol
    }

    /// Returns `true` until the read loop exits.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Takes a snapshot of the session.
    #[must_use]
    pub fn snapshot(&self) -> ConnectionRecord {
        self.shared.snapshot()
    }

    /// Encodes and writes one packet, returning the bytes put on the wire.
    ///
    /// WebSocket sessions split the encoded packet into binary frames no
    /// larger than the configured frame size. Concurrent sends are
    /// serialized; their frames never interleave.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Disconnected`] once the session stopped,
    /// [`GatewayError::Codec`] if the packet cannot be encoded and
    /// [`GatewayError::Io`] if the write fails.
    pub async fn send(&self, packet: &Packet) -> Result<usize, GatewayError> {
        if !self.is_active() {
            return Err(GatewayError::Disconnected(self.shared.client_id.clone()));
        }
        let encoded = packet.to_bytes()?;
        let wire: Bytes = match self.shared.framing {
            Framing::Raw => encoded,
            Framing::WebSocket { max_frame_size } => {
                auto_chunk_binary_frames(&encoded, max_frame_size)
            }
        };
        self.shared.write_bytes(&wire).await?;
        Ok(wire.len())
    }

    /// Asks the session to stop; the disconnected hook will fire.
    ///
    /// Returns `false` if a disconnect was already requested.
    pub fn disconnect(&self) -> bool {
        self.shared.request_disconnect(false, None)
    }

    /// Asks the session to stop, optionally suppressing the disconnected
    /// hook and recording `cause` as its terminal error.
    pub(crate) fn disconnect_with(&self, suppress: bool, cause: Option<SessionError>) -> bool {
        self.shared.request_disconnect(suppress, cause)
    }

    /// Marks the session as replaced by a newer connection and stops it.
    ///
    /// The mark sticks even when a disconnect was already requested, so the
    /// disconnected hook still fires for a session closed and then taken
    /// over before its loop exited.
    pub(crate) fn evict(&self) {
        self.shared.evicted.store(true, Ordering::SeqCst);
        let _ = self.shared.request_disconnect(false, Some(SessionError::TakenOver));
    }
}

/// Resolves once the session is asked to stop.
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|closing| *closing).await;
}

/// Forwards `packet` unless the session is asked to stop first.
async fn forward_or_stop<F>(
    shared: &SessionShared,
    stop: &mut watch::Receiver<bool>,
    forwarder: &F,
    packet: Packet,
) -> ControlFlow<Result<(), SessionError>>
where
    F: PacketForwarder,
{
    tokio::select! {
        biased;
        () = stop_requested(stop) => ControlFlow::Break(shared.stop_result()),
        () = forwarder.forward(&shared.client_id, packet) => ControlFlow::Continue(()),
    }
}

fn protocol_error(error: CodecError) -> SessionError {
    SessionError::Protocol(error.to_string())
}

fn read_outcome(read: std::io::Result<usize>) -> Result<(), SessionError> {
    match read {
        Ok(0) => Err(SessionError::Transport("connection closed by peer".to_string())),
        Ok(_) => Ok(()),
        Err(e) => Err(SessionError::Transport(e.to_string())),
    }
}
