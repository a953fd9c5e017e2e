//! Read loop for MQTT carried in WebSocket frames.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

use super::{
    LoopState, MessageAssembler, PING_LEAD, PacketForwarder, SessionShared, forward_or_stop,
    protocol_error, read_outcome, stop_requested,
};
use crate::codec::Opcode;
use crate::codec::frame::{build_pong_frame, decode_frame};
use crate::codec::mqtt::read_stream;
use crate::error::SessionError;

/// Reads frames until the session stops.
///
/// Each frame resets the idle timer. Pings are answered inline, data frames
/// are reassembled into messages and the messages decoded into packets. A
/// ping is sent every `idle_timeout - 5s` on a separate task; a tick is
/// skipped while the previous ping is still being written.
pub(super) async fn read_loop<R, F>(
    shared: &Arc<SessionShared>,
    state: &mut LoopState<R>,
    forwarder: &F,
) -> Result<(), SessionError>
where
    R: AsyncRead + Send + Unpin,
    F: PacketForwarder,
{
    for packet in read_stream(&mut state.pending, state.max_packet_size).map_err(protocol_error)? {
        if let ControlFlow::Break(stopped) =
            forward_or_stop(shared, &mut state.stop, forwarder, packet).await
        {
            return stopped;
        }
    }

    let idle = tokio::time::sleep(state.idle_timeout);
    tokio::pin!(idle);
    let period = state
        .idle_timeout
        .saturating_sub(PING_LEAD)
        .max(Duration::from_secs(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut assembler = MessageAssembler::new(state.max_packet_size);

    loop {
        while let Some((len, frame)) =
            decode_frame(&mut state.buffer, state.max_frame_size).map_err(protocol_error)?
        {
            shared.record_read(len);
            idle.as_mut().reset(Instant::now() + state.idle_timeout);

            match frame.opcode {
                Opcode::Ping => {
                    if let Err(e) = shared.write_bytes(&build_pong_frame(&frame.payload)).await {
                        return shared.write_failed(&e);
                    }
                }
                Opcode::Pong => {}
                Opcode::Close => {
                    debug!(client_id = %shared.client_id, "close frame received");
                    return Ok(());
                }
                Opcode::Continuation | Opcode::Text | Opcode::Binary => {
                    let Some(message) = assembler.push(frame).map_err(protocol_error)? else {
                        continue;
                    };
                    state.pending.extend_from_slice(&message);
                    let packets = read_stream(&mut state.pending, state.max_packet_size)
                        .map_err(protocol_error)?;
                    for packet in packets {
                        if let ControlFlow::Break(stopped) =
                            forward_or_stop(shared, &mut state.stop, forwarder, packet).await
                        {
                            return stopped;
                        }
                    }
                }
                Opcode::Reserved(code) => {
                    return Err(SessionError::Protocol(format!(
                        "unknown opcode {code:#x}"
                    )));
                }
            }
        }

        tokio::select! {
            biased;
            () = stop_requested(&mut state.stop) => return shared.stop_result(),
            () = &mut idle => return Err(SessionError::IdleTimeout),
            _ = ticker.tick() => shared.spawn_ping(),
            read = state.reader.read_buf(&mut state.buffer) => read_outcome(read)?,
        }
    }
}
