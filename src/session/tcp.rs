//! Read loop for raw MQTT over TCP.

use std::ops::ControlFlow;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::Instant;

use super::{
    LoopState, PacketForwarder, SessionShared, forward_or_stop, protocol_error, read_outcome,
    stop_requested,
};
use crate::codec::mqtt::decode_packet;
use crate::error::SessionError;

/// Reads control packets until the session stops.
///
/// Every decoded packet resets the idle timer and is forwarded before the
/// next read. A forward still pending when the session is asked to stop is
/// abandoned. Returns `Ok(())` for a requested disconnect without a cause.
pub(super) async fn read_loop<R, F>(
    shared: &SessionShared,
    state: &mut LoopState<R>,
    forwarder: &F,
) -> Result<(), SessionError>
where
    R: AsyncRead + Send + Unpin,
    F: PacketForwarder,
{
    let idle = tokio::time::sleep(state.idle_timeout);
    tokio::pin!(idle);

    loop {
        while let Some((len, packet)) =
            decode_packet(&mut state.buffer, state.max_packet_size).map_err(protocol_error)?
        {
            shared.record_read(len);
            idle.as_mut().reset(Instant::now() + state.idle_timeout);
            if let ControlFlow::Break(stopped) =
                forward_or_stop(shared, &mut state.stop, forwarder, packet).await
            {
                return stopped;
            }
        }

        tokio::select! {
            biased;
            () = stop_requested(&mut state.stop) => return shared.stop_result(),
            () = &mut idle => return Err(SessionError::IdleTimeout),
            read = state.reader.read_buf(&mut state.buffer) => read_outcome(read)?,
        }
    }
}
