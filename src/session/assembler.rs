//! Continuation-frame reassembly.

use bytes::{Bytes, BytesMut};

use crate::codec::Frame;
use crate::error::CodecError;

/// Joins fragmented WebSocket data frames into complete messages.
///
/// A data frame with FIN clear is buffered; the next frame with FIN set
/// completes the message. A final frame with nothing buffered is a complete
/// message on its own and is returned without copying. A fragmented message
/// may not grow past `max_message_size` bytes.
#[derive(Debug)]
pub struct MessageAssembler {
    pending: BytesMut,
    fragmented: bool,
    max_message_size: usize,
}

impl MessageAssembler {
    /// Creates an empty assembler.
    #[must_use]
    pub fn new(max_message_size: usize) -> Self {
        Self {
            pending: BytesMut::new(),
            fragmented: false,
            max_message_size,
        }
    }

    /// Feeds one data frame, returning the message it completes, if any.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::MessageTooLarge`] once the buffered fragments
    /// exceed the limit; the buffer is discarded.
    pub fn push(&mut self, frame: Frame) -> Result<Option<Bytes>, CodecError> {
        if frame.fin && !self.fragmented {
            return Ok(Some(frame.payload));
        }
        let size = self.pending.len() + frame.payload.len();
        if size > self.max_message_size {
            self.pending.clear();
            self.fragmented = false;
            return Err(CodecError::MessageTooLarge {
                size,
                max: self.max_message_size,
            });
        }
        self.pending.extend_from_slice(&frame.payload);
        if !frame.fin {
            self.fragmented = true;
            return Ok(None);
        }
        self.fragmented = false;
        Ok(Some(self.pending.split().freeze()))
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::codec::Opcode;

    fn frame(fin: bool, opcode: Opcode, payload: &'static [u8]) -> Frame {
        Frame {
            fin,
            opcode,
            payload: Bytes::from_static(payload),
        }
    }

    #[test]
    fn single_final_frame_passes_through() {
        let mut assembler = MessageAssembler::new(64);
        let message = assembler.push(frame(true, Opcode::Binary, b"abc"));
        assert_eq!(message, Ok(Some(Bytes::from_static(b"abc"))));
    }

    #[test]
    fn fragments_are_joined_in_order() {
        let mut assembler = MessageAssembler::new(64);
        assert_eq!(assembler.push(frame(false, Opcode::Binary, b"ab")), Ok(None));
        assert_eq!(assembler.push(frame(false, Opcode::Continuation, b"cd")), Ok(None));
        let Ok(Some(message)) = assembler.push(frame(true, Opcode::Continuation, b"ef")) else {
            panic!("final fragment did not complete the message");
        };
        assert_eq!(&message[..], b"abcdef");
    }

    #[test]
    fn assembler_is_reusable_after_a_message() {
        let mut assembler = MessageAssembler::new(64);
        let _ = assembler.push(frame(false, Opcode::Binary, b"x"));
        let _ = assembler.push(frame(true, Opcode::Continuation, b"y"));
        let message = assembler.push(frame(true, Opcode::Binary, b"z"));
        assert_eq!(message, Ok(Some(Bytes::from_static(b"z"))));
    }

    #[test]
    fn empty_final_fragment_still_completes() {
        let mut assembler = MessageAssembler::new(64);
        let _ = assembler.push(frame(false, Opcode::Binary, b"only"));
        let message = assembler.push(frame(true, Opcode::Continuation, b""));
        assert_eq!(message, Ok(Some(Bytes::from_static(b"only"))));
    }

    #[test]
    fn endless_fragments_hit_the_limit() {
        let mut assembler = MessageAssembler::new(8);
        assert_eq!(assembler.push(frame(false, Opcode::Binary, b"1234")), Ok(None));
        assert_eq!(assembler.push(frame(false, Opcode::Continuation, b"5678")), Ok(None));
        assert_eq!(
            assembler.push(frame(false, Opcode::Continuation, b"9")),
            Err(CodecError::MessageTooLarge { size: 9, max: 8 })
        );

        // The discarded message does not leak into the next one.
        let message = assembler.push(frame(true, Opcode::Binary, b"ok"));
        assert_eq!(message, Ok(Some(Bytes::from_static(b"ok"))));
    }
}
