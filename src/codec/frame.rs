//! RFC 6455 WebSocket frames.
//!
//! The decoder accepts masked (client) and unmasked frames; the encoders
//! produce unmasked server frames, except [`encode_masked_frame`] which
//! builds client frames.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::CodecError;

/// Default maximum payload of a single frame, for reading and chunking.
pub const DEFAULT_MAX_FRAME_PAYLOAD: usize = 64 * 1024;

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Frame opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Continuation of a fragmented message.
    Continuation,
    /// UTF-8 text data.
    Text,
    /// Binary data.
    Binary,
    /// Connection close.
    Close,
    /// Ping.
    Ping,
    /// Pong.
    Pong,
    /// Reserved opcode (3-7, 11-15).
    Reserved(u8),
}

impl Opcode {
    /// Returns the 4-bit wire code.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
            Self::Reserved(code) => code & 0x0F,
        }
    }

    /// Returns `true` for close, ping and pong.
    #[must_use]
    pub const fn is_control(self) -> bool {
        self.code() & 0x08 != 0
    }
}

impl From<u8> for Opcode {
    fn from(code: u8) -> Self {
        match code & 0x0F {
            0x0 => Self::Continuation,
            0x1 => Self::Text,
            0x2 => Self::Binary,
            0x8 => Self::Close,
            0x9 => Self::Ping,
            0xA => Self::Pong,
            other => Self::Reserved(other),
        }
    }
}

/// A decoded (unmasked) frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment of a message.
    pub fin: bool,
    /// Frame opcode.
    pub opcode: Opcode,
    /// Unmasked payload.
    pub payload: Bytes,
}

/// Decodes one frame from the front of `buf`.
///
/// Returns `Ok(None)` until a whole frame is buffered. On success the
/// frame's bytes are consumed and its wire length returned with it.
///
/// # Errors
///
/// Returns a [`CodecError`] when RSV bits are set, a control frame is
/// fragmented or longer than 125 bytes, or the payload exceeds
/// `max_payload`.
pub fn decode_frame(
    buf: &mut BytesMut,
    max_payload: usize,
) -> Result<Option<(usize, Frame)>, CodecError> {
    let mut peek: &[u8] = buf;
    if peek.remaining() < 2 {
        return Ok(None);
    }
    let first = peek.get_u8();
    let second = peek.get_u8();

    if first & 0x70 != 0 {
        return Err(CodecError::ReservedBits);
    }
    let fin = first & 0x80 != 0;
    let opcode = Opcode::from(first);
    let masked = second & 0x80 != 0;

    let declared = match second & 0x7F {
        126 => {
            if peek.remaining() < 2 {
                return Ok(None);
            }
            u64::from(peek.get_u16())
        }
        127 => {
            if peek.remaining() < 8 {
                return Ok(None);
            }
            peek.get_u64()
        }
        len => u64::from(len),
    };

    if opcode.is_control() {
        if !fin {
            return Err(CodecError::InvalidControlFrame(format!(
                "fragmented {opcode:?} frame"
            )));
        }
        if declared > MAX_CONTROL_PAYLOAD as u64 {
            return Err(CodecError::InvalidControlFrame(format!(
                "{opcode:?} payload of {declared} bytes"
            )));
        }
    }
    let payload_len = usize::try_from(declared)
        .ok()
        .filter(|len| *len <= max_payload)
        .ok_or(CodecError::FrameTooLarge {
            size: declared,
            max: max_payload,
        })?;

    let mut mask = [0u8; 4];
    if masked {
        if peek.remaining() < 4 {
            return Ok(None);
        }
        peek.copy_to_slice(&mut mask);
    }
    if peek.remaining() < payload_len {
        return Ok(None);
    }

    let header_len = buf.len() - peek.remaining();
    buf.advance(header_len);
    let mut payload = buf.split_to(payload_len);
    if masked {
        apply_mask(&mut payload, mask);
    }
    Ok(Some((
        header_len + payload_len,
        Frame {
            fin,
            opcode,
            payload: payload.freeze(),
        },
    )))
}

/// Appends an unmasked frame to `dst`.
pub fn encode_frame(dst: &mut BytesMut, fin: bool, opcode: Opcode, payload: &[u8]) {
    put_header(dst, fin, opcode, payload.len(), false);
    dst.extend_from_slice(payload);
}

/// Appends a masked (client-to-server) frame to `dst`.
pub fn encode_masked_frame(
    dst: &mut BytesMut,
    fin: bool,
    opcode: Opcode,
    payload: &[u8],
    mask: [u8; 4],
) {
    put_header(dst, fin, opcode, payload.len(), true);
    dst.extend_from_slice(&mask);
    let start = dst.len();
    dst.extend_from_slice(payload);
    if let Some(tail) = dst.get_mut(start..) {
        apply_mask(tail, mask);
    }
}

/// Builds a ping frame carrying `payload`.
#[must_use]
pub fn build_ping_frame(payload: &[u8]) -> Bytes {
    single_frame(Opcode::Ping, payload)
}

/// Builds a pong frame echoing `payload`.
#[must_use]
pub fn build_pong_frame(payload: &[u8]) -> Bytes {
    single_frame(Opcode::Pong, payload)
}

/// Builds a close frame with the given status code.
#[must_use]
pub fn build_close_frame(code: u16) -> Bytes {
    single_frame(Opcode::Close, &code.to_be_bytes())
}

/// Splits `payload` into binary frames of at most `max_payload` bytes each.
///
/// The first frame is `Binary`, the rest `Continuation`, the last has FIN
/// set. An empty payload yields one empty binary frame.
#[must_use]
pub fn auto_chunk_binary_frames(payload: &[u8], max_payload: usize) -> Bytes {
    let max_payload = max_payload.max(1);
    let frames = payload.len().div_ceil(max_payload).max(1);
    let mut dst = BytesMut::with_capacity(payload.len() + frames * 10);
    if payload.is_empty() {
        encode_frame(&mut dst, true, Opcode::Binary, payload);
        return dst.freeze();
    }
    for (index, chunk) in payload.chunks(max_payload).enumerate() {
        let opcode = if index == 0 {
            Opcode::Binary
        } else {
            Opcode::Continuation
        };
        encode_frame(&mut dst, index + 1 == frames, opcode, chunk);
    }
    dst.freeze()
}

fn single_frame(opcode: Opcode, payload: &[u8]) -> Bytes {
    let mut dst = BytesMut::with_capacity(payload.len() + 2);
    encode_frame(&mut dst, true, opcode, payload);
    dst.freeze()
}

fn put_header(dst: &mut BytesMut, fin: bool, opcode: Opcode, len: usize, masked: bool) {
    let fin_bit = if fin { 0x80 } else { 0x00 };
    dst.put_u8(fin_bit | opcode.code());
    let mask_bit = if masked { 0x80 } else { 0x00 };
    match len {
        0..=125 => dst.put_u8(mask_bit | len as u8),
        126..=65_535 => {
            dst.put_u8(mask_bit | 126);
            dst.put_u16(len as u16);
        }
        _ => {
            dst.put_u8(mask_bit | 127);
            dst.put_u64(len as u64);
        }
    }
}

fn apply_mask(payload: &mut [u8], mask: [u8; 4]) {
    for (byte, key) in payload.iter_mut().zip(mask.iter().cycle()) {
        *byte ^= key;
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    const MASK: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

    #[test]
    fn decodes_masked_client_frame() {
        // RFC 6455 section 5.7: masked "Hello"
        let wire = [0x81u8, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58];
        let mut buf = BytesMut::from(&wire[..]);
        let Ok(Some((len, frame))) = decode_frame(&mut buf, DEFAULT_MAX_FRAME_PAYLOAD) else {
            panic!("expected frame");
        };
        assert_eq!(len, wire.len());
        assert!(frame.fin);
        assert_eq!(frame.opcode, Opcode::Text);
        assert_eq!(frame.payload.as_ref(), b"Hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn incomplete_frame_waits_for_more_bytes() {
        let mut encoded = BytesMut::new();
        encode_masked_frame(&mut encoded, true, Opcode::Binary, &[1u8; 300], MASK);
        let full = encoded.freeze();

        for cut in [1usize, 3, 7, 100] {
            let mut buf = BytesMut::from(full.slice(..cut).as_ref());
            assert!(matches!(decode_frame(&mut buf, DEFAULT_MAX_FRAME_PAYLOAD), Ok(None)));
            assert_eq!(buf.len(), cut);
        }
        let mut buf = BytesMut::from(full.as_ref());
        let Ok(Some((len, frame))) = decode_frame(&mut buf, DEFAULT_MAX_FRAME_PAYLOAD) else {
            panic!("expected frame");
        };
        assert_eq!(len, full.len());
        assert_eq!(frame.payload.as_ref(), &[1u8; 300][..]);
    }

    #[test]
    fn rejects_reserved_bits_and_oversized_payloads() {
        let mut buf = BytesMut::from(&[0xC2u8, 0x00][..]);
        assert_eq!(decode_frame(&mut buf, 16), Err(CodecError::ReservedBits));

        let mut encoded = BytesMut::new();
        encode_frame(&mut encoded, true, Opcode::Binary, &[0u8; 32]);
        assert_eq!(
            decode_frame(&mut encoded, 16),
            Err(CodecError::FrameTooLarge { size: 32, max: 16 })
        );
    }

    #[test]
    fn rejects_fragmented_control_frame() {
        let mut encoded = BytesMut::new();
        encode_frame(&mut encoded, false, Opcode::Ping, b"x");
        assert!(matches!(
            decode_frame(&mut encoded, DEFAULT_MAX_FRAME_PAYLOAD),
            Err(CodecError::InvalidControlFrame(_))
        ));
    }

    #[test]
    fn auto_chunk_splits_into_continuations() {
        let payload: Vec<u8> = (0..10u8).collect();
        let mut wire = BytesMut::from(auto_chunk_binary_frames(&payload, 4).as_ref());

        let mut frames = Vec::new();
        while let Ok(Some((_, frame))) = decode_frame(&mut wire, 4) {
            frames.push(frame);
        }
        let shape: Vec<(bool, Opcode, usize)> = frames
            .iter()
            .map(|f| (f.fin, f.opcode, f.payload.len()))
            .collect();
        assert_eq!(
            shape,
            vec![
                (false, Opcode::Binary, 4),
                (false, Opcode::Continuation, 4),
                (true, Opcode::Continuation, 2),
            ]
        );
        let joined: Vec<u8> = frames.iter().flat_map(|f| f.payload.to_vec()).collect();
        assert_eq!(joined, payload);
    }

    #[test]
    fn empty_payload_is_one_binary_frame() {
        let wire = auto_chunk_binary_frames(&[], 4);
        assert_eq!(wire.as_ref(), &[0x82u8, 0x00][..]);
    }

    #[test]
    fn extended_lengths_round_trip() {
        for len in [126usize, 70_000] {
            let payload = vec![9u8; len];
            let mut buf = BytesMut::new();
            encode_frame(&mut buf, true, Opcode::Binary, &payload);
            let Ok(Some((_, frame))) = decode_frame(&mut buf, 100_000) else {
                panic!("expected frame of {len} bytes");
            };
            assert_eq!(frame.payload.len(), len);
        }
    }

    #[test]
    fn pong_echoes_ping_payload() {
        let mut buf = BytesMut::from(build_pong_frame(b"abc").as_ref());
        let Ok(Some((_, frame))) = decode_frame(&mut buf, DEFAULT_MAX_FRAME_PAYLOAD) else {
            panic!("expected pong");
        };
        assert_eq!(frame.opcode, Opcode::Pong);
        assert_eq!(frame.payload.as_ref(), b"abc");
    }
}
