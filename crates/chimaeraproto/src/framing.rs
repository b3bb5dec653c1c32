//! Length-prefixed packet framing for stream transports.
//!
//! ```text
//! ┌──────────────┬──────────────────────┐
//! │ size: u32 BE │ packet (size bytes)  │
//! └──────────────┴──────────────────────┘
//! ```

use crate::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Largest packet accepted from a stream.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

const HEADER_LEN: usize = 4;

/// Append one framed packet to `dst`.
pub fn encode_frame(packet: &[u8], dst: &mut BytesMut) -> Result<(), ProtocolError> {
    if packet.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(packet.len()));
    }
    dst.reserve(HEADER_LEN + packet.len());
    dst.put_u32(packet.len() as u32);
    dst.put_slice(packet);
    Ok(())
}

/// Split the next complete packet off the front of `src`.
///
/// Returns `Ok(None)` when more bytes are needed.
pub fn decode_frame(src: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError> {
    if src.len() < HEADER_LEN {
        return Ok(None);
    }

    let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    if src.len() < HEADER_LEN + len {
        src.reserve(HEADER_LEN + len - src.len());
        return Ok(None);
    }

    src.advance(HEADER_LEN);
    Ok(Some(src.split_to(len).freeze()))
}
