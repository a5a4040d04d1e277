//! Length-prefixed TCP framing.
//!
//! Wire format: `[u32 big-endian payload length][payload]`. Only the raw TCP
//! transport uses it; UDP datagrams and WebSocket messages carry their own
//! boundaries.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Size of the length header.
pub const FRAME_HEADER_LEN: usize = 4;

/// Default payload limit used when none is configured.
pub const DEFAULT_MAX_FRAME_LEN: usize = 2 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    /// The buffer does not yet hold the whole frame.
    #[error("incomplete frame: {needed} more bytes required")]
    IncompleteFrame { needed: usize },

    #[error("frame length {length} exceeds limit {limit}")]
    TooLarge { length: usize, limit: usize },

    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Prefix `payload` with its 4-byte big-endian length.
pub fn encode(payload: &[u8]) -> Result<Bytes, FrameError> {
    let length = u32::try_from(payload.len()).map_err(|_| FrameError::TooLarge {
        length: payload.len(),
        limit: u32::MAX as usize,
    })?;

    let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.put_u32(length);
    frame.extend_from_slice(payload);
    Ok(frame.freeze())
}

/// Strip the length header from the first frame in `buf`.
///
/// Bytes after the declared payload belong to the next frame and are
/// ignored here.
pub fn decode(buf: &[u8]) -> Result<&[u8], FrameError> {
    if buf.len() < FRAME_HEADER_LEN {
        return Err(FrameError::IncompleteFrame {
            needed: FRAME_HEADER_LEN - buf.len(),
        });
    }

    let declared = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let available = buf.len() - FRAME_HEADER_LEN;
    if available < declared {
        return Err(FrameError::IncompleteFrame {
            needed: declared - available,
        });
    }

    Ok(&buf[FRAME_HEADER_LEN..FRAME_HEADER_LEN + declared])
}

/// Streaming codec used by the TCP transport.
///
/// Partial frames stay buffered inside the `FramedRead` until the rest
/// arrives, so `IncompleteFrame` never reaches the pipeline.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_len: usize,
}

impl FrameCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let declared = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if declared > self.max_frame_len {
            return Err(FrameError::TooLarge {
                length: declared,
                limit: self.max_frame_len,
            });
        }

        let frame_len = FRAME_HEADER_LEN + declared;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_LEN);
        Ok(Some(src.split_to(declared).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), FrameError> {
        if payload.len() > self.max_frame_len {
            return Err(FrameError::TooLarge {
                length: payload.len(),
                limit: self.max_frame_len,
            });
        }
        dst.reserve(FRAME_HEADER_LEN + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}
