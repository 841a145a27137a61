//! Wire framing.
//!
//! Frames are a u32 big-endian length prefix followed by a bincode
//! body. The decoder is incremental: it consumes nothing until a whole
//! frame is buffered, so it can be fed straight from a read loop.

use crate::core::constants::MAX_FRAME_LEN;
use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Length of the frame header.
pub const HEADER_LEN: usize = 4;

/// Result of one decode attempt.
#[derive(Debug)]
pub enum DecodeResult<T> {
    /// A full frame was decoded and consumed from the buffer.
    Complete(T),
    /// More data is needed; the buffer is untouched.
    Incomplete,
    /// The data is malformed; the connection should be dropped.
    Invalid(String),
}

/// Length-prefixed bincode codec.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_len: usize,
}

impl FrameCodec {
    /// Codec with the default frame cap.
    pub fn new() -> Self {
        Self {
            max_frame_len: MAX_FRAME_LEN,
        }
    }

    /// Codec with a custom frame cap (tests).
    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }

    /// Append one encoded frame to the buffer.
    pub fn encode<T: Serialize>(&self, message: &T, buffer: &mut BytesMut) -> Result<(), String> {
        let body = bincode::serialize(message).map_err(|e| format!("encode failed: {e}"))?;
        if body.len() > self.max_frame_len {
            return Err(format!(
                "frame of {} bytes exceeds cap of {}",
                body.len(),
                self.max_frame_len
            ));
        }
        buffer.reserve(HEADER_LEN + body.len());
        buffer.put_u32(body.len() as u32);
        buffer.put_slice(&body);
        Ok(())
    }

    /// Attempt to decode one frame from the front of the buffer.
    pub fn decode<T: DeserializeOwned>(&self, buffer: &mut BytesMut) -> DecodeResult<T> {
        if buffer.len() < HEADER_LEN {
            return DecodeResult::Incomplete;
        }

        let body_len = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
        if body_len > self.max_frame_len {
            return DecodeResult::Invalid(format!(
                "frame of {body_len} bytes exceeds cap of {}",
                self.max_frame_len
            ));
        }
        if buffer.len() < HEADER_LEN + body_len {
            return DecodeResult::Incomplete;
        }

        buffer.advance(HEADER_LEN);
        let body = buffer.split_to(body_len);
        match bincode::deserialize(&body) {
            Ok(message) => DecodeResult::Complete(message),
            Err(e) => DecodeResult::Invalid(format!("decode failed: {e}")),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}
