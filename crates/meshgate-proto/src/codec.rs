//! Length-prefixed framing for peer connections

use crate::message::Message;
use crate::MAX_FRAME_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Truncated payload: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("Unknown action: {0}")]
    UnknownAction(u8),

    #[error("Invalid role flag in hello: {0}")]
    InvalidRole(u32),

    #[error("Invalid gate port: {0}")]
    InvalidPort(u32),

    #[error("Error body must be 1..=255 bytes, got {0}")]
    ErrorBodyTooLarge(usize),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Frame codec: `[length: u32][payload]`, payload at most 10MB
///
/// Decoding accumulates across arbitrary read boundaries and yields a
/// payload once its declared length is fully buffered. An oversized
/// declared length is fatal for the connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl FrameCodec {
    pub const LENGTH_SIZE: usize = 4;

    pub fn new() -> Self {
        Self
    }

    /// Frame a raw payload
    pub fn encode_frame(payload: &[u8]) -> Result<Bytes, CodecError> {
        if payload.len() > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(payload.len()));
        }

        let mut buf = BytesMut::with_capacity(Self::LENGTH_SIZE + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.put_slice(payload);
        Ok(buf.freeze())
    }

    /// Encode and frame a message
    pub fn encode_message(msg: &Message) -> Result<Bytes, CodecError> {
        Self::encode_frame(&msg.encode()?)
    }

    /// Try to decode every complete payload buffered so far
    pub fn decode_all(&mut self, buf: &mut BytesMut) -> Result<Vec<Bytes>, CodecError> {
        let mut frames = Vec::new();
        while let Some(frame) = self.decode(buf)? {
            frames.push(frame);
        }
        Ok(frames)
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = CodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if buf.len() < Self::LENGTH_SIZE {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&buf[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(length));
        }

        if buf.len() < Self::LENGTH_SIZE + length {
            buf.reserve(Self::LENGTH_SIZE + length - buf.len());
            return Ok(None);
        }

        buf.advance(Self::LENGTH_SIZE);
        Ok(Some(buf.split_to(length).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if payload.len() > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(payload.len()));
        }
        dst.reserve(Self::LENGTH_SIZE + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);
        Ok(())
    }
}
