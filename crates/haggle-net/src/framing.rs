//! Message framing for the object exchange protocol
//!
//! A data object travels as one `Object` frame carrying the metadata
//! document, followed by `Data` frames carrying payload chunks until the
//! advertised `data_len` is reached. The receiver answers with `Accept` or
//! `Reject` (reject means its bloom filter already has the object).

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Maximum frame size (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Payload chunk size used by senders
pub const DATA_CHUNK_SIZE: usize = 64 * 1024;

/// Framing errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    TooLarge(usize),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown frame type: {0}")]
    UnknownType(u8),
}

/// A framed message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub payload: Vec<u8>,
}

/// Frame types
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Data object metadata document
    Object = 1,
    /// Payload chunk
    Data = 2,
    /// Receiver wants (or has fully received) the object
    Accept = 3,
    /// Receiver refuses the object (already has it)
    Reject = 4,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Object),
            2 => Ok(Self::Data),
            3 => Ok(Self::Accept),
            4 => Ok(Self::Reject),
            other => Err(FrameError::UnknownType(other)),
        }
    }
}

impl Frame {
    pub fn new(frame_type: FrameType, payload: Vec<u8>) -> Self {
        Frame {
            frame_type,
            payload,
        }
    }

    pub fn object(metadata: Vec<u8>) -> Self {
        Self::new(FrameType::Object, metadata)
    }

    pub fn data(chunk: Vec<u8>) -> Self {
        Self::new(FrameType::Data, chunk)
    }

    pub fn accept() -> Self {
        Self::new(FrameType::Accept, vec![])
    }

    pub fn reject() -> Self {
        Self::new(FrameType::Reject, vec![])
    }
}

/// Codec for length-prefixed frames
///
/// Wire format:
/// - 4 bytes: length (big-endian, includes type byte)
/// - 1 byte: frame type
/// - N bytes: payload
#[derive(Default)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        FrameCodec
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least 5 bytes (4 length + 1 type)
        if src.len() < 5 {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(length));
        }
        if src.len() < 4 + length {
            return Ok(None);
        }

        src.advance(4);
        let frame_type = FrameType::try_from(src[0])?;
        src.advance(1);
        let payload = src.split_to(length - 1).to_vec();

        Ok(Some(Frame {
            frame_type,
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length = 1 + item.payload.len();
        if length > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(length));
        }
        dst.put_u32(length as u32);
        dst.put_u8(item.frame_type as u8);
        dst.put_slice(&item.payload);
        Ok(())
    }
}
