use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{PeerpodError, PeerpodResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The size of the fixed frame header.
pub const MESSAGE_HEADER_LENGTH: usize = 10;

/// The largest payload a frame may carry.
pub const MESSAGE_LENGTH_MAX: usize = 4 << 20;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The type byte of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// A request from client to server.
    Request,

    /// A response from server to client.
    Response,

    /// Any other type, kept so a peer speaking a newer protocol can be answered.
    Other(u8),
}

/// One length-prefixed message on a ttrpc connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The stream the frame belongs to. Clients use odd ids.
    pub stream_id: u32,

    /// The frame type.
    pub kind: FrameType,

    /// The frame flags.
    pub flags: u8,

    /// The protobuf-encoded request or response.
    pub payload: Bytes,
}

/// Splits a byte stream into [`Frame`]s and back.
///
/// The header is `length:u32be, stream_id:u32be, type:u8, flags:u8`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Frame {
    /// Creates a request frame.
    pub fn request(stream_id: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            stream_id,
            kind: FrameType::Request,
            flags: 0,
            payload: payload.into(),
        }
    }

    /// Creates a response frame.
    pub fn response(stream_id: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            stream_id,
            kind: FrameType::Response,
            flags: 0,
            payload: payload.into(),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl From<u8> for FrameType {
    fn from(value: u8) -> Self {
        match value {
            1 => FrameType::Request,
            2 => FrameType::Response,
            other => FrameType::Other(other),
        }
    }
}

impl From<FrameType> for u8 {
    fn from(value: FrameType) -> Self {
        match value {
            FrameType::Request => 1,
            FrameType::Response => 2,
            FrameType::Other(other) => other,
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = PeerpodError;

    fn decode(&mut self, src: &mut BytesMut) -> PeerpodResult<Option<Frame>> {
        if src.len() < MESSAGE_HEADER_LENGTH {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length > MESSAGE_LENGTH_MAX {
            return Err(PeerpodError::InvalidInput(format!(
                "ttrpc message of {length} bytes exceeds the {MESSAGE_LENGTH_MAX} byte limit"
            )));
        }

        if src.len() < MESSAGE_HEADER_LENGTH + length {
            src.reserve(MESSAGE_HEADER_LENGTH + length - src.len());
            return Ok(None);
        }

        let _ = src.get_u32();
        let stream_id = src.get_u32();
        let kind = FrameType::from(src.get_u8());
        let flags = src.get_u8();
        let payload = src.split_to(length).freeze();

        Ok(Some(Frame {
            stream_id,
            kind,
            flags,
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = PeerpodError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> PeerpodResult<()> {
        if frame.payload.len() > MESSAGE_LENGTH_MAX {
            return Err(PeerpodError::InvalidInput(format!(
                "ttrpc message of {} bytes exceeds the {MESSAGE_LENGTH_MAX} byte limit",
                frame.payload.len()
            )));
        }

        dst.reserve(MESSAGE_HEADER_LENGTH + frame.payload.len());
        dst.put_u32(frame.payload.len() as u32);
        dst.put_u32(frame.stream_id);
        dst.put_u8(frame.kind.into());
        dst.put_u8(frame.flags);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
