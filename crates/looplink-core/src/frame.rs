//! Frame wire protocol between an app and its host.
//!
//! Every frame on the link shares a 5-byte header:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Kind      |            Call ID            |    Length     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |    Length     |  Payload ...
//! +-+-+-+-+-+-+-+-+
//! ```
//!
//! Request kinds carry a loop-level [`Frame`]. Each request is answered by
//! exactly one response frame with the same call ID.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::addr::{DataFrame, LoopAddr, LoopMeta};

/// Frame header size in bytes.
pub const FRAME_HEADER_SIZE: usize = 5;

/// Largest payload the length field can describe.
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

/// Frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameKind {
    /// App asks the host to open a loop to a remote address.
    CreateLoop = 0x01,
    /// Host announces a loop opened by a remote peer.
    ConfirmLoop = 0x02,
    /// Either side tears a loop down.
    CloseLoop = 0x03,
    /// Bytes flowing over a loop.
    Data = 0x04,
    /// Successful response to a request.
    ResponseOk = 0x80,
    /// Failed response; payload is a UTF-8 error message.
    ResponseErr = 0x81,
}

impl FrameKind {
    pub fn is_response(self) -> bool {
        matches!(self, Self::ResponseOk | Self::ResponseErr)
    }
}

impl TryFrom<u8> for FrameKind {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::CreateLoop),
            0x02 => Ok(Self::ConfirmLoop),
            0x03 => Ok(Self::CloseLoop),
            0x04 => Ok(Self::Data),
            0x80 => Ok(Self::ResponseOk),
            0x81 => Ok(Self::ResponseErr),
            _ => Err(FrameError::UnknownKind(value)),
        }
    }
}

/// Frame codec errors.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too short: {0} bytes, minimum {1}")]
    TooShort(usize, usize),

    #[error("invalid {what} length: expected {expected}, got {actual}")]
    InvalidLength {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("unknown frame kind: 0x{0:02x}")]
    UnknownKind(u8),

    #[error("payload too large: {0} bytes, maximum {1}")]
    TooLarge(usize, usize),

    #[error("{0:?} is a response, not a request")]
    NotARequest(FrameKind),

    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: FrameKind,
    /// Correlates a response with its request.
    pub id: u16,
    /// Payload length.
    pub len: u16,
}

impl FrameHeader {
    pub fn new(kind: FrameKind, id: u16, len: usize) -> Result<Self, FrameError> {
        let len =
            u16::try_from(len).map_err(|_| FrameError::TooLarge(len, MAX_FRAME_PAYLOAD))?;
        Ok(Self { kind, id, len })
    }

    /// Encode header to bytes.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, FrameError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(FrameError::TooShort(buf.len(), FRAME_HEADER_SIZE));
        }

        buf[0] = self.kind as u8;
        buf[1..3].copy_from_slice(&self.id.to_be_bytes());
        buf[3..5].copy_from_slice(&self.len.to_be_bytes());

        Ok(FRAME_HEADER_SIZE)
    }

    /// Decode header from bytes.
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(FrameError::TooShort(buf.len(), FRAME_HEADER_SIZE));
        }

        let kind = FrameKind::try_from(buf[0])?;
        let id = u16::from_be_bytes([buf[1], buf[2]]);
        let len = u16::from_be_bytes([buf[3], buf[4]]);

        Ok(Self { kind, id, len })
    }
}

/// A loop-level request frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    CreateLoop(LoopAddr),
    ConfirmLoop(LoopMeta),
    CloseLoop(LoopMeta),
    Data(DataFrame),
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Self::CreateLoop(_) => FrameKind::CreateLoop,
            Self::ConfirmLoop(_) => FrameKind::ConfirmLoop,
            Self::CloseLoop(_) => FrameKind::CloseLoop,
            Self::Data(_) => FrameKind::Data,
        }
    }

    pub fn encode_payload(&self) -> Bytes {
        match self {
            Self::CreateLoop(addr) => addr.to_bytes(),
            Self::ConfirmLoop(meta) | Self::CloseLoop(meta) => meta.to_bytes(),
            Self::Data(df) => {
                let mut buf = BytesMut::with_capacity(df.encoded_len());
                df.encode(&mut buf);
                buf.freeze()
            }
        }
    }

    /// Encode header and payload into one buffer.
    pub fn encode(&self, id: u16) -> Result<Bytes, FrameError> {
        let payload = self.encode_payload();
        let header = FrameHeader::new(self.kind(), id, payload.len())?;

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
        buf.put_bytes(0, FRAME_HEADER_SIZE);
        header.encode(&mut buf[..FRAME_HEADER_SIZE])?;
        buf.put_slice(&payload);
        Ok(buf.freeze())
    }

    /// Decode a request payload of the given kind.
    pub fn decode(kind: FrameKind, payload: Bytes) -> Result<Self, FrameError> {
        match kind {
            FrameKind::CreateLoop => Ok(Self::CreateLoop(LoopAddr::decode(&payload)?)),
            FrameKind::ConfirmLoop => Ok(Self::ConfirmLoop(LoopMeta::decode(&payload)?)),
            FrameKind::CloseLoop => Ok(Self::CloseLoop(LoopMeta::decode(&payload)?)),
            FrameKind::Data => Ok(Self::Data(DataFrame::decode(payload)?)),
            FrameKind::ResponseOk | FrameKind::ResponseErr => Err(FrameError::NotARequest(kind)),
        }
    }

    /// Decode a complete frame (header and payload) from a buffer.
    pub fn decode_packet(buf: Bytes) -> Result<(u16, Self), FrameError> {
        let header = FrameHeader::decode(&buf)?;
        let end = FRAME_HEADER_SIZE + header.len as usize;
        if buf.len() != end {
            return Err(FrameError::InvalidLength {
                what: "frame",
                expected: end,
                actual: buf.len(),
            });
        }
        let frame = Self::decode(header.kind, buf.slice(FRAME_HEADER_SIZE..))?;
        Ok((header.id, frame))
    }
}
