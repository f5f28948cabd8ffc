//! Core Looplink protocol types, framing, and transport.
//!
//! This crate provides:
//! - Loop addressing (`LoopAddr`, `LoopMeta`) and Data payloads
//! - The frame codec spoken between an app and its host
//! - `Transport`: request/response calls over a byte stream

#![forbid(unsafe_code)]

pub mod addr;
pub mod frame;
pub mod transport;

pub use addr::{DataFrame, LoopAddr, LoopMeta, LOOP_ADDR_LEN, LOOP_META_LEN, MAX_DATA_LEN};
pub use frame::{Frame, FrameError, FrameHeader, FrameKind, FRAME_HEADER_SIZE, MAX_FRAME_PAYLOAD};
pub use transport::{FrameHandler, FramedTransport, Transport, TransportConfig, TransportError};

/// Version of the app/host protocol reported in app metadata.
pub const PROTOCOL_VERSION: &str = "0.0.1";
