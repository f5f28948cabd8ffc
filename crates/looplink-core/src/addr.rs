//! Loop addressing.
//!
//! # Encoding
//!
//! ```text
//! LoopAddr  = [public key (32 bytes)] [port (2 bytes, big-endian)]
//! LoopMeta  = [local LoopAddr] [remote LoopAddr]
//! DataFrame = [LoopMeta] [data (rest of payload)]
//! ```

use std::fmt;
use std::str::FromStr;

use bytes::{BufMut, Bytes, BytesMut};
use looplink_crypto::keys::{PubKey, PUBLIC_KEY_LEN};
use serde::{Deserialize, Serialize};

use crate::frame::{FrameError, MAX_FRAME_PAYLOAD};

/// Encoded size of a [`LoopAddr`].
pub const LOOP_ADDR_LEN: usize = PUBLIC_KEY_LEN + 2;

/// Encoded size of a [`LoopMeta`].
pub const LOOP_META_LEN: usize = 2 * LOOP_ADDR_LEN;

/// Largest data chunk a single Data frame can carry.
pub const MAX_DATA_LEN: usize = MAX_FRAME_PAYLOAD - LOOP_META_LEN;

/// One endpoint of a loop.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LoopAddr {
    pub pk: PubKey,
    pub port: u16,
}

impl LoopAddr {
    pub fn new(pk: PubKey, port: u16) -> Self {
        Self { pk, port }
    }

    /// Encode to bytes.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_slice(self.pk.as_bytes());
        buf.put_u16(self.port);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(LOOP_ADDR_LEN);
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode from bytes. Trailing bytes are rejected.
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() != LOOP_ADDR_LEN {
            return Err(FrameError::InvalidLength {
                what: "loop address",
                expected: LOOP_ADDR_LEN,
                actual: buf.len(),
            });
        }
        Ok(Self::decode_prefix(buf))
    }

    /// Caller guarantees `buf.len() >= LOOP_ADDR_LEN`.
    fn decode_prefix(buf: &[u8]) -> Self {
        let mut pk = [0u8; PUBLIC_KEY_LEN];
        pk.copy_from_slice(&buf[..PUBLIC_KEY_LEN]);
        let port = u16::from_be_bytes([buf[PUBLIC_KEY_LEN], buf[PUBLIC_KEY_LEN + 1]]);
        Self {
            pk: PubKey::from_bytes(pk),
            port,
        }
    }
}

impl fmt::Display for LoopAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.pk, self.port)
    }
}

impl fmt::Debug for LoopAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LoopAddr({self})")
    }
}

impl FromStr for LoopAddr {
    type Err = FrameError;

    /// Parse `<hex public key>:<port>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (pk, port) = s
            .rsplit_once(':')
            .ok_or_else(|| FrameError::Malformed(format!("missing port in address '{s}'")))?;
        let pk: PubKey = pk
            .parse()
            .map_err(|e| FrameError::Malformed(format!("invalid public key '{pk}': {e}")))?;
        let port = port
            .parse()
            .map_err(|e| FrameError::Malformed(format!("invalid port '{port}': {e}")))?;
        Ok(Self { pk, port })
    }
}

/// Both endpoints of a loop; the registry key.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LoopMeta {
    pub local: LoopAddr,
    pub remote: LoopAddr,
}

impl LoopMeta {
    pub fn new(local: LoopAddr, remote: LoopAddr) -> Self {
        Self { local, remote }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        self.local.encode(buf);
        self.remote.encode(buf);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(LOOP_META_LEN);
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode from bytes. Trailing bytes are rejected.
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() != LOOP_META_LEN {
            return Err(FrameError::InvalidLength {
                what: "loop meta",
                expected: LOOP_META_LEN,
                actual: buf.len(),
            });
        }
        Ok(Self::decode_prefix(buf))
    }

    fn decode_prefix(buf: &[u8]) -> Self {
        Self {
            local: LoopAddr::decode_prefix(&buf[..LOOP_ADDR_LEN]),
            remote: LoopAddr::decode_prefix(&buf[LOOP_ADDR_LEN..LOOP_META_LEN]),
        }
    }

    /// The same loop seen from the other end.
    pub fn swapped(&self) -> Self {
        Self {
            local: self.remote,
            remote: self.local,
        }
    }
}

impl fmt::Display for LoopMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <-> {}", self.local, self.remote)
    }
}

impl fmt::Debug for LoopMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LoopMeta({self})")
    }
}

/// Payload of a Data frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub meta: LoopMeta,
    pub data: Bytes,
}

impl DataFrame {
    pub fn new(meta: LoopMeta, data: impl Into<Bytes>) -> Self {
        Self {
            meta,
            data: data.into(),
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        self.meta.encode(buf);
        buf.put_slice(&self.data);
    }

    pub fn encoded_len(&self) -> usize {
        LOOP_META_LEN + self.data.len()
    }

    /// Decode without copying the data section.
    pub fn decode(buf: Bytes) -> Result<Self, FrameError> {
        if buf.len() < LOOP_META_LEN {
            return Err(FrameError::TooShort(buf.len(), LOOP_META_LEN));
        }
        let meta = LoopMeta::decode_prefix(&buf);
        Ok(Self {
            meta,
            data: buf.slice(LOOP_META_LEN..),
        })
    }
}
