//! Secure channel errors.

use thiserror::Error;

/// Errors raised by [`SecureChannel`](crate::noise::SecureChannel) and
/// [`SecureLink`](crate::link::SecureLink).
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Malformed keys or unmet pattern prerequisites. Fails construction.
    #[error("invalid channel configuration: {0}")]
    Config(String),

    /// Malformed, unauthenticated or out-of-order handshake message.
    /// Fatal to the channel.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Packet authentication failed. The channel stays usable.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Operation not valid in the current channel state.
    #[error("invalid channel state: {0}")]
    State(&'static str),

    #[error("record too large: {0} bytes")]
    RecordTooLarge(usize),

    #[error("link I/O error: {0}")]
    Io(#[from] std::io::Error),
}
