use looplink_core::{FrameError, FrameKind, LoopMeta, TransportError};
use thiserror::Error;

use crate::registry::RegistryError;

/// Application session errors.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("received data for unknown loop: {0}")]
    UnknownLoop(LoopMeta),

    #[error("session closed")]
    Closed,

    /// The host broke the protocol; the session has been shut down.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("unexpected {0:?} frame")]
    UnexpectedFrame(FrameKind),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AppError {
    /// Whether the session can no longer be used.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Closed | Self::ProtocolViolation(_) | Self::Transport(TransportError::Closed)
        )
    }
}
