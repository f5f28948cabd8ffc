//! Whole-link encryption over a byte stream.
//!
//! # Wire Format
//!
//! Handshake messages and transport records share one framing:
//!
//! ```text
//! [2 bytes: length (big-endian)] [length bytes: body]
//! ```
//!
//! During the handshake the body is a Noise handshake message; afterwards
//! it is a ciphertext (plaintext + 16-byte auth tag).

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::cipher_state::TAG_LEN;
use crate::error::ChannelError;
use crate::noise::SecureChannel;

/// Largest record body the framing can carry.
pub const MAX_RECORD_LEN: usize = u16::MAX as usize;

/// Largest plaintext accepted by [`SecureLink::send`].
pub const MAX_PLAINTEXT_LEN: usize = MAX_RECORD_LEN - TAG_LEN;

/// A byte stream protected by an established [`SecureChannel`].
pub struct SecureLink<S> {
    io: S,
    channel: SecureChannel,
}

impl<S> SecureLink<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Run the handshake over `io` and return the protected link.
    ///
    /// Both peers call this with their own channel; message order follows
    /// from the pattern and each side's role.
    pub async fn establish(mut io: S, mut channel: SecureChannel) -> Result<Self, ChannelError> {
        while !channel.handshake_finished() {
            if channel.is_my_turn() {
                let msg = channel.produce_handshake_message()?;
                write_record(&mut io, &msg).await?;
            } else {
                let msg = read_record(&mut io).await?;
                channel.consume_handshake_message(&msg)?;
            }
        }

        debug!(
            pattern = channel.pattern().name(),
            initiator = channel.is_initiator(),
            "secure link established"
        );
        Ok(Self { io, channel })
    }

    /// Encrypt and send one record.
    pub async fn send(&mut self, plaintext: &[u8]) -> Result<(), ChannelError> {
        if plaintext.len() > MAX_PLAINTEXT_LEN {
            return Err(ChannelError::RecordTooLarge(plaintext.len()));
        }
        let ciphertext = self.channel.encrypt_unlocked(plaintext)?;
        write_record(&mut self.io, &ciphertext).await
    }

    /// Receive and decrypt one record.
    pub async fn recv(&mut self) -> Result<Vec<u8>, ChannelError> {
        let ciphertext = read_record(&mut self.io).await?;
        self.channel.decrypt_unlocked(&ciphertext)
    }

    pub fn channel(&self) -> &SecureChannel {
        &self.channel
    }

    pub fn into_parts(self) -> (S, SecureChannel) {
        (self.io, self.channel)
    }
}

async fn write_record<S>(io: &mut S, body: &[u8]) -> Result<(), ChannelError>
where
    S: AsyncWrite + Unpin,
{
    let len = u16::try_from(body.len()).map_err(|_| ChannelError::RecordTooLarge(body.len()))?;
    io.write_all(&len.to_be_bytes()).await?;
    io.write_all(body).await?;
    io.flush().await?;
    Ok(())
}

async fn read_record<S>(io: &mut S) -> Result<Vec<u8>, ChannelError>
where
    S: AsyncRead + Unpin,
{
    let mut len = [0u8; 2];
    io.read_exact(&mut len).await?;
    let mut body = vec![0u8; u16::from_be_bytes(len) as usize];
    io.read_exact(&mut body).await?;
    Ok(body)
}
