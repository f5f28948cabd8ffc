//! One direction of post-handshake transport encryption.
//!
//! Follows the Noise `CipherState` construction for ChaChaPoly:
//! the 96-bit nonce is 32 zero bits followed by the little-endian 64-bit
//! counter, and `Rekey()` replaces the key with the first 32 bytes of
//! `ENCRYPT(k, 2^64-1, "", zeros)`.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use zeroize::Zeroize;

use crate::error::ChannelError;

/// ChaCha20-Poly1305 authentication tag length.
pub const TAG_LEN: usize = 16;

/// Nonce reserved for rekeying; never used for packets.
const REKEY_NONCE: u64 = u64::MAX;

#[derive(Clone)]
pub struct CipherState {
    cipher: ChaCha20Poly1305,
    nonce: u64,
}

impl CipherState {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.into()),
            nonce: 0,
        }
    }

    /// Nonce the next packet will use.
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// Encrypt with empty associated data.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, ChannelError> {
        let nonce = self.next_nonce()?;
        self.cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| ChannelError::Crypto(e.to_string()))
    }

    /// Decrypt with empty associated data.
    ///
    /// The nonce advances even when authentication fails, so the receiver
    /// stays aligned with a sender that counted the rejected packet.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, ChannelError> {
        let nonce = self.next_nonce()?;
        if ciphertext.len() < TAG_LEN {
            return Err(ChannelError::Crypto("ciphertext too short".into()));
        }
        self.cipher
            .decrypt(&nonce, ciphertext)
            .map_err(|_| ChannelError::Crypto("authentication failed".into()))
    }

    /// Derive a fresh key from the current one. The nonce is kept.
    pub fn rekey(&mut self) -> Result<(), ChannelError> {
        let zeros = [0u8; 32];
        let mut out = self
            .cipher
            .encrypt(&counter_to_nonce(REKEY_NONCE), &zeros[..])
            .map_err(|e| ChannelError::Crypto(e.to_string()))?;

        let mut key = [0u8; 32];
        key.copy_from_slice(&out[..32]);
        self.cipher = ChaCha20Poly1305::new((&key).into());

        key.zeroize();
        out.zeroize();
        Ok(())
    }

    fn next_nonce(&mut self) -> Result<Nonce, ChannelError> {
        if self.nonce == REKEY_NONCE {
            return Err(ChannelError::Crypto("nonce space exhausted".into()));
        }
        let nonce = counter_to_nonce(self.nonce);
        self.nonce += 1;
        Ok(nonce)
    }
}

/// Convert a packet counter to a 12-byte ChaCha20-Poly1305 nonce.
fn counter_to_nonce(counter: u64) -> Nonce {
    let mut nonce_bytes = [0u8; 12];
    nonce_bytes[4..12].copy_from_slice(&counter.to_le_bytes());
    Nonce::from(nonce_bytes)
}
