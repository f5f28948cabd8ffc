//! Noise handshake and transport encryption.
//!
//! Patterns: `Noise_KK_secp256k1_ChaChaPoly_SHA256` and
//! `Noise_XK_secp256k1_ChaChaPoly_SHA256`.
//!
//! # Handshake Flow
//!
//! ```text
//! KK (both static keys known up front)
//!
//! Initiator                               Responder
//!     |  -> e, es, ss                         |
//!     |-------------------------------------->|
//!     |  <- e, ee, se                         |
//!     |<--------------------------------------|
//!
//! XK (initiator knows the responder's static key)
//!
//! Initiator                               Responder
//!     |  -> e, es                             |
//!     |-------------------------------------->|
//!     |  <- e, ee                             |
//!     |<--------------------------------------|
//!     |  -> s, se                             |  initiator static revealed
//!     |-------------------------------------->|
//! ```
//!
//! After the final message each side holds two cipher states. The
//! initiator sends with the first split key and receives with the second;
//! the responder does the opposite.
//!
//! # Rekeying
//!
//! Every direction counts its packets. The packet that brings the counter
//! to [`PACKETS_TILL_REKEY`] first rekeys that direction's cipher state and
//! resets the counter, then is encrypted under the new key. Both ends count
//! identically, so they rotate on the same packet ordinal.

use std::sync::{Mutex, MutexGuard, PoisonError};

use snow::{Builder, HandshakeState};
use tracing::{debug, trace};
use zeroize::Zeroize;

use crate::cipher_state::CipherState;
use crate::error::ChannelError;
use crate::keys::{PubKey, StaticKeypair};
use crate::secp256k1::{noise_params, Secp256k1Resolver};

/// Number of packets after which a direction is rekeyed.
pub const PACKETS_TILL_REKEY: u32 = 10;

/// Maximum message size for Noise handshake
const MAX_HANDSHAKE_MSG_SIZE: usize = 65535;

/// Supported handshake patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePattern {
    /// Both static keys known in advance.
    KK,
    /// Responder's static key known in advance; initiator's revealed.
    XK,
}

impl HandshakePattern {
    pub fn name(&self) -> &'static str {
        match self {
            Self::KK => "KK",
            Self::XK => "XK",
        }
    }

    /// Total number of handshake messages.
    pub fn message_count(&self) -> usize {
        match self {
            Self::KK => 2,
            Self::XK => 3,
        }
    }
}

/// Parameters for building a [`SecureChannel`].
#[derive(Clone, Debug)]
pub struct HandshakeConfig {
    /// Local static keypair.
    pub local: StaticKeypair,
    /// Remote static public key, if known. A null key counts as unknown.
    pub remote: Option<PubKey>,
    /// Whether the local side initiates the handshake.
    pub initiator: bool,
}

enum HandshakeStage {
    Handshake(Box<HandshakeState>),
    Transport,
    Aborted,
}

/// Per-direction transport state: cipher plus packets since last rekey.
#[derive(Clone)]
struct Direction {
    cipher: CipherState,
    packets: u32,
}

impl Direction {
    fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: CipherState::new(key),
            packets: 0,
        }
    }

    fn advance(&mut self) -> Result<(), ChannelError> {
        self.packets += 1;
        if self.packets == PACKETS_TILL_REKEY {
            self.cipher.rekey()?;
            self.packets = 0;
            trace!("rekeyed cipher state");
        }
        Ok(())
    }

    fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, ChannelError> {
        self.advance()?;
        self.cipher.encrypt(plaintext)
    }

    fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, ChannelError> {
        self.advance()?;
        self.cipher.decrypt(ciphertext)
    }
}

/// Noise secure channel: handshake, then rekeying transport encryption.
///
/// Handshake methods take `&mut self`; a channel is driven by one task
/// until the handshake completes. Afterwards [`encrypt`](Self::encrypt) and
/// [`decrypt`](Self::decrypt) take `&self` and serialize each direction on
/// its own mutex, so a shared channel may be used from many threads.
pub struct SecureChannel {
    local: StaticKeypair,
    remote: Option<PubKey>,
    pattern: HandshakePattern,
    initiator: bool,
    stage: HandshakeStage,
    messages: usize,
    send: Mutex<Option<Direction>>,
    recv: Mutex<Option<Direction>>,
}

impl SecureChannel {
    /// Create a channel for `pattern`. Performs no I/O.
    pub fn new(pattern: HandshakePattern, config: HandshakeConfig) -> Result<Self, ChannelError> {
        let HandshakeConfig {
            local,
            remote,
            initiator,
        } = config;

        let remote = remote.filter(|pk| !pk.is_null());
        if let Some(pk) = &remote {
            pk.validate()
                .map_err(|e| ChannelError::Config(format!("remote public key: {e}")))?;
        }
        StaticKeypair::new(local.public_key(), local.secret_key().clone())
            .map_err(|e| ChannelError::Config(format!("local keypair: {e}")))?;

        let params =
            noise_params(pattern).map_err(|e| ChannelError::Config(format!("pattern: {e}")))?;
        let mut builder = Builder::with_resolver(params, Box::new(Secp256k1Resolver::default()))
            .local_private_key(local.secret_key().as_bytes());
        if let Some(pk) = &remote {
            builder = builder.remote_public_key(pk.as_bytes());
        }

        let state = if initiator {
            builder.build_initiator()
        } else {
            builder.build_responder()
        }
        .map_err(|e| ChannelError::Config(format!("failed to build {} handshake: {e}", pattern.name())))?;

        debug!(
            pattern = pattern.name(),
            initiator,
            local = %local.public_key(),
            "secure channel created"
        );

        Ok(Self {
            local,
            remote,
            pattern,
            initiator,
            stage: HandshakeStage::Handshake(Box::new(state)),
            messages: 0,
            send: Mutex::new(None),
            recv: Mutex::new(None),
        })
    }

    /// KK pattern over secp256k1.
    pub fn kk(config: HandshakeConfig) -> Result<Self, ChannelError> {
        Self::new(HandshakePattern::KK, config)
    }

    /// XK pattern over secp256k1.
    pub fn xk(config: HandshakeConfig) -> Result<Self, ChannelError> {
        Self::new(HandshakePattern::XK, config)
    }

    pub fn pattern(&self) -> HandshakePattern {
        self.pattern
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    /// Produce the next handshake message for the peer.
    ///
    /// No payload is attached. The final message completes the handshake
    /// and derives the transport cipher states.
    pub fn produce_handshake_message(&mut self) -> Result<Vec<u8>, ChannelError> {
        let state = self.handshake_state()?;

        let mut buf = vec![0u8; MAX_HANDSHAKE_MSG_SIZE];
        let written = state.write_message(&[], &mut buf);
        let len = match written {
            Ok(len) => len,
            Err(e) => return Err(self.abort(e)),
        };
        buf.truncate(len);

        self.advance_handshake()?;
        Ok(buf)
    }

    /// Consume a handshake message from the peer.
    ///
    /// The final message completes the handshake and derives the transport
    /// cipher states.
    pub fn consume_handshake_message(&mut self, message: &[u8]) -> Result<(), ChannelError> {
        let state = self.handshake_state()?;

        let mut payload = vec![0u8; MAX_HANDSHAKE_MSG_SIZE];
        if let Err(e) = state.read_message(message, &mut payload) {
            return Err(self.abort(e));
        }

        self.advance_handshake()
    }

    /// Whether every message of the pattern has been exchanged.
    pub fn handshake_finished(&self) -> bool {
        matches!(self.stage, HandshakeStage::Transport)
            && self.messages == self.pattern.message_count()
    }

    /// Whether the next handshake step is ours to produce.
    pub fn is_my_turn(&self) -> bool {
        match &self.stage {
            HandshakeStage::Handshake(state) => state.is_my_turn(),
            _ => false,
        }
    }

    /// Local static public key.
    pub fn local_static(&self) -> PubKey {
        self.local.public_key()
    }

    /// Remote static public key.
    ///
    /// Known from construction for KK and for the XK initiator; the XK
    /// responder learns it from the final handshake message.
    pub fn remote_static(&self) -> Result<PubKey, ChannelError> {
        self.remote
            .ok_or(ChannelError::State("remote static key not yet known"))
    }

    /// Encrypt a packet. Serialized with other senders on this channel.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, ChannelError> {
        let mut send = lock(&self.send);
        let direction = send
            .as_mut()
            .ok_or(ChannelError::State("handshake not complete"))?;
        direction.seal(plaintext)
    }

    /// Encrypt without taking the send lock.
    ///
    /// For callers that already own the channel exclusively.
    pub fn encrypt_unlocked(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, ChannelError> {
        let direction = self
            .send
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
            .ok_or(ChannelError::State("handshake not complete"))?;
        direction.seal(plaintext)
    }

    /// Decrypt a packet. Serialized with other receivers on this channel.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, ChannelError> {
        let mut recv = lock(&self.recv);
        let direction = recv
            .as_mut()
            .ok_or(ChannelError::State("handshake not complete"))?;
        direction.open(ciphertext)
    }

    /// Decrypt without taking the receive lock.
    pub fn decrypt_unlocked(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, ChannelError> {
        let direction = self
            .recv
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
            .ok_or(ChannelError::State("handshake not complete"))?;
        direction.open(ciphertext)
    }

    fn handshake_state(&mut self) -> Result<&mut HandshakeState, ChannelError> {
        match &mut self.stage {
            HandshakeStage::Handshake(state) => Ok(state),
            HandshakeStage::Transport => {
                Err(ChannelError::Handshake("handshake already complete".into()))
            }
            HandshakeStage::Aborted => Err(ChannelError::Handshake("handshake aborted".into())),
        }
    }

    /// A failed handshake step poisons the channel.
    fn abort(&mut self, err: snow::Error) -> ChannelError {
        debug!(pattern = self.pattern.name(), error = %err, "handshake aborted");
        self.stage = HandshakeStage::Aborted;
        ChannelError::Handshake(err.to_string())
    }

    fn advance_handshake(&mut self) -> Result<(), ChannelError> {
        self.messages += 1;

        let HandshakeStage::Handshake(state) = &mut self.stage else {
            return Err(ChannelError::State("no handshake in progress"));
        };

        if self.remote.is_none() {
            if let Some(rs) = state.get_remote_static() {
                let pk = PubKey::from_slice(rs).map_err(|e| {
                    ChannelError::Handshake(format!("peer sent invalid static key: {e}"))
                })?;
                self.remote = Some(pk);
            }
        }

        if !state.is_handshake_finished() {
            return Ok(());
        }

        let (mut k1, mut k2) = state.dangerously_get_raw_split();
        let (send_key, recv_key) = if self.initiator {
            (&k1, &k2)
        } else {
            (&k2, &k1)
        };
        *self.send.get_mut().unwrap_or_else(PoisonError::into_inner) =
            Some(Direction::new(send_key));
        *self.recv.get_mut().unwrap_or_else(PoisonError::into_inner) =
            Some(Direction::new(recv_key));
        k1.zeroize();
        k2.zeroize();

        self.stage = HandshakeStage::Transport;
        debug!(
            pattern = self.pattern.name(),
            initiator = self.initiator,
            "handshake complete"
        );
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
