//! Cryptographic primitives for Looplink.
//!
//! This crate provides:
//! - secp256k1 static keys with x-only public keys
//! - A secp256k1 Diffie-Hellman adapter for the Noise framework
//! - `SecureChannel`: KK/XK handshakes with per-direction rekeying transport
//! - `SecureLink`: a whole byte stream protected by a `SecureChannel`
//!
//! # Design
//!
//! The handshake runs on `snow` with the suite
//! `Noise_{KK,XK}_secp256k1_ChaChaPoly_SHA256`. Once it completes the raw
//! split keys drive two independent ChaCha20-Poly1305 cipher states, one
//! per direction, each behind its own lock and each rekeyed every
//! [`noise::PACKETS_TILL_REKEY`] packets.

#![forbid(unsafe_code)]

pub mod cipher_state;
pub mod error;
pub mod keys;
pub mod link;
pub mod noise;
pub mod secp256k1;

pub use error::ChannelError;
pub use keys::{KeyError, PubKey, SecKey, StaticKeypair};
pub use link::SecureLink;
pub use noise::{HandshakeConfig, HandshakePattern, SecureChannel};
