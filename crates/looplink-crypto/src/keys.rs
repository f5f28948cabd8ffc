//! secp256k1 static keys.
//!
//! Public keys are carried in x-only form: the 32-byte big-endian
//! x-coordinate of the curve point. The y-coordinate is never needed because
//! the Diffie-Hellman output only depends on the x-coordinate of the shared
//! point, which is identical for `P` and `-P`.
//!
//! # Example
//!
//! ```
//! use looplink_crypto::keys::StaticKeypair;
//!
//! let keypair = StaticKeypair::generate();
//! let pk = keypair.public_key();
//!
//! // Keys travel as lowercase hex.
//! let parsed: looplink_crypto::keys::PubKey = pk.to_string().parse().unwrap();
//! assert_eq!(parsed, pk);
//! ```

use std::fmt;
use std::str::FromStr;

use k256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of an x-only public key.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Length of a secret scalar.
pub const SECRET_KEY_LEN: usize = 32;

/// Key parsing and validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum KeyError {
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("public key is not a valid secp256k1 x-coordinate")]
    InvalidPublicKey,

    #[error("secret key is not a valid secp256k1 scalar")]
    InvalidSecretKey,

    #[error("public key does not match secret key")]
    Mismatch,

    #[error("invalid hex encoding: {0}")]
    Hex(#[from] hex::FromHexError),
}

/// x-only secp256k1 public key.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PubKey([u8; PUBLIC_KEY_LEN]);

impl PubKey {
    /// The all-zero key, used where no key is known.
    pub const NULL: PubKey = PubKey([0u8; PUBLIC_KEY_LEN]);

    /// Wrap raw bytes without checking that they lie on the curve.
    ///
    /// Used by wire decoders, which carry keys opaquely.
    pub const fn from_bytes(bytes: [u8; PUBLIC_KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse and validate a public key.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
        let bytes: [u8; PUBLIC_KEY_LEN] =
            bytes.try_into().map_err(|_| KeyError::InvalidLength {
                expected: PUBLIC_KEY_LEN,
                actual: bytes.len(),
            })?;
        let pk = Self(bytes);
        pk.validate()?;
        Ok(pk)
    }

    /// Check that the key is the x-coordinate of a curve point.
    pub fn validate(&self) -> Result<(), KeyError> {
        self.to_point().map(|_| ())
    }

    /// Whether this is the all-zero key.
    pub fn is_null(&self) -> bool {
        self.0 == [0u8; PUBLIC_KEY_LEN]
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.0
    }

    /// Lift the x-coordinate to the curve point with even y.
    pub(crate) fn to_point(self) -> Result<k256::PublicKey, KeyError> {
        let mut sec1 = [0u8; PUBLIC_KEY_LEN + 1];
        sec1[0] = 0x02;
        sec1[1..].copy_from_slice(&self.0);
        k256::PublicKey::from_sec1_bytes(&sec1).map_err(|_| KeyError::InvalidPublicKey)
    }

    pub(crate) fn from_point(point: &k256::PublicKey) -> Self {
        let encoded = point.to_encoded_point(true);
        let mut bytes = [0u8; PUBLIC_KEY_LEN];
        // Compressed SEC1: tag byte followed by the x-coordinate.
        bytes.copy_from_slice(&encoded.as_bytes()[1..]);
        Self(bytes)
    }
}

impl fmt::Display for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PubKey({})", hex::encode(self.0))
    }
}

impl FromStr for PubKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim())?;
        Self::from_slice(&bytes)
    }
}

impl Serialize for PubKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PubKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s.is_empty() {
            return Ok(PubKey::NULL);
        }
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// secp256k1 secret scalar. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecKey([u8; SECRET_KEY_LEN]);

impl SecKey {
    /// Parse and validate a secret key.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
        if bytes.len() != SECRET_KEY_LEN {
            return Err(KeyError::InvalidLength {
                expected: SECRET_KEY_LEN,
                actual: bytes.len(),
            });
        }
        k256::SecretKey::from_slice(bytes).map_err(|_| KeyError::InvalidSecretKey)?;

        let mut out = [0u8; SECRET_KEY_LEN];
        out.copy_from_slice(bytes);
        Ok(Self(out))
    }

    /// Get the secret bytes.
    ///
    /// # Security
    /// Handle with care! These bytes recreate the identity.
    pub fn as_bytes(&self) -> &[u8; SECRET_KEY_LEN] {
        &self.0
    }

    /// Derive the x-only public key.
    pub fn public_key(&self) -> Result<PubKey, KeyError> {
        let secret = self.to_scalar()?;
        Ok(PubKey::from_point(&secret.public_key()))
    }

    pub(crate) fn to_scalar(&self) -> Result<k256::SecretKey, KeyError> {
        k256::SecretKey::from_slice(&self.0).map_err(|_| KeyError::InvalidSecretKey)
    }
}

impl fmt::Debug for SecKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecKey(..)")
    }
}

impl FromStr for SecKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = hex::decode(s.trim())?;
        let key = Self::from_slice(&bytes);
        bytes.zeroize();
        key
    }
}

/// Static identity keypair used by a secure channel.
#[derive(Clone, Debug)]
pub struct StaticKeypair {
    public: PubKey,
    secret: SecKey,
}

impl StaticKeypair {
    /// Generate a new random keypair using the OS CSPRNG.
    pub fn generate() -> Self {
        let secret = k256::SecretKey::random(&mut OsRng);
        let public = PubKey::from_point(&secret.public_key());
        let mut bytes = [0u8; SECRET_KEY_LEN];
        bytes.copy_from_slice(&secret.to_bytes());
        Self {
            public,
            secret: SecKey(bytes),
        }
    }

    /// Rebuild a keypair from its secret half.
    pub fn from_secret(secret: SecKey) -> Result<Self, KeyError> {
        let public = secret.public_key()?;
        Ok(Self { public, secret })
    }

    /// Pair a public and a secret key, checking that they belong together.
    pub fn new(public: PubKey, secret: SecKey) -> Result<Self, KeyError> {
        if secret.public_key()? != public {
            return Err(KeyError::Mismatch);
        }
        Ok(Self { public, secret })
    }

    pub fn public_key(&self) -> PubKey {
        self.public
    }

    pub fn secret_key(&self) -> &SecKey {
        &self.secret
    }
}
