//! secp256k1 Diffie-Hellman for the Noise handshake.
//!
//! `snow` only ships Curve25519/448 DH functions, so the curve is plugged in
//! through a custom [`CryptoResolver`]. Hash, cipher and RNG still come from
//! snow's default resolver. The protocol name hashed into the handshake is
//! `Noise_<pattern>_secp256k1_ChaChaPoly_SHA256`.

use snow::params::{CipherChoice, DHChoice, HashChoice, NoiseParams};
use snow::resolvers::{CryptoResolver, DefaultResolver};
use snow::types::{Cipher, Dh, Hash, Random};
use zeroize::Zeroize;

use crate::keys::{PubKey, PUBLIC_KEY_LEN, SECRET_KEY_LEN};
use crate::noise::HandshakePattern;

/// Name of the DH function in the Noise protocol name.
pub const DH_NAME: &str = "secp256k1";

/// secp256k1 DH with x-only public keys.
#[derive(Default)]
pub struct Secp256k1 {
    secret: Option<k256::SecretKey>,
    privkey: [u8; SECRET_KEY_LEN],
    pubkey: [u8; PUBLIC_KEY_LEN],
}

impl Secp256k1 {
    fn load(&mut self, secret: k256::SecretKey) {
        self.privkey.copy_from_slice(&secret.to_bytes());
        self.pubkey = *PubKey::from_point(&secret.public_key()).as_bytes();
        self.secret = Some(secret);
    }

    fn clear(&mut self) {
        self.secret = None;
        self.privkey.zeroize();
        self.pubkey = [0u8; PUBLIC_KEY_LEN];
    }
}

impl Drop for Secp256k1 {
    fn drop(&mut self) {
        self.privkey.zeroize();
    }
}

impl Dh for Secp256k1 {
    fn name(&self) -> &'static str {
        DH_NAME
    }

    fn pub_len(&self) -> usize {
        PUBLIC_KEY_LEN
    }

    fn priv_len(&self) -> usize {
        SECRET_KEY_LEN
    }

    fn set(&mut self, privkey: &[u8]) {
        // Keys are validated before they reach the handshake builder; an
        // invalid one leaves the DH unset and fails the first `dh` call.
        match k256::SecretKey::from_slice(privkey) {
            Ok(secret) => self.load(secret),
            Err(_) => self.clear(),
        }
    }

    fn generate(&mut self, rng: &mut dyn Random) {
        let mut buf = [0u8; SECRET_KEY_LEN];
        loop {
            rng.fill_bytes(&mut buf);
            if let Ok(secret) = k256::SecretKey::from_slice(&buf) {
                buf.zeroize();
                self.load(secret);
                return;
            }
        }
    }

    fn pubkey(&self) -> &[u8] {
        &self.pubkey
    }

    fn privkey(&self) -> &[u8] {
        &self.privkey
    }

    fn dh(&self, pubkey: &[u8], out: &mut [u8]) -> Result<(), snow::Error> {
        let secret = self.secret.as_ref().ok_or(snow::Error::Dh)?;
        // snow hands over its fixed-size key buffer; the key is the prefix.
        let pubkey = pubkey.get(..PUBLIC_KEY_LEN).ok_or(snow::Error::Dh)?;
        let remote = PubKey::from_slice(pubkey)
            .and_then(|pk| pk.to_point())
            .map_err(|_| snow::Error::Dh)?;

        let shared = k256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), remote.as_affine());
        let x = shared.raw_secret_bytes();
        if out.len() < x.len() {
            return Err(snow::Error::Dh);
        }
        out[..x.len()].copy_from_slice(x);
        Ok(())
    }
}

/// Resolver that binds every DH slot to [`Secp256k1`].
pub struct Secp256k1Resolver {
    fallback: DefaultResolver,
}

impl Default for Secp256k1Resolver {
    fn default() -> Self {
        Self {
            fallback: DefaultResolver,
        }
    }
}

impl CryptoResolver for Secp256k1Resolver {
    fn resolve_rng(&self) -> Option<Box<dyn Random>> {
        self.fallback.resolve_rng()
    }

    fn resolve_dh(&self, _choice: &DHChoice) -> Option<Box<dyn Dh>> {
        Some(Box::new(Secp256k1::default()))
    }

    fn resolve_hash(&self, choice: &HashChoice) -> Option<Box<dyn Hash>> {
        self.fallback.resolve_hash(choice)
    }

    fn resolve_cipher(&self, choice: &CipherChoice) -> Option<Box<dyn Cipher>> {
        self.fallback.resolve_cipher(choice)
    }
}

/// Build the Noise parameters for `pattern` over secp256k1.
pub(crate) fn noise_params(pattern: HandshakePattern) -> Result<NoiseParams, snow::Error> {
    // The parser only knows the built-in DH names; parse with a placeholder
    // and rename so the handshake hash commits to the real curve.
    let placeholder = format!("Noise_{}_25519_ChaChaPoly_SHA256", pattern.name());
    let mut params: NoiseParams = placeholder.parse()?;
    params.name = format!("Noise_{}_{}_ChaChaPoly_SHA256", pattern.name(), DH_NAME);
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::StaticKeypair;

    fn dh_from(keypair: &StaticKeypair) -> Secp256k1 {
        let mut dh = Secp256k1::default();
        dh.set(keypair.secret_key().as_bytes());
        dh
    }

    #[test]
    fn test_shared_secret_agrees() {
        let a = StaticKeypair::generate();
        let b = StaticKeypair::generate();

        let mut ab = [0u8; 32];
        let mut ba = [0u8; 32];
        dh_from(&a).dh(b.public_key().as_bytes(), &mut ab).unwrap();
        dh_from(&b).dh(a.public_key().as_bytes(), &mut ba).unwrap();

        assert_eq!(ab, ba);
        assert_ne!(ab, [0u8; 32]);
    }

    #[test]
    fn test_dh_accepts_padded_key_buffer() {
        let a = StaticKeypair::generate();
        let b = StaticKeypair::generate();

        // The handshake passes remote keys in a zero-padded 56-byte buffer.
        let mut padded = [0u8; 56];
        padded[..PUBLIC_KEY_LEN].copy_from_slice(b.public_key().as_bytes());
        let mut out = [0u8; 56];
        dh_from(&a).dh(&padded, &mut out).unwrap();

        let mut expected = [0u8; 32];
        dh_from(&a).dh(b.public_key().as_bytes(), &mut expected).unwrap();
        assert_eq!(&out[..32], &expected);
    }

    #[test]
    fn test_dh_rejects_short_key() {
        let dh = dh_from(&StaticKeypair::generate());
        let mut out = [0u8; 32];
        assert!(dh.dh(&[0x02; 16], &mut out).is_err());
    }

    #[test]
    fn test_set_derives_public_key() {
        let keypair = StaticKeypair::generate();
        let dh = dh_from(&keypair);
        assert_eq!(dh.pubkey(), keypair.public_key().as_bytes());
        assert_eq!(dh.privkey(), keypair.secret_key().as_bytes());
    }

    #[test]
    fn test_dh_rejects_off_curve_key() {
        let dh = dh_from(&StaticKeypair::generate());
        let mut out = [0u8; 32];
        assert!(dh.dh(&[0xff; 32], &mut out).is_err());
    }

    #[test]
    fn test_unset_dh_fails() {
        let dh = Secp256k1::default();
        let peer = StaticKeypair::generate();
        let mut out = [0u8; 32];
        assert!(dh.dh(peer.public_key().as_bytes(), &mut out).is_err());
    }

    #[test]
    fn test_protocol_name() {
        let params = noise_params(HandshakePattern::XK).unwrap();
        assert_eq!(params.name, "Noise_XK_secp256k1_ChaChaPoly_SHA256");
    }
}
