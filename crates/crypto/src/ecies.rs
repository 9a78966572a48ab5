//! Sealed boxes addressed to an x25519 public key.
//!
//! Wire layout: `ephemeral_public (32) || nonce (12) || aes-256-gcm ciphertext+tag`.
//! The content key is HKDF-SHA256 over the ephemeral/recipient shared secret,
//! salted with both public keys.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use hkdf::Hkdf;
use peercoord_p2p::{Cipher, CipherError};
use rand_core::{OsRng, RngCore};
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

use crate::{CryptoError, Result};

pub const EPHEMERAL_KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

const KDF_INFO: &[u8] = b"peercoord/ecies/v1/aes-256-gcm";

/// ECIES over x25519. Keys cross the [`Cipher`] boundary hex encoded.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ecies;

impl Ecies {
    pub fn new() -> Self {
        Self
    }

    /// Encrypt `plaintext` so only the holder of `recipient`'s secret can read it.
    pub fn seal(&self, recipient: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>> {
        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral);
        let shared = ephemeral.diffie_hellman(recipient);
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidKey(
                "recipient key is a low-order point".into(),
            ));
        }

        let key = derive_key(shared.as_bytes(), &ephemeral_public, recipient)?;
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        let mut sealed = Vec::with_capacity(EPHEMERAL_KEY_LEN + NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(ephemeral_public.as_bytes());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Reverse [`Ecies::seal`] with the recipient's secret.
    pub fn open(&self, secret: &StaticSecret, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < EPHEMERAL_KEY_LEN + NONCE_LEN + TAG_LEN {
            return Err(CryptoError::InvalidCiphertext(format!(
                "{} bytes is shorter than the sealed box header",
                sealed.len()
            )));
        }

        let (ephemeral_bytes, rest) = sealed.split_at(EPHEMERAL_KEY_LEN);
        let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

        let mut ephemeral = [0u8; EPHEMERAL_KEY_LEN];
        ephemeral.copy_from_slice(ephemeral_bytes);
        let ephemeral_public = PublicKey::from(ephemeral);
        let recipient = PublicKey::from(secret);

        let shared = secret.diffie_hellman(&ephemeral_public);
        let key = derive_key(shared.as_bytes(), &ephemeral_public, &recipient)?;

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed("authentication tag mismatch".into()))
    }
}

impl Cipher for Ecies {
    fn encrypt(&self, public_key: &str, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let recipient = PublicKey::from(decode_key(public_key)?);
        Ok(self.seal(&recipient, plaintext)?)
    }

    fn decrypt(&self, private_key: &str, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let secret = StaticSecret::from(decode_key(private_key)?);
        Ok(self.open(&secret, ciphertext)?)
    }
}

fn derive_key(shared: &[u8], ephemeral: &PublicKey, recipient: &PublicKey) -> Result<[u8; 32]> {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(ephemeral.as_bytes());
    salt[32..].copy_from_slice(recipient.as_bytes());

    let hkdf = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut key = [0u8; 32];
    hkdf.expand(KDF_INFO, &mut key)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(key)
}

/// Parse a 32-byte key from hex.
pub(crate) fn decode_key(encoded: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(encoded.trim())
        .map_err(|e| CryptoError::InvalidKey(format!("not hex: {e}")))?;
    bytes.try_into().map_err(|bytes: Vec<u8>| {
        CryptoError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len()))
    })
}
