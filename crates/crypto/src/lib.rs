//! Key material and end-to-end encryption for peercoord direct messages.
//!
//! - [`Keyring`]: the node's long-lived x25519 key pair, persisted as a hex key file.
//! - [`Ecies`]: x25519 + HKDF-SHA256 + AES-256-GCM sealed boxes addressed to a public key.
//!
//! Both implement the capability traits from `peercoord-p2p` so the coordination
//! engine can use them directly.

pub mod ecies;
pub mod keyring;

pub use ecies::{Ecies, EPHEMERAL_KEY_LEN, NONCE_LEN};
pub use keyring::Keyring;

use peercoord_p2p::CipherError;

/// Crypto errors
#[derive(thiserror::Error, Debug)]
pub enum CryptoError {
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid ciphertext: {0}")]
    InvalidCiphertext(String),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Key file error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CryptoError> for CipherError {
    fn from(err: CryptoError) -> Self {
        CipherError(err.to_string())
    }
}

pub type Result<T, E = CryptoError> = std::result::Result<T, E>;
