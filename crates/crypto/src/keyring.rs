use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use peercoord_p2p::{CipherError, IdentityProvider, KeyMaterial};
use rand_core::OsRng;
use tracing::info;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::ecies::decode_key;
use crate::Result;

const ADDRESS_PREFIX: &str = "peercoord:";

/// Long-lived x25519 key pair of the local node.
///
/// The public half is what peers encrypt direct messages to; it is announced
/// as `encryptPubKey`. The address is a short blake3 fingerprint of it.
pub struct Keyring {
    secret: StaticSecret,
    public: PublicKey,
    path: Option<PathBuf>,
}

impl Keyring {
    /// Fresh in-memory key pair.
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng), None)
    }

    pub fn from_secret_hex(encoded: &str) -> Result<Self> {
        Ok(Self::from_secret(StaticSecret::from(decode_key(encoded)?), None))
    }

    /// Load the key file at `path`, creating it with a new key when missing.
    pub fn load_or_generate(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            let encoded = fs::read_to_string(path)?;
            let secret = StaticSecret::from(decode_key(&encoded)?);
            let keyring = Self::from_secret(secret, Some(path.to_path_buf()));
            info!(
                "Loaded encryption key {} from {}",
                keyring.address(),
                path.display()
            );
            return Ok(keyring);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let secret = StaticSecret::random_from_rng(OsRng);
        fs::write(path, hex::encode(secret.to_bytes()))?;
        restrict_permissions(path)?;

        let keyring = Self::from_secret(secret, Some(path.to_path_buf()));
        info!(
            "Generated encryption key {} at {}",
            keyring.address(),
            path.display()
        );
        Ok(keyring)
    }

    fn from_secret(secret: StaticSecret, path: Option<PathBuf>) -> Self {
        let public = PublicKey::from(&secret);
        Self {
            secret,
            public,
            path,
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public.as_bytes())
    }

    pub fn address(&self) -> String {
        let digest = blake3::hash(self.public.as_bytes());
        format!("{ADDRESS_PREFIX}{}", hex::encode(&digest.as_bytes()[..20]))
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub(crate) fn secret(&self) -> &StaticSecret {
        &self.secret
    }
}

impl std::fmt::Debug for Keyring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keyring")
            .field("address", &self.address())
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl IdentityProvider for Keyring {
    async fn derive_address_and_key(&self) -> Result<KeyMaterial, CipherError> {
        Ok(KeyMaterial {
            address: self.address(),
            public_key: self.public_key_hex(),
        })
    }

    async fn private_key(&self) -> Result<String, CipherError> {
        Ok(hex::encode(self.secret().to_bytes()))
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CryptoError, Ecies};

    #[test]
    fn key_file_is_created_then_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("node.key");

        let first = Keyring::load_or_generate(&path).unwrap();
        assert!(path.exists());
        let second = Keyring::load_or_generate(&path).unwrap();

        assert_eq!(first.public_key_hex(), second.public_key_hex());
        assert_eq!(second.path(), Some(path.as_path()));
    }

    #[test]
    fn corrupt_key_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.key");
        fs::write(&path, "not a key").unwrap();

        assert!(matches!(
            Keyring::load_or_generate(&path),
            Err(CryptoError::InvalidKey(_))
        ));
    }

    #[test]
    fn address_is_a_stable_fingerprint() {
        let keyring = Keyring::from_secret_hex(&hex::encode([3u8; 32])).unwrap();
        let again = Keyring::from_secret_hex(&hex::encode([3u8; 32])).unwrap();
        assert_eq!(keyring.address(), again.address());
        assert!(keyring.address().starts_with(ADDRESS_PREFIX));
        assert_eq!(keyring.address().len(), ADDRESS_PREFIX.len() + 40);
        assert_ne!(keyring.address(), Keyring::generate().address());
    }

    #[test]
    fn secret_opens_boxes_sealed_to_public_key() {
        let keyring = Keyring::generate();
        let ecies = Ecies::new();
        let sealed = ecies.seal(keyring.public_key(), b"ping").unwrap();
        assert_eq!(ecies.open(keyring.secret(), &sealed).unwrap(), b"ping");
    }

    #[test]
    fn debug_output_omits_the_secret() {
        let keyring = Keyring::from_secret_hex(&hex::encode([5u8; 32])).unwrap();
        let rendered = format!("{keyring:?}");
        assert!(!rendered.contains(&hex::encode([5u8; 32])));
    }
}
