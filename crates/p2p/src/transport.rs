//! Capability boundaries consumed by the coordination engine.
//!
//! The engine never talks to a swarm, a key store or a cipher directly. It
//! drives them through the traits in this module so that the libp2p stack,
//! the keyring and the on-disk log can be swapped for in-memory doubles in
//! tests.

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Identity reported by the transport once it has finished starting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub peer_id: String,
    pub multiaddrs: Vec<String>,
}

/// Raw pubsub delivery handed to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubsubMessage {
    /// Originating peer as reported by the transport, never taken from the payload.
    pub from: String,
    pub topic: String,
    pub data: Vec<u8>,
}

/// Address and public key minted by the identity capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    pub address: String,
    pub public_key: String,
}

/// Failures reported by a [`Transport`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    #[error("identity unavailable: {0}")]
    Identity(String),
    #[error("dial failed: {0}")]
    Dial(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("publish failed: {0}")]
    Publish(String),
}

/// Failures reported by a [`Cipher`] or [`IdentityProvider`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct CipherError(pub String);

/// Failures reported by a [`MessageLog`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("message log: {0}")]
pub struct LogError(pub String);

/// Peer-to-peer engine: identity, swarm dialing and pubsub.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Wait for the underlying node to finish starting and report its identity.
    async fn resolve_identity(&self) -> Result<NodeIdentity, TransportError>;

    /// Dial a multiaddr. Resolves once the connection is established or has failed.
    async fn dial(&self, address: &str) -> Result<(), TransportError>;

    /// Subscribe to a pubsub topic. Messages arrive on the returned receiver
    /// in delivery order.
    async fn subscribe(
        &self,
        topic: &str,
    ) -> Result<mpsc::UnboundedReceiver<PubsubMessage>, TransportError>;

    /// Leave a pubsub topic. Receivers handed out for it are closed.
    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Publish raw bytes on a pubsub topic.
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), TransportError>;
}

/// Address/key derivation for the local node.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn derive_address_and_key(&self) -> Result<KeyMaterial, CipherError>;

    /// Private key matching [`KeyMaterial::public_key`], encoded as the cipher expects it.
    async fn private_key(&self) -> Result<String, CipherError>;
}

/// Asymmetric cipher used for end-to-end encrypted direct messages.
pub trait Cipher: Send + Sync {
    fn encrypt(&self, public_key: &str, plaintext: &[u8]) -> Result<Vec<u8>, CipherError>;
    fn decrypt(&self, private_key: &str, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError>;
}

/// Append-only durable channel for received direct messages.
pub trait MessageLog: Send + Sync {
    fn append(&self, entry: &[u8]) -> Result<(), LogError>;
    fn load(&self) -> Result<Vec<Vec<u8>>, LogError>;
}
