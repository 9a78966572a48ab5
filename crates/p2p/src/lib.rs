//! Peer coordination over circuit relays and pubsub.
//!
//! Nodes on a content-addressed network use this crate to find each other,
//! stay reachable through circuit relays, announce themselves on a shared
//! coordination channel and exchange end-to-end encrypted direct messages.
//!
//! - **engine**: bootstraps the node identity and drives the periodic loops.
//! - **relay**: keeps connections to the bootstrap circuit relays alive.
//! - **peers**: registry of announced peers plus the reconnection pass.
//! - **channels**: pubsub subscriptions with one inbound task per channel.
//! - **encryption**: decrypts the private inbox and encrypts outgoing messages.
//! - **libp2p_network**: a [`Transport`] backed by a libp2p swarm.
//!
//! The transport, key derivation, cipher and durable log are capabilities
//! injected through the traits in [`transport`].

pub mod channels;
pub mod config;
pub mod encryption;
pub mod engine;
#[cfg(feature = "libp2p-transport")]
pub mod libp2p_network;
pub mod message_log;
pub mod peers;
pub mod relay;
pub mod scheduler;
pub mod schema;
pub mod transport;

pub use channels::{ChannelManager, EnvelopeHandler, InboundEnvelope, RawMessageHandler};
pub use config::{CoordOptions, CoordTimings, PeerEviction};
pub use encryption::{DirectMessage, EncryptionGateway};
pub use engine::{CoordinationEngine, NodeState, COORDINATION_CHANNEL};
#[cfg(feature = "libp2p-transport")]
pub use libp2p::{Multiaddr, PeerId};
#[cfg(feature = "libp2p-transport")]
pub use libp2p_network::{Libp2pConfig, Libp2pEvent, Libp2pNetwork};
pub use message_log::MemoryMessageLog;
pub use peers::{PeerRecord, PeerRegistry, RefreshReport};
pub use relay::{bootstrap_relays, CircuitRelayManager, RelayRecord, RelaySweep};
pub use scheduler::{spawn_supervised, LoopHandle};
pub use schema::{
    Announcement, ChatData, ChatMessage, NodeType, Schema, SchemaError, SchemaIdentity,
};
pub use transport::{
    Cipher, CipherError, IdentityProvider, KeyMaterial, LogError, MessageLog, NodeIdentity,
    PubsubMessage, Transport, TransportError,
};

/// Coordination errors
#[derive(thiserror::Error, Debug)]
pub enum CoordError {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Identity resolution failed: {0}")]
    IdentityResolution(String),
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),
    #[error("Dial to {address} failed: {reason}")]
    Dial { address: String, reason: String },
    #[error("Publish on {topic} failed: {reason}")]
    Publish { topic: String, reason: String },
    #[error("Subscribe to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },
    #[error("Decryption failed: {0}")]
    Decryption(String),
    #[error("Encryption failed: {0}")]
    Encryption(String),
    #[error("Unknown peer: {0}")]
    UnknownPeer(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T, E = CoordError> = std::result::Result<T, E>;
