//! Engine options and loop cadences.

use crate::schema::NodeType;
use crate::transport::{Cipher, IdentityProvider, MessageLog, Transport};
use std::sync::Arc;
use std::time::Duration;

/// Cadences of the periodic loops and the bootstrap delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordTimings {
    pub relay_interval: Duration,
    pub peer_interval: Duration,
    pub announce_interval: Duration,
    /// Pause between starting the loops and the first immediate passes.
    pub bootstrap_grace: Duration,
    pub ready_poll_interval: Duration,
}

impl Default for CoordTimings {
    fn default() -> Self {
        Self {
            relay_interval: Duration::from_secs(60),
            peer_interval: Duration::from_secs(21),
            announce_interval: Duration::from_secs(22),
            bootstrap_grace: Duration::from_secs(5),
            ready_poll_interval: Duration::from_secs(1),
        }
    }
}

/// Bounds on the peer registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerEviction {
    /// Drop peers whose last announcement is older than this. `None` keeps
    /// peers until the capacity cap pushes them out.
    pub ttl: Option<Duration>,
    pub max_peers: usize,
}

impl Default for PeerEviction {
    fn default() -> Self {
        Self {
            ttl: None,
            max_peers: 1024,
        }
    }
}

/// Everything the coordination engine needs at construction time.
///
/// `transport`, `identity` and `cipher` are mandatory; the engine refuses to
/// start without them.
#[derive(Clone, Default)]
pub struct CoordOptions {
    pub transport: Option<Arc<dyn Transport>>,
    pub identity: Option<Arc<dyn IdentityProvider>>,
    pub cipher: Option<Arc<dyn Cipher>>,
    pub node_type: NodeType,
    pub is_circuit_relay_node: bool,
    /// `(name, multiaddr)` relays dialed in addition to the bootstrap table.
    pub extra_relays: Vec<(String, String)>,
    pub timings: CoordTimings,
    pub eviction: PeerEviction,
    pub message_log: Option<Arc<dyn MessageLog>>,
}

impl CoordOptions {
    pub fn new(
        transport: Arc<dyn Transport>,
        identity: Arc<dyn IdentityProvider>,
        cipher: Arc<dyn Cipher>,
    ) -> Self {
        Self {
            transport: Some(transport),
            identity: Some(identity),
            cipher: Some(cipher),
            ..Self::default()
        }
    }

    pub fn with_node_type(mut self, node_type: NodeType) -> Self {
        self.node_type = node_type;
        self
    }

    pub fn with_circuit_relay(mut self, enabled: bool) -> Self {
        self.is_circuit_relay_node = enabled;
        self
    }

    pub fn with_extra_relay(mut self, name: impl Into<String>, address: impl Into<String>) -> Self {
        self.extra_relays.push((name.into(), address.into()));
        self
    }

    pub fn with_timings(mut self, timings: CoordTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn with_eviction(mut self, eviction: PeerEviction) -> Self {
        self.eviction = eviction;
        self
    }

    pub fn with_message_log(mut self, log: Arc<dyn MessageLog>) -> Self {
        self.message_log = Some(log);
        self
    }
}

impl std::fmt::Debug for CoordOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordOptions")
            .field("transport", &self.transport.is_some())
            .field("identity", &self.identity.is_some())
            .field("cipher", &self.cipher.is_some())
            .field("node_type", &self.node_type)
            .field("is_circuit_relay_node", &self.is_circuit_relay_node)
            .field("extra_relays", &self.extra_relays)
            .field("timings", &self.timings)
            .field("eviction", &self.eviction)
            .field("message_log", &self.message_log.is_some())
            .finish()
    }
}
