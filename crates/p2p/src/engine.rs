//! Coordination engine: identity bootstrap and the periodic control loops.
//!
//! ```text
//! bootstrap ─► resolve identity ─► schema + encryption gateway
//!           ─► start loops (relays 60s, peers 21s, announce 22s)
//!           ─► grace delay ─► relay pass + channel subscriptions ─► ready
//! ```

use crate::channels::ChannelManager;
use crate::config::{CoordOptions, CoordTimings};
use crate::encryption::{DirectMessage, EncryptionGateway};
use crate::peers::{PeerRecord, PeerRegistry};
use crate::relay::{CircuitRelayManager, RelayRecord};
use crate::scheduler::{spawn_supervised, LoopHandle};
use crate::schema::{NodeType, Schema, SchemaError, SchemaIdentity};
use crate::transport::{Cipher, IdentityProvider, MessageLog, Transport};
use crate::CoordError;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Network-wide pubsub room where every node announces itself.
pub const COORDINATION_CHANNEL: &str = "psf-ipfs-coordination-001";

/// Snapshot of the local node as seen by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeState {
    pub initialized: bool,
    /// Only ever true once `initialized` is.
    pub ready: bool,
    pub node_type: NodeType,
    pub peer_id: Option<String>,
    pub multiaddrs: Vec<String>,
    pub is_circuit_relay_node: bool,
    pub encrypt_pub_key: String,
    pub crypto_address: String,
}

pub struct CoordinationEngine {
    transport: Arc<dyn Transport>,
    identity: Arc<dyn IdentityProvider>,
    cipher: Arc<dyn Cipher>,
    message_log: Option<Arc<dyn MessageLog>>,
    timings: CoordTimings,
    relays: Arc<CircuitRelayManager>,
    peers: Arc<PeerRegistry>,
    channels: Arc<ChannelManager>,
    state: RwLock<NodeState>,
    schema: RwLock<Option<Schema>>,
    gateway: RwLock<Option<Arc<EncryptionGateway>>>,
    bootstrapping: AtomicBool,
    loops: Mutex<Vec<LoopHandle>>,
    inbox_tx: mpsc::UnboundedSender<DirectMessage>,
    inbox_rx: Mutex<Option<mpsc::UnboundedReceiver<DirectMessage>>>,
}

impl CoordinationEngine {
    /// Wire the components together. Performs no I/O.
    pub fn new(options: CoordOptions) -> Result<Arc<Self>, CoordError> {
        let transport = options
            .transport
            .ok_or_else(|| CoordError::Configuration("a transport capability is required".into()))?;
        let identity = options
            .identity
            .ok_or_else(|| CoordError::Configuration("an identity capability is required".into()))?;
        let cipher = options
            .cipher
            .ok_or_else(|| CoordError::Configuration("a cipher capability is required".into()))?;

        let relays = Arc::new(CircuitRelayManager::new(options.node_type, transport.clone()));
        for (name, address) in options.extra_relays {
            relays.add_relay(name, address);
        }
        let peers = Arc::new(PeerRegistry::new(
            transport.clone(),
            relays.clone(),
            options.eviction,
        ));
        let channels = Arc::new(ChannelManager::new(transport.clone()));
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();

        Ok(Arc::new(Self {
            transport,
            identity,
            cipher,
            message_log: options.message_log,
            timings: options.timings,
            relays,
            peers,
            channels,
            state: RwLock::new(NodeState {
                node_type: options.node_type,
                is_circuit_relay_node: options.is_circuit_relay_node,
                ..NodeState::default()
            }),
            schema: RwLock::new(None),
            gateway: RwLock::new(None),
            bootstrapping: AtomicBool::new(false),
            loops: Mutex::new(Vec::new()),
            inbox_tx,
            inbox_rx: Mutex::new(Some(inbox_rx)),
        }))
    }

    /// Bring the node up. Returns once the node is ready to coordinate.
    ///
    /// Identity, schema and gateway failures are returned. Anything after the
    /// loops have started is logged and does not fail the bootstrap.
    pub async fn bootstrap(self: &Arc<Self>) -> Result<(), CoordError> {
        if self.is_ready() {
            return Ok(());
        }
        if self.bootstrapping.swap(true, Ordering::SeqCst) {
            return Err(CoordError::Configuration(
                "bootstrap already in progress".into(),
            ));
        }
        let result = self.run_bootstrap().await;
        self.bootstrapping.store(false, Ordering::SeqCst);
        result
    }

    async fn run_bootstrap(self: &Arc<Self>) -> Result<(), CoordError> {
        let peer_id = self.resolve_identity().await?;

        let state = self.state();
        let schema = Schema::new(SchemaIdentity {
            ipfs_id: peer_id.clone(),
            node_type: state.node_type,
            multiaddrs: state.multiaddrs,
            is_circuit_relay: state.is_circuit_relay_node,
            encrypt_pub_key: state.encrypt_pub_key,
        });
        *self.schema.write() = Some(schema);

        let mut gateway = EncryptionGateway::new(
            peer_id.clone(),
            self.identity.clone(),
            self.cipher.clone(),
            self.transport.clone(),
        )
        .with_inbox(self.inbox_tx.clone());
        if let Some(log) = &self.message_log {
            gateway = gateway.with_message_log(log.clone());
        }
        *self.gateway.write() = Some(Arc::new(gateway));

        self.start_loops();

        sleep(self.timings.bootstrap_grace).await;

        self.relays.connect_all().await;
        if let Err(err) = self.manage_pubsub_channels().await {
            warn!("Initial channel subscription failed: {}", err);
        }

        self.state.write().ready = true;
        info!(peer_id = %peer_id, "Coordination engine ready");
        Ok(())
    }

    async fn resolve_identity(&self) -> Result<String, CoordError> {
        let node = self
            .transport
            .resolve_identity()
            .await
            .map_err(|err| CoordError::IdentityResolution(err.to_string()))?;
        if node.peer_id.trim().is_empty() {
            return Err(CoordError::IdentityResolution(
                "transport reported an empty peer id".into(),
            ));
        }

        {
            let mut state = self.state.write();
            if let Some(existing) = &state.peer_id {
                if *existing != node.peer_id {
                    return Err(CoordError::IdentityResolution(format!(
                        "peer id changed from {} to {}",
                        existing, node.peer_id
                    )));
                }
            }
            state.peer_id = Some(node.peer_id.clone());
            state.multiaddrs = node.multiaddrs;
        }
        self.peers.set_local_peer_id(node.peer_id.clone());

        let keys = self
            .identity
            .derive_address_and_key()
            .await
            .map_err(|err| CoordError::IdentityResolution(err.to_string()))?;
        {
            let mut state = self.state.write();
            state.encrypt_pub_key = keys.public_key;
            state.crypto_address = keys.address;
            state.initialized = true;
        }

        debug!(state = ?self.state(), "Resolved node identity");
        Ok(node.peer_id)
    }

    fn start_loops(self: &Arc<Self>) {
        let mut loops = self.loops.lock();
        if !loops.is_empty() {
            return;
        }

        let relays = self.relays.clone();
        loops.push(spawn_supervised(
            "relay-maintenance",
            self.timings.relay_interval,
            move || {
                let relays = relays.clone();
                async move {
                    relays.connect_all().await;
                    Ok(())
                }
            },
        ));

        let peers = self.peers.clone();
        loops.push(spawn_supervised(
            "peer-maintenance",
            self.timings.peer_interval,
            move || {
                let peers = peers.clone();
                async move {
                    peers.refresh_peer_connections().await;
                    peers.evict_stale(Utc::now()).await;
                    Ok(())
                }
            },
        ));

        let engine = Arc::downgrade(self);
        loops.push(spawn_supervised(
            "self-announce",
            self.timings.announce_interval,
            move || {
                let engine = engine.clone();
                async move {
                    if let Some(engine) = engine.upgrade() {
                        engine.self_announce().await?;
                    }
                    Ok(())
                }
            },
        ));
    }

    pub fn is_ready(&self) -> bool {
        self.state.read().ready
    }

    /// Suspend until the node is ready, checking once per poll interval.
    pub async fn wait_until_ready(&self) {
        while !self.is_ready() {
            sleep(self.timings.ready_poll_interval).await;
        }
    }

    /// Publish our announcement on the coordination channel.
    pub async fn self_announce(&self) -> Result<(), CoordError> {
        if !self.state.read().initialized {
            debug!("Skipping announcement, node identity not resolved yet");
            return Ok(());
        }
        self.refresh_multiaddrs().await;
        let announcement = match self.schema.read().as_ref() {
            Some(schema) => schema.announcement()?,
            None => return Err(SchemaError::MissingIdentity("ipfsId").into()),
        };

        self.channels
            .publish(COORDINATION_CHANNEL, &announcement)
            .await?;
        info!(
            "{}: Announced self on {} pubsub channel",
            Utc::now().to_rfc3339(),
            COORDINATION_CHANNEL
        );
        Ok(())
    }

    /// Pick up addresses gained since bootstrap, such as relay circuits.
    async fn refresh_multiaddrs(&self) {
        let node = match self.transport.resolve_identity().await {
            Ok(node) => node,
            Err(err) => {
                debug!("Keeping previous multiaddrs: {}", err);
                return;
            }
        };
        if self.state.read().multiaddrs == node.multiaddrs {
            return;
        }
        debug!(multiaddrs = ?node.multiaddrs, "Advertised addresses changed");
        if let Some(schema) = self.schema.write().as_mut() {
            schema.set_multiaddrs(node.multiaddrs.clone());
        }
        self.state.write().multiaddrs = node.multiaddrs;
    }

    /// Join the coordination channel and our private inbox. Safe to repeat.
    pub async fn manage_pubsub_channels(&self) -> Result<(), CoordError> {
        let (initialized, peer_id) = {
            let state = self.state.read();
            (state.initialized, state.peer_id.clone())
        };
        let (true, Some(peer_id)) = (initialized, peer_id) else {
            debug!("Skipping channel subscriptions, node identity not resolved yet");
            return Ok(());
        };

        self.channels
            .subscribe(COORDINATION_CHANNEL, self.peers.clone())
            .await?;

        let gateway = self.gateway.read().clone();
        match gateway {
            Some(gateway) => {
                self.channels.subscribe_raw(&peer_id, gateway).await?;
            }
            None => warn!("No encryption gateway yet, private channel {} not joined", peer_id),
        }

        debug!(channels = ?self.channels.subscribed_channels(), "Pubsub channels managed");
        Ok(())
    }

    /// Encrypt a chat message to a known peer and publish it on the peer's channel.
    pub async fn send_private_message(
        &self,
        peer_id: &str,
        message: &str,
        handle: Option<&str>,
    ) -> Result<(), CoordError> {
        let peer = self
            .peers
            .get(peer_id)
            .ok_or_else(|| CoordError::UnknownPeer(peer_id.to_string()))?;
        let chat = match self.schema.read().as_ref() {
            Some(schema) => schema.chat(message, handle)?,
            None => return Err(SchemaError::MissingIdentity("ipfsId").into()),
        };
        let gateway = self
            .gateway
            .read()
            .clone()
            .ok_or_else(|| CoordError::Configuration("engine has not been bootstrapped".into()))?;

        let plaintext = serde_json::to_vec(&chat)?;
        gateway.send_encrypted(&peer, &plaintext).await
    }

    /// Decrypted direct messages. Can only be taken once.
    pub fn take_inbox(&self) -> Option<mpsc::UnboundedReceiver<DirectMessage>> {
        self.inbox_rx.lock().take()
    }

    pub fn relays(&self) -> Vec<RelayRecord> {
        self.relays.relays()
    }

    pub fn peers(&self) -> Vec<PeerRecord> {
        self.peers.peers()
    }

    pub fn state(&self) -> NodeState {
        self.state.read().clone()
    }

    pub fn relay_manager(&self) -> &Arc<CircuitRelayManager> {
        &self.relays
    }

    pub fn peer_registry(&self) -> &Arc<PeerRegistry> {
        &self.peers
    }

    pub fn channel_manager(&self) -> &Arc<ChannelManager> {
        &self.channels
    }

    /// Stop the loops and channel tasks. Safe to call more than once.
    pub async fn shutdown(&self) {
        let loops: Vec<LoopHandle> = self.loops.lock().drain(..).collect();
        for handle in &loops {
            handle.stop();
        }
        self.channels.shutdown();
        if !loops.is_empty() {
            info!("Coordination engine stopped");
        }
    }
}
