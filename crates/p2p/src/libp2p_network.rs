//! libp2p-backed [`Transport`](crate::transport::Transport).
//!
//! A background task owns the swarm (tcp, dns and websocket under noise +
//! yamux, gossipsub,
//! identify, ping, circuit relay client and DCUtR, plus an optional relay
//! server). Callers drive it through a command channel; every command that
//! needs an answer carries a oneshot reply.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::StreamExt;
use libp2p::core::transport::OrTransport;
use libp2p::core::upgrade;
use libp2p::dcutr;
use libp2p::dns;
use libp2p::gossipsub;
use libp2p::identify;
use libp2p::identity;
use libp2p::multiaddr::Protocol;
use libp2p::noise;
use libp2p::ping;
use libp2p::relay;
use libp2p::swarm::behaviour::toggle::Toggle;
use libp2p::swarm::dial_opts::DialOpts;
use libp2p::swarm::{ConnectionId, NetworkBehaviour, Swarm, SwarmEvent};
use libp2p::tcp;
use libp2p::websocket;
use libp2p::yamux;
use libp2p::Transport as _;
use libp2p::{Multiaddr, PeerId};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::transport::{NodeIdentity, PubsubMessage, Transport, TransportError};

/// Configuration for the libp2p network.
#[derive(Debug, Clone)]
pub struct Libp2pConfig {
    /// Addresses to listen on. If empty, the swarm defaults to `/ip4/0.0.0.0/tcp/4001`.
    pub listen_addresses: Vec<Multiaddr>,
    /// Relays on which to request a circuit reservation once connected.
    pub reservation_relays: Vec<Multiaddr>,
    /// Serve circuit relay reservations for other peers.
    pub enable_relay_server: bool,
    /// Optional deterministic identity. If `None`, a new Ed25519 keypair is generated.
    pub identity_keypair: Option<identity::Keypair>,
    /// How long a dial may take before it is reported as failed.
    pub dial_timeout: Duration,
    /// How long [`Transport::resolve_identity`] waits for the first listen address.
    pub startup_timeout: Duration,
    pub protocol_version: String,
    pub agent_version: String,
}

impl Default for Libp2pConfig {
    fn default() -> Self {
        let default_listen = Multiaddr::empty()
            .with(Protocol::Ip4([0, 0, 0, 0].into()))
            .with(Protocol::Tcp(4001));
        Self {
            listen_addresses: vec![default_listen],
            reservation_relays: Vec::new(),
            enable_relay_server: false,
            identity_keypair: None,
            dial_timeout: Duration::from_secs(10),
            startup_timeout: Duration::from_secs(30),
            protocol_version: "/peercoord/1.0.0".to_string(),
            agent_version: format!("peercoord/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

type Reply = oneshot::Sender<Result<(), String>>;

/// Commands used to control the background swarm task.
#[derive(Debug)]
pub enum Libp2pCommand {
    Publish {
        topic: String,
        data: Vec<u8>,
        reply: Reply,
    },
    Subscribe {
        topic: String,
        sender: mpsc::UnboundedSender<PubsubMessage>,
        reply: Reply,
    },
    Unsubscribe {
        topic: String,
        reply: Reply,
    },
    Dial {
        address: Multiaddr,
        reply: Reply,
    },
    /// Gracefully stop the swarm.
    Shutdown,
}

/// Connectivity events produced by the libp2p network.
#[derive(Debug, Clone)]
pub enum Libp2pEvent {
    PeerConnected { peer: PeerId },
    PeerDisconnected { peer: PeerId },
    NewListenAddr { address: Multiaddr },
    /// A relay accepted our circuit reservation.
    RelayReservationAccepted { relay: PeerId },
    HolePunchSucceeded { peer: PeerId },
    HolePunchFailed { peer: PeerId, error: String },
}

#[derive(NetworkBehaviour)]
#[behaviour(to_swarm = "ComposedEvent")]
struct ComposedBehaviour {
    gossipsub: gossipsub::Behaviour,
    identify: identify::Behaviour,
    ping: ping::Behaviour,
    relay_client: relay::client::Behaviour,
    relay_server: Toggle<relay::Behaviour>,
    dcutr: dcutr::Behaviour,
}

impl ComposedBehaviour {
    fn new(
        local_key: &identity::Keypair,
        peer_id: PeerId,
        config: &Libp2pConfig,
        relay_client: relay::client::Behaviour,
    ) -> Result<Self> {
        // Identical payloads from one source still get distinct ids.
        let message_id_fn = |message: &gossipsub::Message| {
            let mut hasher = blake3::Hasher::new();
            if let Some(source) = &message.source {
                hasher.update(&source.to_bytes());
            }
            if let Some(seq) = message.sequence_number {
                hasher.update(&seq.to_be_bytes());
            }
            hasher.update(&message.data);
            gossipsub::MessageId::from(hasher.finalize().as_bytes())
        };

        let gossip_config = gossipsub::ConfigBuilder::default()
            .message_id_fn(message_id_fn)
            .validation_mode(gossipsub::ValidationMode::Strict)
            .heartbeat_interval(Duration::from_secs(1))
            .build()
            .map_err(|err| anyhow!("failed to build gossipsub config: {err}"))?;

        let gossipsub = gossipsub::Behaviour::new(
            gossipsub::MessageAuthenticity::Signed(local_key.clone()),
            gossip_config,
        )
        .map_err(|err| anyhow!("failed to construct gossipsub behaviour: {err}"))?;

        let identify = identify::Behaviour::new(
            identify::Config::new(config.protocol_version.clone(), local_key.public())
                .with_agent_version(config.agent_version.clone()),
        );

        let relay_server = Toggle::from(
            config
                .enable_relay_server
                .then(|| relay::Behaviour::new(peer_id, relay::Config::default())),
        );

        Ok(Self {
            gossipsub,
            identify,
            ping: ping::Behaviour::default(),
            relay_client,
            relay_server,
            dcutr: dcutr::Behaviour::new(peer_id),
        })
    }
}

#[allow(clippy::large_enum_variant, dead_code)]
#[derive(Debug)]
enum ComposedEvent {
    Gossipsub(Box<gossipsub::Event>),
    Identify(Box<identify::Event>),
    Ping(ping::Event),
    RelayClient(relay::client::Event),
    RelayServer(relay::Event),
    Dcutr(dcutr::Event),
}

impl From<gossipsub::Event> for ComposedEvent {
    fn from(value: gossipsub::Event) -> Self {
        ComposedEvent::Gossipsub(Box::new(value))
    }
}

impl From<identify::Event> for ComposedEvent {
    fn from(value: identify::Event) -> Self {
        ComposedEvent::Identify(Box::new(value))
    }
}

impl From<ping::Event> for ComposedEvent {
    fn from(value: ping::Event) -> Self {
        ComposedEvent::Ping(value)
    }
}

impl From<relay::client::Event> for ComposedEvent {
    fn from(value: relay::client::Event) -> Self {
        ComposedEvent::RelayClient(value)
    }
}

impl From<relay::Event> for ComposedEvent {
    fn from(value: relay::Event) -> Self {
        ComposedEvent::RelayServer(value)
    }
}

impl From<dcutr::Event> for ComposedEvent {
    fn from(value: dcutr::Event) -> Self {
        ComposedEvent::Dcutr(value)
    }
}

/// State owned by the swarm task.
struct SwarmState {
    subscribers: HashMap<gossipsub::TopicHash, Vec<mpsc::UnboundedSender<PubsubMessage>>>,
    pending_dials: HashMap<ConnectionId, Reply>,
    reservation_relays: HashMap<PeerId, Multiaddr>,
    reserved: HashSet<PeerId>,
    listen_addresses: watch::Sender<Vec<Multiaddr>>,
    events: mpsc::UnboundedSender<Libp2pEvent>,
}

/// Handle to the background swarm.
pub struct Libp2pNetwork {
    peer_id: PeerId,
    config: Libp2pConfig,
    command_tx: mpsc::UnboundedSender<Libp2pCommand>,
    events_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<Libp2pEvent>>>>,
    listen_rx: watch::Receiver<Vec<Multiaddr>>,
    _task: JoinHandle<()>,
}

impl Libp2pNetwork {
    /// Initialise the libp2p network and spawn the background swarm.
    pub fn new(config: Libp2pConfig) -> Result<Self> {
        let keypair = config
            .identity_keypair
            .clone()
            .unwrap_or_else(identity::Keypair::generate_ed25519);
        let peer_id = PeerId::from(keypair.public());
        info!("Initialising libp2p peer {}", peer_id);

        let (relay_transport, relay_client) = relay::client::new(peer_id);
        let tcp_transport = dns::tokio::Transport::system(tcp::tokio::Transport::new(
            tcp::Config::default().nodelay(true),
        ))?;
        // Browser relays are only reachable over /wss.
        let ws_transport = websocket::Config::new(dns::tokio::Transport::system(
            tcp::tokio::Transport::new(tcp::Config::default().nodelay(true)),
        )?);
        let transport = OrTransport::new(relay_transport, OrTransport::new(ws_transport, tcp_transport))
            .upgrade(upgrade::Version::V1)
            .authenticate(noise::Config::new(&keypair)?)
            .multiplex(yamux::Config::default())
            .boxed();

        let behaviour = ComposedBehaviour::new(&keypair, peer_id, &config, relay_client)?;
        let swarm_config = libp2p::swarm::Config::with_tokio_executor()
            .with_idle_connection_timeout(Duration::from_secs(120));
        let mut swarm = Swarm::new(transport, behaviour, peer_id, swarm_config);

        let listen_addrs = if config.listen_addresses.is_empty() {
            vec![Multiaddr::from_str("/ip4/0.0.0.0/tcp/4001")?]
        } else {
            config.listen_addresses.clone()
        };
        for addr in listen_addrs {
            if let Err(err) = swarm.listen_on(addr.clone()) {
                warn!("Failed to listen on {addr}: {err}");
            }
        }

        let (command_tx, mut command_rx) = mpsc::unbounded_channel::<Libp2pCommand>();
        let (event_tx, events_rx) = mpsc::unbounded_channel::<Libp2pEvent>();
        let (listen_tx, listen_rx) = watch::channel(Vec::new());

        let mut state = SwarmState {
            subscribers: HashMap::new(),
            pending_dials: HashMap::new(),
            reservation_relays: config
                .reservation_relays
                .iter()
                .filter_map(|addr| extract_peer_id(addr).map(|peer| (peer, addr.clone())))
                .collect(),
            reserved: HashSet::new(),
            listen_addresses: listen_tx,
            events: event_tx,
        };

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    swarm_event = swarm.select_next_some() => {
                        handle_swarm_event(swarm_event, &mut swarm, &mut state);
                    }
                    cmd = command_rx.recv() => {
                        match cmd {
                            Some(Libp2pCommand::Shutdown) | None => {
                                debug!("Shutting down libp2p swarm");
                                break;
                            }
                            Some(other) => handle_command(other, &mut swarm, &mut state),
                        }
                    }
                }
            }
            info!("libp2p swarm task terminated");
        });

        Ok(Self {
            peer_id,
            config,
            command_tx,
            events_rx: Arc::new(Mutex::new(Some(events_rx))),
            listen_rx,
            _task: task,
        })
    }

    /// Returns the local peer ID.
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Returns a snapshot of the addresses the swarm is listening on.
    pub fn listen_addresses(&self) -> Vec<Multiaddr> {
        self.listen_rx.borrow().clone()
    }

    /// Acquire the event receiver stream. Subsequent calls return `None`.
    pub fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<Libp2pEvent>> {
        self.events_rx.lock().take()
    }

    /// Request swarm shutdown.
    pub fn shutdown(&self) {
        let _ = self.command_tx.send(Libp2pCommand::Shutdown);
    }

    async fn request(
        &self,
        build: impl FnOnce(Reply) -> Libp2pCommand,
    ) -> Result<Result<(), String>, TransportError> {
        let (reply, response) = oneshot::channel();
        self.command_tx
            .send(build(reply))
            .map_err(|_| TransportError::Unavailable("libp2p swarm command channel closed".into()))?;
        response
            .await
            .map_err(|_| TransportError::Unavailable("libp2p swarm dropped the request".into()))
    }
}

impl Drop for Libp2pNetwork {
    fn drop(&mut self) {
        let _ = self.command_tx.send(Libp2pCommand::Shutdown);
    }
}

#[async_trait]
impl Transport for Libp2pNetwork {
    async fn resolve_identity(&self) -> Result<NodeIdentity, TransportError> {
        let mut listen_rx = self.listen_rx.clone();
        let addresses = tokio::time::timeout(
            self.config.startup_timeout,
            listen_rx.wait_for(|addrs| !addrs.is_empty()),
        )
        .await
        .map_err(|_| TransportError::Identity("swarm did not start listening in time".into()))?
        .map_err(|_| TransportError::Unavailable("libp2p swarm stopped".into()))?
        .clone();

        let multiaddrs = addresses
            .into_iter()
            .map(|addr| addr.with(Protocol::P2p(self.peer_id)).to_string())
            .collect();
        Ok(NodeIdentity {
            peer_id: self.peer_id.to_string(),
            multiaddrs,
        })
    }

    async fn dial(&self, address: &str) -> Result<(), TransportError> {
        let address = Multiaddr::from_str(address)
            .map_err(|err| TransportError::Dial(format!("invalid multiaddr {address}: {err}")))?;
        let outcome = tokio::time::timeout(
            self.config.dial_timeout,
            self.request(|reply| Libp2pCommand::Dial { address, reply }),
        )
        .await
        .map_err(|_| TransportError::Dial("timed out".into()))??;
        outcome.map_err(TransportError::Dial)
    }

    async fn subscribe(
        &self,
        topic: &str,
    ) -> Result<mpsc::UnboundedReceiver<PubsubMessage>, TransportError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.request(|reply| Libp2pCommand::Subscribe {
            topic: topic.to_string(),
            sender,
            reply,
        })
        .await?
        .map_err(TransportError::Subscribe)?;
        Ok(receiver)
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.request(|reply| Libp2pCommand::Unsubscribe {
            topic: topic.to_string(),
            reply,
        })
        .await?
        .map_err(TransportError::Subscribe)
    }

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), TransportError> {
        self.request(|reply| Libp2pCommand::Publish {
            topic: topic.to_string(),
            data,
            reply,
        })
        .await?
        .map_err(TransportError::Publish)
    }
}

fn handle_swarm_event(
    event: SwarmEvent<ComposedEvent>,
    swarm: &mut Swarm<ComposedBehaviour>,
    state: &mut SwarmState,
) {
    match event {
        SwarmEvent::Behaviour(ComposedEvent::Gossipsub(event)) => {
            if let gossipsub::Event::Message {
                propagation_source,
                message,
                ..
            } = *event
            {
                if let Some(senders) = state.subscribers.get_mut(&message.topic) {
                    let delivery = PubsubMessage {
                        from: message.source.unwrap_or(propagation_source).to_string(),
                        topic: message.topic.to_string(),
                        data: message.data,
                    };
                    senders.retain(|sender| sender.send(delivery.clone()).is_ok());
                }
            }
        }
        SwarmEvent::Behaviour(ComposedEvent::RelayClient(event)) => {
            if let relay::client::Event::ReservationReqAccepted { relay_peer_id, .. } = event {
                info!("Relay reservation accepted on {}", relay_peer_id);
                let _ = state.events.send(Libp2pEvent::RelayReservationAccepted {
                    relay: relay_peer_id,
                });
            }
        }
        SwarmEvent::Behaviour(ComposedEvent::RelayServer(event)) => {
            debug!("Relay server event: {:?}", event);
        }
        SwarmEvent::Behaviour(ComposedEvent::Dcutr(event)) => match event.result {
            Ok(_) => {
                let _ = state.events.send(Libp2pEvent::HolePunchSucceeded {
                    peer: event.remote_peer_id,
                });
            }
            Err(err) => {
                let _ = state.events.send(Libp2pEvent::HolePunchFailed {
                    peer: event.remote_peer_id,
                    error: err.to_string(),
                });
            }
        },
        SwarmEvent::ConnectionEstablished {
            peer_id,
            connection_id,
            ..
        } => {
            if let Some(reply) = state.pending_dials.remove(&connection_id) {
                let _ = reply.send(Ok(()));
            }
            if let Some(relay_addr) = state.reservation_relays.get(&peer_id) {
                if state.reserved.insert(peer_id) {
                    let circuit = relay_addr.clone().with(Protocol::P2pCircuit);
                    if let Err(err) = swarm.listen_on(circuit.clone()) {
                        warn!("Failed to listen via relay {}: {}", circuit, err);
                    }
                }
            }
            let _ = state.events.send(Libp2pEvent::PeerConnected { peer: peer_id });
        }
        SwarmEvent::OutgoingConnectionError {
            connection_id,
            error,
            ..
        } => {
            if let Some(reply) = state.pending_dials.remove(&connection_id) {
                let _ = reply.send(Err(error.to_string()));
            }
        }
        SwarmEvent::ConnectionClosed {
            peer_id,
            num_established,
            ..
        } => {
            if num_established == 0 {
                state.reserved.remove(&peer_id);
                let _ = state.events.send(Libp2pEvent::PeerDisconnected { peer: peer_id });
            }
        }
        SwarmEvent::NewListenAddr { address, .. } => {
            debug!("Listening on {}", address);
            state.listen_addresses.send_modify(|addrs| {
                if !addrs.contains(&address) {
                    addrs.push(address.clone());
                }
            });
            let _ = state.events.send(Libp2pEvent::NewListenAddr { address });
        }
        SwarmEvent::ExpiredListenAddr { address, .. } => {
            state
                .listen_addresses
                .send_modify(|addrs| addrs.retain(|known| *known != address));
        }
        _ => {}
    }
}

fn handle_command(command: Libp2pCommand, swarm: &mut Swarm<ComposedBehaviour>, state: &mut SwarmState) {
    match command {
        Libp2pCommand::Publish { topic, data, reply } => {
            let topic_id = gossipsub::IdentTopic::new(topic.as_str());
            let outcome = swarm
                .behaviour_mut()
                .gossipsub
                .publish(topic_id, data)
                .map(|_| ())
                .map_err(|err| err.to_string());
            if let Err(err) = &outcome {
                debug!("Failed to publish libp2p gossip on {topic}: {err}");
            }
            let _ = reply.send(outcome);
        }
        Libp2pCommand::Subscribe {
            topic,
            sender,
            reply,
        } => {
            let topic_id = gossipsub::IdentTopic::new(topic.as_str());
            let outcome = swarm
                .behaviour_mut()
                .gossipsub
                .subscribe(&topic_id)
                .map(|_| ())
                .map_err(|err| err.to_string());
            if outcome.is_ok() {
                state
                    .subscribers
                    .entry(topic_id.hash())
                    .or_default()
                    .push(sender);
            } else {
                warn!("Failed to subscribe to gossip topic {topic}");
            }
            let _ = reply.send(outcome);
        }
        Libp2pCommand::Unsubscribe { topic, reply } => {
            let topic_id = gossipsub::IdentTopic::new(topic.as_str());
            let _ = swarm.behaviour_mut().gossipsub.unsubscribe(&topic_id);
            state.subscribers.remove(&topic_id.hash());
            debug!("Left gossip topic {topic}");
            let _ = reply.send(Ok(()));
        }
        Libp2pCommand::Dial { address, reply } => {
            let opts = DialOpts::unknown_peer_id().address(address.clone()).build();
            let connection_id = opts.connection_id();
            match swarm.dial(opts) {
                Ok(()) => {
                    state.pending_dials.insert(connection_id, reply);
                }
                Err(err) => {
                    debug!("Failed to dial {}: {}", address, err);
                    let _ = reply.send(Err(err.to_string()));
                }
            }
        }
        Libp2pCommand::Shutdown => {}
    }
}

fn extract_peer_id(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().find_map(|protocol| match protocol {
        Protocol::P2p(peer_id) => Some(peer_id),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback_config() -> Libp2pConfig {
        Libp2pConfig {
            listen_addresses: vec![Multiaddr::from_str("/ip4/127.0.0.1/tcp/0").unwrap()],
            startup_timeout: Duration::from_secs(5),
            dial_timeout: Duration::from_secs(5),
            ..Libp2pConfig::default()
        }
    }

    #[test]
    fn config_default_has_listen_address() {
        let config = Libp2pConfig::default();
        assert_eq!(config.listen_addresses[0].to_string(), "/ip4/0.0.0.0/tcp/4001");
        assert!(!config.enable_relay_server);
    }

    #[test]
    fn peer_id_is_read_from_multiaddr() {
        let peer = PeerId::random();
        let addr = Multiaddr::from_str("/ip4/10.0.0.1/tcp/4001")
            .unwrap()
            .with(Protocol::P2p(peer));
        assert_eq!(extract_peer_id(&addr), Some(peer));
        assert_eq!(
            extract_peer_id(&Multiaddr::from_str("/ip4/10.0.0.1/tcp/4001").unwrap()),
            None
        );
    }

    #[tokio::test]
    async fn identity_reports_listen_addresses_with_peer_id() {
        let network = Libp2pNetwork::new(loopback_config()).expect("network");
        let identity = network.resolve_identity().await.expect("identity");

        assert_eq!(identity.peer_id, network.peer_id().to_string());
        assert!(!identity.multiaddrs.is_empty());
        assert!(identity
            .multiaddrs
            .iter()
            .all(|addr| addr.starts_with("/ip4/127.0.0.1/tcp/") && addr.ends_with(&identity.peer_id)));
        network.shutdown();
    }

    #[tokio::test]
    async fn dial_reports_its_own_outcome() {
        let listener = Libp2pNetwork::new(loopback_config()).expect("listener");
        let dialer = Libp2pNetwork::new(loopback_config()).expect("dialer");
        let target = listener.resolve_identity().await.expect("identity");

        dialer.dial(&target.multiaddrs[0]).await.expect("dial succeeds");

        // Nothing listens on port 1.
        let refused = dialer.dial("/ip4/127.0.0.1/tcp/1").await;
        assert!(matches!(refused, Err(TransportError::Dial(_))));
        assert!(matches!(
            dialer.dial("not a multiaddr").await,
            Err(TransportError::Dial(_))
        ));
    }

    #[tokio::test]
    async fn secure_websocket_addresses_are_dialable() {
        let dialer = Libp2pNetwork::new(loopback_config()).expect("dialer");
        let address = format!("/ip4/127.0.0.1/tcp/1/wss/p2p/{}", PeerId::random());

        match dialer.dial(&address).await {
            Err(TransportError::Dial(reason)) => {
                assert!(!reason.contains("Multiaddr is not supported"), "{reason}");
            }
            other => panic!("expected a refused connection, got {other:?}"),
        }
        dialer.shutdown();
    }

    #[tokio::test]
    async fn identical_payloads_are_delivered_every_time() {
        let sender = Libp2pNetwork::new(loopback_config()).expect("sender");
        let receiver = Libp2pNetwork::new(loopback_config()).expect("receiver");
        let target = receiver.resolve_identity().await.expect("identity");
        let _own = sender.subscribe("coord").await.expect("subscribe");
        let mut inbox = receiver.subscribe("coord").await.expect("subscribe");
        sender.dial(&target.multiaddrs[0]).await.expect("dial");

        let announcement = br#"{"apiName":"ipfs-coord","ipfsId":"QmSame"}"#.to_vec();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while sender.publish("coord", announcement.clone()).await.is_err() {
            assert!(tokio::time::Instant::now() < deadline, "topic never gained a peer");
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let first = tokio::time::timeout(Duration::from_secs(5), inbox.recv())
            .await
            .expect("first delivery")
            .expect("inbox open");
        assert_eq!(first.data, announcement);
        assert_eq!(first.from, sender.peer_id().to_string());

        sender
            .publish("coord", announcement.clone())
            .await
            .expect("repeat publish is not a duplicate");
        let second = tokio::time::timeout(Duration::from_secs(5), inbox.recv())
            .await
            .expect("second delivery")
            .expect("inbox open");
        assert_eq!(second.data, announcement);

        sender.shutdown();
        receiver.shutdown();
    }

    #[tokio::test]
    async fn unsubscribe_closes_the_topic_receiver() {
        let network = Libp2pNetwork::new(loopback_config()).expect("network");
        network.resolve_identity().await.expect("identity");
        let mut receiver = network.subscribe("peercoord/evicted").await.expect("subscribe");

        network.unsubscribe("peercoord/evicted").await.expect("unsubscribe");
        let closed = tokio::time::timeout(Duration::from_secs(5), receiver.recv())
            .await
            .expect("sender dropped");
        assert!(closed.is_none());
        network.shutdown();
    }

    #[tokio::test]
    async fn subscribe_accepts_repeat_topics() {
        let network = Libp2pNetwork::new(loopback_config()).expect("network");
        network.resolve_identity().await.expect("identity");
        let _first = network.subscribe("peercoord/test").await.expect("subscribe");
        let _second = network.subscribe("peercoord/test").await.expect("subscribe again");
        network.shutdown();
    }
}
