//! Circuit relay upkeep.

use crate::schema::NodeType;
use crate::transport::Transport;
use crate::CoordError;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Well-known relays reachable from browsers over secure websockets.
const BROWSER_RELAYS: &[(&str, &str)] = &[
    (
        "ipfs-cr-wss.fullstack.nl",
        "/dns4/ipfs-cr-wss.fullstackcash.nl/tcp/443/wss/p2p/QmRrUu64cAnPntYiUc7xMunLKZgj1XZT5HmqJNtDMqQcD7",
    ),
    (
        "node0.preload.ipfs.io",
        "/dns4/node0.preload.ipfs.io/tcp/443/wss/p2p/QmZMxNdpMkewiVZLMRxaNxUeZpDUb34pWjZ1kZvsd16Zic",
    ),
    (
        "node1.preload.ipfs.io",
        "/dns4/node1.preload.ipfs.io/tcp/443/wss/p2p/Qmbut9Ywz9YEDrz8ySBSgWyJk41Uvm2QJPhwDJzJyGFsD6",
    ),
    (
        "node2.preload.ipfs.io",
        "/dns4/node2.preload.ipfs.io/tcp/443/wss/p2p/QmV7gnbW5VTcJ3oyM2Xk1rdFBJ3kTkvxc87UFGsun29STS",
    ),
    (
        "node3.preload.ipfs.io",
        "/dns4/node3.preload.ipfs.io/tcp/443/wss/p2p/QmY7JB6MQXhxHvq7dBDh4HpbH29v4yE9JRadAVpndvzySN",
    ),
];

/// Well-known relays for server nodes, dialed over plain TCP.
const NODE_RELAYS: &[(&str, &str)] = &[
    (
        "ipfs.fullstack.cash",
        "/ip4/116.203.193.74/tcp/4001/p2p/QmNZktxkfScScnHCFSGKELH3YRqdxHQ3Le9rAoRLhZ6vgL",
    ),
    (
        "chat.psfoundation.cash",
        "/ip4/138.68.212.34/tcp/4002/p2p/QmaUW4oCVPUFLRqeSjvhHwGFJHGWrYWLBEt7WxnexDm3Xa",
    ),
    (
        "ipfs-cr.fullstack.nl",
        "/ip4/157.90.20.129/tcp/4002/p2p/QmRrUu64cAnPntYiUc7xMunLKZgj1XZT5HmqJNtDMqQcD7",
    ),
];

/// Known circuit relay and the outcome of the last dial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayRecord {
    pub name: String,
    pub address: String,
    pub connected: bool,
    pub last_attempt: Option<DateTime<Utc>>,
}

impl RelayRecord {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            connected: false,
            last_attempt: None,
        }
    }
}

/// Summary of one [`CircuitRelayManager::connect_all`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelaySweep {
    pub attempted: usize,
    pub connected: usize,
    pub failed: usize,
}

/// Static bootstrap relay table for the given node type.
pub fn bootstrap_relays(node_type: NodeType) -> Vec<RelayRecord> {
    let table = match node_type {
        NodeType::Browser => BROWSER_RELAYS,
        NodeType::Node => NODE_RELAYS,
    };
    table
        .iter()
        .map(|(name, address)| RelayRecord::new(*name, *address))
        .collect()
}

/// Dial `address`, tagging a failure with the address it was for.
pub(crate) async fn dial(transport: &dyn Transport, address: &str) -> Result<(), CoordError> {
    transport.dial(address).await.map_err(|err| CoordError::Dial {
        address: address.to_string(),
        reason: err.to_string(),
    })
}

pub struct CircuitRelayManager {
    transport: Arc<dyn Transport>,
    relays: RwLock<Vec<RelayRecord>>,
}

impl CircuitRelayManager {
    pub fn new(node_type: NodeType, transport: Arc<dyn Transport>) -> Self {
        Self::with_relays(bootstrap_relays(node_type), transport)
    }

    pub fn with_relays(relays: Vec<RelayRecord>, transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            relays: RwLock::new(relays),
        }
    }

    /// Register a relay discovered at runtime. Returns `false` when the
    /// address is already known.
    pub fn add_relay(&self, name: impl Into<String>, address: impl Into<String>) -> bool {
        let address = address.into();
        let mut relays = self.relays.write();
        if relays.iter().any(|relay| relay.address == address) {
            return false;
        }
        relays.push(RelayRecord::new(name, address));
        true
    }

    /// Dial every known relay concurrently.
    ///
    /// A failed dial only marks its own record as disconnected; the pass
    /// itself never fails.
    pub async fn connect_all(&self) -> RelaySweep {
        let targets: Vec<(String, String)> = self
            .relays
            .read()
            .iter()
            .map(|relay| (relay.name.clone(), relay.address.clone()))
            .collect();

        let attempts = targets.into_iter().map(|(name, address)| {
            let transport = self.transport.clone();
            async move {
                let outcome = dial(transport.as_ref(), &address).await;
                if let Err(err) = &outcome {
                    debug!("Failed to connect to circuit relay {}: {}", name, err);
                }
                (address, outcome.is_ok(), Utc::now())
            }
        });
        let outcomes = join_all(attempts).await;

        let mut sweep = RelaySweep {
            attempted: outcomes.len(),
            ..RelaySweep::default()
        };
        let mut relays = self.relays.write();
        for (address, connected, attempted_at) in outcomes {
            if connected {
                sweep.connected += 1;
            } else {
                sweep.failed += 1;
            }
            if let Some(record) = relays.iter_mut().find(|relay| relay.address == address) {
                record.connected = connected;
                record.last_attempt = Some(attempted_at);
            }
        }
        drop(relays);

        info!(
            attempted = sweep.attempted,
            connected = sweep.connected,
            failed = sweep.failed,
            "Circuit relay pass complete"
        );
        sweep
    }

    pub fn relays(&self) -> Vec<RelayRecord> {
        self.relays.read().clone()
    }

    pub fn len(&self) -> usize {
        self.relays.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.relays.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{NodeIdentity, PubsubMessage, TransportError};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct DialOnly {
        failing: HashSet<String>,
        dialed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Transport for DialOnly {
        async fn resolve_identity(&self) -> Result<NodeIdentity, TransportError> {
            Err(TransportError::Unavailable("not used".into()))
        }

        async fn dial(&self, address: &str) -> Result<(), TransportError> {
            self.dialed.lock().push(address.to_string());
            if self.failing.contains(address) {
                Err(TransportError::Dial("connection refused".into()))
            } else {
                Ok(())
            }
        }

        async fn subscribe(
            &self,
            _topic: &str,
        ) -> Result<mpsc::UnboundedReceiver<PubsubMessage>, TransportError> {
            Err(TransportError::Subscribe("not used".into()))
        }

        async fn unsubscribe(&self, _topic: &str) -> Result<(), TransportError> {
            Ok(())
        }

        async fn publish(&self, _topic: &str, _data: Vec<u8>) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[test]
    fn bootstrap_tables_match_node_type() {
        let browser = bootstrap_relays(NodeType::Browser);
        assert_eq!(browser.len(), 5);
        assert!(browser.iter().all(|r| r.address.contains("/tcp/443/wss")));

        let node = bootstrap_relays(NodeType::Node);
        assert_eq!(node.len(), 3);
        assert!(node.iter().all(|r| !r.address.contains("/wss")));
        assert!(node.iter().all(|r| !r.connected && r.last_attempt.is_none()));
    }

    #[tokio::test]
    async fn one_failing_relay_does_not_affect_the_others() {
        let relays = vec![
            RelayRecord::new("a", "/ip4/10.0.0.1/tcp/4001/p2p/QmA"),
            RelayRecord::new("b", "/ip4/10.0.0.2/tcp/4001/p2p/QmB"),
            RelayRecord::new("c", "/ip4/10.0.0.3/tcp/4001/p2p/QmC"),
        ];
        let transport = Arc::new(DialOnly {
            failing: HashSet::from(["/ip4/10.0.0.2/tcp/4001/p2p/QmB".to_string()]),
            ..DialOnly::default()
        });
        let manager = CircuitRelayManager::with_relays(relays, transport.clone());

        let sweep = manager.connect_all().await;

        assert_eq!(
            sweep,
            RelaySweep {
                attempted: 3,
                connected: 2,
                failed: 1
            }
        );
        assert_eq!(transport.dialed.lock().len(), 3);
        let state: Vec<(String, bool)> = manager
            .relays()
            .into_iter()
            .map(|r| (r.name, r.connected))
            .collect();
        assert_eq!(
            state,
            vec![
                ("a".to_string(), true),
                ("b".to_string(), false),
                ("c".to_string(), true)
            ]
        );
        assert!(manager.relays().iter().all(|r| r.last_attempt.is_some()));
    }

    #[tokio::test]
    async fn connected_flag_tracks_the_latest_attempt() {
        let address = "/ip4/10.0.0.9/tcp/4001/p2p/QmZ";
        let up = Arc::new(DialOnly::default());
        let manager =
            CircuitRelayManager::with_relays(vec![RelayRecord::new("z", address)], up);
        manager.connect_all().await;
        assert!(manager.relays()[0].connected);

        let down = Arc::new(DialOnly {
            failing: HashSet::from([address.to_string()]),
            ..DialOnly::default()
        });
        let manager = CircuitRelayManager::with_relays(manager.relays(), down);
        manager.connect_all().await;
        assert!(!manager.relays()[0].connected);
    }

    #[tokio::test]
    async fn failed_dials_name_their_address() {
        let address = "/ip4/10.0.0.7/tcp/4001/p2p/QmDown";
        let transport = DialOnly {
            failing: HashSet::from([address.to_string()]),
            ..DialOnly::default()
        };

        match dial(&transport, address).await {
            Err(CoordError::Dial { address: failed, reason }) => {
                assert_eq!(failed, address);
                assert!(reason.contains("connection refused"));
            }
            other => panic!("expected a dial error, got {other:?}"),
        }
        assert!(dial(&transport, "/ip4/10.0.0.8/tcp/4001/p2p/QmUp").await.is_ok());
    }

    #[test]
    fn add_relay_ignores_known_addresses() {
        let manager = CircuitRelayManager::new(NodeType::Node, Arc::new(DialOnly::default()));
        let before = manager.len();
        assert!(manager.add_relay("extra", "/ip4/10.1.1.1/tcp/4001/p2p/QmExtra"));
        assert!(!manager.add_relay("dup", "/ip4/10.1.1.1/tcp/4001/p2p/QmExtra"));
        assert_eq!(manager.len(), before + 1);
    }
}
