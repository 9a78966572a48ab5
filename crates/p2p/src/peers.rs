//! Registry of peers seen on the coordination channel.
//!
//! Peers are keyed by the sender id reported by the transport, not by the
//! id claimed inside the announcement. The latest announcement wins.

use crate::channels::{EnvelopeHandler, InboundEnvelope};
use crate::config::PeerEviction;
use crate::relay::{dial, CircuitRelayManager};
use crate::schema::{Announcement, NodeType};
use crate::transport::Transport;
use crate::CoordError;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What the registry knows about a remote peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub ipfs_id: String,
    pub node_type: NodeType,
    pub multiaddrs: Vec<String>,
    pub is_circuit_relay: bool,
    pub circuit_relays: Vec<Value>,
    pub crypto_addresses: Vec<Value>,
    pub encrypt_pub_key: String,
    pub first_seen: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PeerRecord {
    fn from_announcement(
        ipfs_id: &str,
        announcement: Announcement,
        first_seen: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            ipfs_id: ipfs_id.to_string(),
            node_type: announcement.node_type,
            multiaddrs: announcement.ipfs_multiaddrs,
            is_circuit_relay: announcement.is_circuit_relay,
            circuit_relays: announcement.circuit_relays,
            crypto_addresses: announcement.crypto_addresses,
            encrypt_pub_key: announcement.encrypt_pub_key,
            first_seen,
            updated_at,
        }
    }
}

/// Outcome of one reconnection pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshReport {
    pub peers: usize,
    pub relays: usize,
    pub attempted: usize,
    pub connected: usize,
    pub failed: usize,
    pub completed_at: DateTime<Utc>,
}

struct PeerEntry {
    record: PeerRecord,
    seq: u64,
    inbox_drain: Option<JoinHandle<()>>,
}

impl Drop for PeerEntry {
    fn drop(&mut self) {
        if let Some(task) = self.inbox_drain.take() {
            task.abort();
        }
    }
}

pub struct PeerRegistry {
    transport: Arc<dyn Transport>,
    relays: Arc<CircuitRelayManager>,
    eviction: PeerEviction,
    local_peer_id: RwLock<Option<String>>,
    peers: RwLock<HashMap<String, PeerEntry>>,
    sequence: AtomicU64,
}

impl PeerRegistry {
    pub fn new(
        transport: Arc<dyn Transport>,
        relays: Arc<CircuitRelayManager>,
        eviction: PeerEviction,
    ) -> Self {
        Self {
            transport,
            relays,
            eviction,
            local_peer_id: RwLock::new(None),
            peers: RwLock::new(HashMap::new()),
            sequence: AtomicU64::new(0),
        }
    }

    /// Announcements sent by this id are our own echoes and are ignored.
    pub fn set_local_peer_id(&self, peer_id: impl Into<String>) {
        *self.local_peer_id.write() = Some(peer_id.into());
    }

    /// Record an announcement from `from`. Returns `true` for a peer not seen before.
    pub async fn add_peer(&self, from: &str, announcement: Announcement) -> Result<bool, CoordError> {
        announcement.validate()?;
        if self.local_peer_id.read().as_deref() == Some(from) {
            return Ok(false);
        }

        let known = self.peers.read().contains_key(from);
        let inbox_drain = if known {
            None
        } else {
            self.subscribe_peer_channel(from).await
        };

        let now = Utc::now();
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let (is_new, len) = {
            let mut peers = self.peers.write();
            let is_new = match peers.get_mut(from) {
                Some(entry) => {
                    let first_seen = entry.record.first_seen;
                    entry.record =
                        PeerRecord::from_announcement(from, announcement, first_seen, now);
                    entry.seq = seq;
                    if entry.inbox_drain.is_none() {
                        entry.inbox_drain = inbox_drain;
                    } else if let Some(task) = inbox_drain {
                        // Lost a race with a concurrent first announcement.
                        task.abort();
                    }
                    false
                }
                None => {
                    peers.insert(
                        from.to_string(),
                        PeerEntry {
                            record: PeerRecord::from_announcement(from, announcement, now, now),
                            seq,
                            inbox_drain,
                        },
                    );
                    true
                }
            };
            (is_new, peers.len())
        };

        if is_new {
            info!(peer = %from, "Discovered new peer");
        } else {
            debug!(peer = %from, "Updated peer record");
        }
        if len > self.eviction.max_peers {
            self.evict_stale(now).await;
        }
        Ok(is_new)
    }

    /// Dial every known peer through every known relay.
    ///
    /// Individual failures are logged at debug level and counted; exactly one
    /// completion line is logged per pass.
    pub async fn refresh_peer_connections(&self) -> RefreshReport {
        let peer_ids: Vec<String> = self.peers.read().keys().cloned().collect();
        let relays = self.relays.relays();

        let attempts = peer_ids.iter().flat_map(|peer_id| {
            relays.iter().map(move |relay| {
                let address = format!("{}/p2p-circuit/p2p/{}", relay.address, peer_id);
                let transport = self.transport.clone();
                async move {
                    match dial(transport.as_ref(), &address).await {
                        Ok(()) => true,
                        Err(err) => {
                            debug!("Failed to reach peer {}: {}", peer_id, err);
                            false
                        }
                    }
                }
            })
        });
        let outcomes = join_all(attempts).await;
        let connected = outcomes.iter().filter(|ok| **ok).count();

        let completed_at = Utc::now();
        info!(
            "Renewed connections to all known peers at {}",
            completed_at.to_rfc3339_opts(SecondsFormat::Millis, true)
        );

        RefreshReport {
            peers: peer_ids.len(),
            relays: relays.len(),
            attempted: outcomes.len(),
            connected,
            failed: outcomes.len() - connected,
            completed_at,
        }
    }

    /// Apply the eviction policy as of `now` and leave the evicted peers'
    /// channels. Returns the number of peers removed.
    pub async fn evict_stale(&self, now: DateTime<Utc>) -> usize {
        let evicted = self.take_stale(now);
        for id in &evicted {
            if let Err(err) = self.transport.unsubscribe(id).await {
                warn!("Failed to leave channel of evicted peer {}: {}", id, err);
            }
        }
        evicted.len()
    }

    fn take_stale(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut peers = self.peers.write();
        let mut evicted = Vec::new();

        if let Some(ttl) = self.eviction.ttl {
            match chrono::Duration::from_std(ttl) {
                Ok(ttl) => {
                    let cutoff = now - ttl;
                    peers.retain(|id, entry| {
                        let fresh = entry.record.updated_at >= cutoff;
                        if !fresh {
                            evicted.push(id.clone());
                        }
                        fresh
                    });
                }
                Err(err) => warn!("Ignoring peer ttl {:?}: {}", ttl, err),
            }
        }

        if peers.len() > self.eviction.max_peers {
            let mut by_age: Vec<(DateTime<Utc>, u64, String)> = peers
                .iter()
                .map(|(id, entry)| (entry.record.updated_at, entry.seq, id.clone()))
                .collect();
            by_age.sort();
            let excess = peers.len() - self.eviction.max_peers;
            for (_, _, id) in by_age.into_iter().take(excess) {
                peers.remove(&id);
                evicted.push(id);
            }
        }

        if !evicted.is_empty() {
            info!(removed = evicted.len(), remaining = peers.len(), "Evicted stale peers");
        }
        evicted
    }

    pub fn get(&self, peer_id: &str) -> Option<PeerRecord> {
        self.peers.read().get(peer_id).map(|entry| entry.record.clone())
    }

    pub fn peers(&self) -> Vec<PeerRecord> {
        let mut peers: Vec<PeerRecord> = self
            .peers
            .read()
            .values()
            .map(|entry| entry.record.clone())
            .collect();
        peers.sort_by(|a, b| a.ipfs_id.cmp(&b.ipfs_id));
        peers
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Drop every peer and stop draining their channels.
    pub fn clear(&self) {
        self.peers.write().clear();
    }

    /// Join the peer's private channel so our publishes to it find a mesh.
    /// Inbound traffic on it is not ours to read and is discarded.
    async fn subscribe_peer_channel(&self, peer_id: &str) -> Option<JoinHandle<()>> {
        match self.transport.subscribe(peer_id).await {
            Ok(mut receiver) => Some(tokio::spawn(async move {
                while receiver.recv().await.is_some() {}
            })),
            Err(err) => {
                warn!("Failed to subscribe to channel of peer {}: {}", peer_id, err);
                None
            }
        }
    }
}

#[async_trait]
impl EnvelopeHandler for PeerRegistry {
    async fn handle(&self, inbound: InboundEnvelope) -> Result<(), CoordError> {
        let announcement = Announcement::from_value(inbound.envelope)?;
        self.add_peer(&inbound.from, announcement).await?;
        Ok(())
    }
}
