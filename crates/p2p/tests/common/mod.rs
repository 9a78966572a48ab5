#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use peercoord_p2p::{
    Cipher, CipherError, CoordOptions, IdentityProvider, KeyMaterial, NodeIdentity,
    PubsubMessage, Transport, TransportError,
};
use tokio::sync::{mpsc, watch};

/// In-memory pubsub fabric shared by every [`MockTransport`] attached to it.
#[derive(Default)]
pub struct MockHub {
    topics: Mutex<HashMap<String, Vec<(String, mpsc::UnboundedSender<PubsubMessage>)>>>,
}

impl MockHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Deliver `data` on `topic` as if `from` had published it.
    pub fn deliver(&self, topic: &str, from: &str, data: &[u8]) {
        let mut topics = self.topics.lock();
        if let Some(subscribers) = topics.get_mut(topic) {
            subscribers.retain(|(owner, sender)| {
                if owner == from {
                    return true;
                }
                sender
                    .send(PubsubMessage {
                        from: from.to_string(),
                        topic: topic.to_string(),
                        data: data.to_vec(),
                    })
                    .is_ok()
            });
        }
    }

    /// Drop every receiver `owner` holds on `topic`.
    fn detach(&self, topic: &str, owner: &str) {
        if let Some(subscribers) = self.topics.lock().get_mut(topic) {
            subscribers.retain(|(holder, _)| holder != owner);
        }
    }

    fn attach(&self, topic: &str, owner: &str) -> mpsc::UnboundedReceiver<PubsubMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.topics
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push((owner.to_string(), tx));
        rx
    }
}

pub struct MockTransport {
    pub peer_id: String,
    hub: Arc<MockHub>,
    identity_released: watch::Receiver<bool>,
    release: watch::Sender<bool>,
    failing_dials: Mutex<HashSet<String>>,
    fail_all_dials: Mutex<bool>,
    reject_publish: Mutex<bool>,
    extra_addrs: Mutex<Vec<String>>,
    pub dials: Mutex<Vec<String>>,
    pub subscriptions: Mutex<Vec<String>>,
    pub unsubscriptions: Mutex<Vec<String>>,
    pub published: Mutex<Vec<(String, Vec<u8>)>>,
}

impl MockTransport {
    pub fn new(peer_id: &str, hub: Arc<MockHub>) -> Arc<Self> {
        Self::build(peer_id, hub, true)
    }

    /// Identity resolution blocks until [`MockTransport::release_identity`] is called.
    pub fn gated(peer_id: &str, hub: Arc<MockHub>) -> Arc<Self> {
        Self::build(peer_id, hub, false)
    }

    fn build(peer_id: &str, hub: Arc<MockHub>, released: bool) -> Arc<Self> {
        let (release, identity_released) = watch::channel(released);
        Arc::new(Self {
            peer_id: peer_id.to_string(),
            hub,
            identity_released,
            release,
            failing_dials: Mutex::new(HashSet::new()),
            fail_all_dials: Mutex::new(false),
            reject_publish: Mutex::new(false),
            extra_addrs: Mutex::new(Vec::new()),
            dials: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            unsubscriptions: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
        })
    }

    pub fn release_identity(&self) {
        let _ = self.release.send(true);
    }

    /// Report an extra listen address, such as a relay circuit, from now on.
    pub fn add_listen_address(&self, address: &str) {
        self.extra_addrs.lock().push(address.to_string());
    }

    pub fn fail_dial(&self, address: &str) {
        self.failing_dials.lock().insert(address.to_string());
    }

    pub fn fail_all_dials(&self) {
        *self.fail_all_dials.lock() = true;
    }

    pub fn reject_publishes(&self) {
        *self.reject_publish.lock() = true;
    }

    pub fn dial_count(&self) -> usize {
        self.dials.lock().len()
    }

    pub fn published_on(&self, topic: &str) -> Vec<Vec<u8>> {
        self.published
            .lock()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, data)| data.clone())
            .collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn resolve_identity(&self) -> Result<NodeIdentity, TransportError> {
        let mut released = self.identity_released.clone();
        released
            .wait_for(|ready| *ready)
            .await
            .map_err(|_| TransportError::Identity("mock dropped".into()))?;
        let mut multiaddrs = vec![format!("/ip4/127.0.0.1/tcp/4001/p2p/{}", self.peer_id)];
        multiaddrs.extend(self.extra_addrs.lock().iter().cloned());
        Ok(NodeIdentity {
            peer_id: self.peer_id.clone(),
            multiaddrs,
        })
    }

    async fn dial(&self, address: &str) -> Result<(), TransportError> {
        self.dials.lock().push(address.to_string());
        let failing = *self.fail_all_dials.lock() || self.failing_dials.lock().contains(address);
        if failing {
            Err(TransportError::Dial(format!("{address} unreachable")))
        } else {
            Ok(())
        }
    }

    async fn subscribe(
        &self,
        topic: &str,
    ) -> Result<mpsc::UnboundedReceiver<PubsubMessage>, TransportError> {
        self.subscriptions.lock().push(topic.to_string());
        Ok(self.hub.attach(topic, &self.peer_id))
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.unsubscriptions.lock().push(topic.to_string());
        self.hub.detach(topic, &self.peer_id);
        Ok(())
    }

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), TransportError> {
        self.published.lock().push((topic.to_string(), data.clone()));
        if *self.reject_publish.lock() {
            return Err(TransportError::Publish("no peers subscribed".into()));
        }
        self.hub.deliver(topic, &self.peer_id, &data);
        Ok(())
    }
}

/// Key material where the public and private key are the same string.
pub struct MockIdentity {
    pub key: String,
}

#[async_trait]
impl IdentityProvider for MockIdentity {
    async fn derive_address_and_key(&self) -> Result<KeyMaterial, CipherError> {
        Ok(KeyMaterial {
            address: format!("addr-{}", self.key),
            public_key: self.key.clone(),
        })
    }

    async fn private_key(&self) -> Result<String, CipherError> {
        Ok(self.key.clone())
    }
}

/// Symmetric XOR cipher keyed by the key string.
pub struct XorCipher;

impl XorCipher {
    fn apply(key: &str, data: &[u8]) -> Result<Vec<u8>, CipherError> {
        if key.is_empty() {
            return Err(CipherError("empty key".into()));
        }
        let key = key.as_bytes();
        Ok(data
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ key[i % key.len()])
            .collect())
    }
}

impl Cipher for XorCipher {
    fn encrypt(&self, public_key: &str, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        Self::apply(public_key, plaintext)
    }

    fn decrypt(&self, private_key: &str, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
        Self::apply(private_key, ciphertext)
    }
}

pub fn options(transport: Arc<MockTransport>, key: &str) -> CoordOptions {
    CoordOptions::new(
        transport,
        Arc::new(MockIdentity {
            key: key.to_string(),
        }),
        Arc::new(XorCipher),
    )
}

/// Poll `check` every 10ms until it holds or `limit` elapses.
pub async fn eventually<F>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn within<T>(limit: Duration, fut: impl Future<Output = T>) -> Option<T> {
    tokio::time::timeout(limit, fut).await.ok()
}
