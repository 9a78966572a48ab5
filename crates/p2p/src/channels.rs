//! Pubsub channel subscriptions and publishing.
//!
//! Every subscribed channel gets exactly one inbound task. Messages on a
//! channel are handled one after another in delivery order; different
//! channels are handled concurrently.

use crate::transport::{PubsubMessage, Transport};
use crate::CoordError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Decoded JSON delivery on a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEnvelope {
    /// Sender as reported by the transport.
    pub from: String,
    pub channel: String,
    pub envelope: Value,
}

#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    async fn handle(&self, inbound: InboundEnvelope) -> Result<(), CoordError>;
}

/// Handler for channels whose payload is not JSON, such as the encrypted inbox.
#[async_trait]
pub trait RawMessageHandler: Send + Sync {
    async fn handle(&self, message: PubsubMessage) -> Result<(), CoordError>;
}

enum Subscription {
    Pending,
    Active(JoinHandle<()>),
}

pub struct ChannelManager {
    transport: Arc<dyn Transport>,
    subscriptions: Mutex<HashMap<String, Subscription>>,
}

impl ChannelManager {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to a JSON channel. Returns `Ok(false)` when already subscribed.
    pub async fn subscribe(
        &self,
        channel: &str,
        handler: Arc<dyn EnvelopeHandler>,
    ) -> Result<bool, CoordError> {
        let Some(receiver) = self.open(channel).await? else {
            return Ok(false);
        };
        let name = channel.to_string();
        let task = tokio::spawn(async move {
            drain_envelopes(name, receiver, handler).await;
        });
        self.activate(channel, task);
        Ok(true)
    }

    /// Subscribe without decoding payloads. Returns `Ok(false)` when already subscribed.
    pub async fn subscribe_raw(
        &self,
        channel: &str,
        handler: Arc<dyn RawMessageHandler>,
    ) -> Result<bool, CoordError> {
        let Some(mut receiver) = self.open(channel).await? else {
            return Ok(false);
        };
        let name = channel.to_string();
        let task = tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                if let Err(err) = handler.handle(message).await {
                    warn!(channel = %name, error = %err, "Dropped message");
                }
            }
            debug!(channel = %name, "Channel closed");
        });
        self.activate(channel, task);
        Ok(true)
    }

    /// JSON-encode `payload` and publish it on `channel`.
    pub async fn publish<T>(&self, channel: &str, payload: &T) -> Result<(), CoordError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let bytes = serde_json::to_vec(payload)?;
        self.publish_bytes(channel, bytes).await
    }

    pub async fn publish_bytes(&self, channel: &str, bytes: Vec<u8>) -> Result<(), CoordError> {
        self.transport
            .publish(channel, bytes)
            .await
            .map_err(|err| CoordError::Publish {
                topic: channel.to_string(),
                reason: err.to_string(),
            })
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.subscriptions.lock().contains_key(channel)
    }

    pub fn subscribed_channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.subscriptions.lock().keys().cloned().collect();
        channels.sort();
        channels
    }

    /// Abort every channel task.
    pub fn shutdown(&self) {
        for (channel, subscription) in self.subscriptions.lock().drain() {
            if let Subscription::Active(task) = subscription {
                task.abort();
                debug!(channel = %channel, "Unsubscribed");
            }
        }
    }

    /// Reserve `channel` and subscribe through the transport. `None` means
    /// another caller already owns the subscription.
    async fn open(
        &self,
        channel: &str,
    ) -> Result<Option<mpsc::UnboundedReceiver<PubsubMessage>>, CoordError> {
        {
            let mut subscriptions = self.subscriptions.lock();
            if subscriptions.contains_key(channel) {
                return Ok(None);
            }
            subscriptions.insert(channel.to_string(), Subscription::Pending);
        }

        match self.transport.subscribe(channel).await {
            Ok(receiver) => Ok(Some(receiver)),
            Err(err) => {
                self.subscriptions.lock().remove(channel);
                Err(CoordError::Subscribe {
                    topic: channel.to_string(),
                    reason: err.to_string(),
                })
            }
        }
    }

    fn activate(&self, channel: &str, task: JoinHandle<()>) {
        let mut subscriptions = self.subscriptions.lock();
        match subscriptions.get_mut(channel) {
            Some(slot) => *slot = Subscription::Active(task),
            // Shut down while the transport subscription was in flight.
            None => task.abort(),
        }
    }
}

impl Drop for ChannelManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn drain_envelopes(
    channel: String,
    mut receiver: mpsc::UnboundedReceiver<PubsubMessage>,
    handler: Arc<dyn EnvelopeHandler>,
) {
    while let Some(message) = receiver.recv().await {
        let envelope = match decode_envelope(&message.data) {
            Ok(envelope) => envelope,
            Err(err) => {
                debug!("Failed to parse message on {} from {}: {}", channel, message.from, err);
                continue;
            }
        };
        let inbound = InboundEnvelope {
            from: message.from,
            channel: channel.clone(),
            envelope,
        };
        if let Err(err) = handler.handle(inbound).await {
            warn!(channel = %channel, error = %err, "Dropped envelope");
        }
    }
    debug!(channel = %channel, "Channel closed");
}

/// Parse a JSON payload. Legacy publishers serialize the envelope twice, so a
/// top-level JSON string is decoded once more.
pub fn decode_envelope(data: &[u8]) -> Result<Value, CoordError> {
    match serde_json::from_slice::<Value>(data)? {
        Value::String(inner) => Ok(serde_json::from_str(&inner)?),
        value => Ok(value),
    }
}
