//! End-to-end encryption of direct messages.
//!
//! Inbound payloads on the node's private channel are raw ciphertext. After
//! decryption the plaintext is appended to the message log (when one is
//! configured) and forwarded to the inbox.

use crate::channels::RawMessageHandler;
use crate::peers::PeerRecord;
use crate::schema::ChatMessage;
use crate::transport::{Cipher, IdentityProvider, MessageLog, PubsubMessage, Transport};
use crate::CoordError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// A decrypted message received on our private channel.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectMessage {
    pub from: String,
    pub plaintext: String,
    /// Parsed envelope when the plaintext is a chat message.
    pub chat: Option<ChatMessage>,
    pub received_at: DateTime<Utc>,
}

pub struct EncryptionGateway {
    peer_id: String,
    identity: Arc<dyn IdentityProvider>,
    cipher: Arc<dyn Cipher>,
    transport: Arc<dyn Transport>,
    message_log: Option<Arc<dyn MessageLog>>,
    inbox: Option<mpsc::UnboundedSender<DirectMessage>>,
}

impl EncryptionGateway {
    pub fn new(
        peer_id: impl Into<String>,
        identity: Arc<dyn IdentityProvider>,
        cipher: Arc<dyn Cipher>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            identity,
            cipher,
            transport,
            message_log: None,
            inbox: None,
        }
    }

    pub fn with_message_log(mut self, log: Arc<dyn MessageLog>) -> Self {
        self.message_log = Some(log);
        self
    }

    pub fn with_inbox(mut self, inbox: mpsc::UnboundedSender<DirectMessage>) -> Self {
        self.inbox = Some(inbox);
        self
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub async fn decrypt(&self, message: &PubsubMessage) -> Result<DirectMessage, CoordError> {
        let private_key = self
            .identity
            .private_key()
            .await
            .map_err(|err| CoordError::Decryption(format!("private key unavailable: {err}")))?;
        let plaintext = self
            .cipher
            .decrypt(&private_key, &message.data)
            .map_err(|err| CoordError::Decryption(err.to_string()))?;
        let plaintext = String::from_utf8(plaintext)
            .map_err(|err| CoordError::Decryption(format!("plaintext is not utf-8: {err}")))?;

        if let Some(log) = &self.message_log {
            if let Err(err) = log.append(plaintext.as_bytes()) {
                warn!("Failed to persist message from {}: {}", message.from, err);
            }
        }

        let chat = serde_json::from_str::<ChatMessage>(&plaintext).ok();
        let direct = DirectMessage {
            from: message.from.clone(),
            plaintext,
            chat,
            received_at: Utc::now(),
        };
        info!(peer = %direct.from, "Received encrypted message");

        if let Some(inbox) = &self.inbox {
            if inbox.send(direct.clone()).is_err() {
                debug!("Inbox closed, dropping message from {}", direct.from);
            }
        }
        Ok(direct)
    }

    /// Encrypt `plaintext` to `peer` and publish it on the peer's channel.
    pub async fn send_encrypted(&self, peer: &PeerRecord, plaintext: &[u8]) -> Result<(), CoordError> {
        if peer.encrypt_pub_key.is_empty() {
            return Err(CoordError::Encryption(format!(
                "peer {} has not announced an encryption key",
                peer.ipfs_id
            )));
        }
        let ciphertext = self
            .cipher
            .encrypt(&peer.encrypt_pub_key, plaintext)
            .map_err(|err| CoordError::Encryption(err.to_string()))?;

        self.transport
            .publish(&peer.ipfs_id, ciphertext)
            .await
            .map_err(|err| CoordError::Publish {
                topic: peer.ipfs_id.clone(),
                reason: err.to_string(),
            })?;
        debug!(peer = %peer.ipfs_id, "Sent encrypted message");
        Ok(())
    }
}

#[async_trait]
impl RawMessageHandler for EncryptionGateway {
    async fn handle(&self, message: PubsubMessage) -> Result<(), CoordError> {
        self.decrypt(&message).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message_log::MemoryMessageLog;
    use crate::schema::NodeType;
    use crate::transport::{CipherError, KeyMaterial, NodeIdentity, TransportError};
    use parking_lot::Mutex;

    /// XOR with the key's first byte; enough to exercise the plumbing.
    struct XorCipher;

    impl Cipher for XorCipher {
        fn encrypt(&self, public_key: &str, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
            let k = public_key.bytes().next().ok_or_else(|| CipherError("empty key".into()))?;
            Ok(plaintext.iter().map(|b| b ^ k).collect())
        }

        fn decrypt(&self, private_key: &str, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
            if private_key != "secret" {
                return Err(CipherError("wrong key".into()));
            }
            self.encrypt("k", ciphertext)
        }
    }

    struct FixedIdentity;

    #[async_trait]
    impl IdentityProvider for FixedIdentity {
        async fn derive_address_and_key(&self) -> Result<KeyMaterial, CipherError> {
            Ok(KeyMaterial {
                address: "addr".into(),
                public_key: "k".into(),
            })
        }

        async fn private_key(&self) -> Result<String, CipherError> {
            Ok("secret".into())
        }
    }

    #[derive(Default)]
    struct Outbox(Mutex<Vec<(String, Vec<u8>)>>);

    #[async_trait]
    impl Transport for Outbox {
        async fn resolve_identity(&self) -> Result<NodeIdentity, TransportError> {
            Err(TransportError::Unavailable("not used".into()))
        }

        async fn dial(&self, _address: &str) -> Result<(), TransportError> {
            Ok(())
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

        async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), TransportError> {
            self.0.lock().push((topic.to_string(), data));
            Ok(())
        }
    }

    fn peer(key: &str) -> PeerRecord {
        let now = Utc::now();
        PeerRecord {
            ipfs_id: "QmPeer".into(),
            node_type: NodeType::Node,
            multiaddrs: vec![],
            is_circuit_relay: false,
            circuit_relays: vec![],
            crypto_addresses: vec![],
            encrypt_pub_key: key.into(),
            first_seen: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn encrypted_message_reaches_the_peer_channel_and_decrypts() {
        let outbox = Arc::new(Outbox::default());
        let log = Arc::new(MemoryMessageLog::new());
        let (tx, mut inbox) = mpsc::unbounded_channel();
        let gateway = EncryptionGateway::new("QmMe", Arc::new(FixedIdentity), Arc::new(XorCipher), outbox.clone())
            .with_message_log(log.clone())
            .with_inbox(tx);

        gateway.send_encrypted(&peer("k"), b"hello peer").await.unwrap();
        let (topic, ciphertext) = outbox.0.lock().pop().expect("published");
        assert_eq!(topic, "QmPeer");
        assert_ne!(ciphertext, b"hello peer".to_vec());

        let message = PubsubMessage {
            from: "QmPeer".into(),
            topic: "QmMe".into(),
            data: ciphertext,
        };
        let direct = gateway.decrypt(&message).await.unwrap();
        assert_eq!(direct.plaintext, "hello peer");
        assert!(direct.chat.is_none());
        assert_eq!(inbox.try_recv().unwrap().from, "QmPeer");
        assert_eq!(log.load().unwrap(), vec![b"hello peer".to_vec()]);
    }

    #[tokio::test]
    async fn missing_key_is_an_encryption_error() {
        let gateway = EncryptionGateway::new(
            "QmMe",
            Arc::new(FixedIdentity),
            Arc::new(XorCipher),
            Arc::new(Outbox::default()),
        );
        assert!(matches!(
            gateway.send_encrypted(&peer(""), b"x").await,
            Err(CoordError::Encryption(_))
        ));
    }

    #[tokio::test]
    async fn chat_envelopes_are_parsed() {
        let gateway = EncryptionGateway::new(
            "QmMe",
            Arc::new(FixedIdentity),
            Arc::new(XorCipher),
            Arc::new(Outbox::default()),
        );
        let chat = crate::schema::Schema::new(crate::schema::SchemaIdentity {
            ipfs_id: "QmPeer".into(),
            ..Default::default()
        })
        .chat("hi", Some("bob"))
        .unwrap();
        let plaintext = serde_json::to_vec(&chat).unwrap();
        let data = XorCipher.encrypt("k", &plaintext).unwrap();

        let direct = gateway
            .decrypt(&PubsubMessage {
                from: "QmPeer".into(),
                topic: "QmMe".into(),
                data,
            })
            .await
            .unwrap();
        assert_eq!(direct.chat.unwrap().data.handle.as_deref(), Some("bob"));
    }
}
