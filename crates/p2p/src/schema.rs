//! Versioned envelopes exchanged on the coordination and private channels.
//!
//! Every envelope carries the `apiName`/`apiVersion`/`apiInfo` header.
//! Fields this version does not know about are kept in `extensions` so that
//! newer peers can add fields without breaking older ones.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Protocol name carried by every envelope.
pub const API_NAME: &str = "ipfs-coord";
/// Envelope version produced by this crate.
pub const API_VERSION: &str = "1.2.5";
/// Documentation pointer carried in the header.
pub const API_INFO: &str = "ipfs-hash-to-go-here";

/// Kind of node announcing itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    /// Runs inside a browser; can only be reached through relays.
    Browser,
    #[default]
    Node,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Browser => "browser",
            NodeType::Node => "node",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodeType {
    type Err = SchemaError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "browser" => Ok(NodeType::Browser),
            "node" => Ok(NodeType::Node),
            other => Err(SchemaError::InvalidField {
                field: "type",
                reason: format!("unknown node type `{other}`"),
            }),
        }
    }
}

/// Errors raised while building or validating envelopes.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("identity not resolved: missing {0}")]
    MissingIdentity(&'static str),
    #[error("unexpected api name `{0}`")]
    ApiName(String),
    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Self-description broadcast on the coordination channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Announcement {
    pub api_name: String,
    pub api_version: String,
    #[serde(default)]
    pub api_info: String,
    pub ipfs_id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub ipfs_multiaddrs: Vec<String>,
    #[serde(default)]
    pub is_circuit_relay: bool,
    /// Reserved: preferred relays of the announcing node.
    #[serde(default)]
    pub circuit_relays: Vec<Value>,
    /// Reserved: blockchain addresses of the announcing node.
    #[serde(default)]
    pub crypto_addresses: Vec<Value>,
    #[serde(default)]
    pub encrypt_pub_key: String,
    #[serde(flatten)]
    pub extensions: Map<String, Value>,
}

impl Announcement {
    pub fn validate(&self) -> Result<(), SchemaError> {
        validate_header(&self.api_name, &self.api_version)?;
        if self.ipfs_id.trim().is_empty() {
            return Err(SchemaError::InvalidField {
                field: "ipfsId",
                reason: "empty".into(),
            });
        }
        Ok(())
    }

    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

/// Free-form text payload of a chat envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatData {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
}

/// Direct or broadcast chat envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub api_name: String,
    pub api_version: String,
    #[serde(default)]
    pub api_info: String,
    pub ipfs_id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub data: ChatData,
    #[serde(flatten)]
    pub extensions: Map<String, Value>,
}

impl ChatMessage {
    pub fn validate(&self) -> Result<(), SchemaError> {
        validate_header(&self.api_name, &self.api_version)
    }
}

/// Identity fields cached by the schema.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaIdentity {
    pub ipfs_id: String,
    pub node_type: NodeType,
    pub multiaddrs: Vec<String>,
    pub is_circuit_relay: bool,
    pub encrypt_pub_key: String,
}

/// Builds envelopes from the node's resolved identity.
#[derive(Debug, Clone)]
pub struct Schema {
    identity: SchemaIdentity,
}

impl Schema {
    pub fn new(identity: SchemaIdentity) -> Self {
        Self { identity }
    }

    pub fn identity(&self) -> &SchemaIdentity {
        &self.identity
    }

    /// Replace the advertised addresses.
    pub fn set_multiaddrs(&mut self, multiaddrs: Vec<String>) {
        self.identity.multiaddrs = multiaddrs;
    }

    pub fn announcement(&self) -> Result<Announcement, SchemaError> {
        self.require_identity()?;
        Ok(Announcement {
            api_name: API_NAME.to_string(),
            api_version: API_VERSION.to_string(),
            api_info: API_INFO.to_string(),
            ipfs_id: self.identity.ipfs_id.clone(),
            node_type: self.identity.node_type,
            ipfs_multiaddrs: self.identity.multiaddrs.clone(),
            is_circuit_relay: self.identity.is_circuit_relay,
            circuit_relays: Vec::new(),
            crypto_addresses: Vec::new(),
            encrypt_pub_key: self.identity.encrypt_pub_key.clone(),
            extensions: Map::new(),
        })
    }

    pub fn chat(&self, message: &str, handle: Option<&str>) -> Result<ChatMessage, SchemaError> {
        self.require_identity()?;
        Ok(ChatMessage {
            api_name: API_NAME.to_string(),
            api_version: API_VERSION.to_string(),
            api_info: API_INFO.to_string(),
            ipfs_id: self.identity.ipfs_id.clone(),
            node_type: self.identity.node_type,
            data: ChatData {
                message: message.to_string(),
                handle: handle.map(str::to_string),
            },
            extensions: Map::new(),
        })
    }

    fn require_identity(&self) -> Result<(), SchemaError> {
        if self.identity.ipfs_id.trim().is_empty() {
            return Err(SchemaError::MissingIdentity("ipfsId"));
        }
        Ok(())
    }
}

fn validate_header(api_name: &str, api_version: &str) -> Result<(), SchemaError> {
    if api_name != API_NAME {
        return Err(SchemaError::ApiName(api_name.to_string()));
    }
    if api_version.trim().is_empty() {
        return Err(SchemaError::InvalidField {
            field: "apiVersion",
            reason: "empty".into(),
        });
    }
    Ok(())
}
