//! Outbound message types

use onion_client::{OpenGroupMessage, OpenGroupRoom};
use onion_core::PubKey;
use serde::{Deserialize, Serialize};

/// Content of a message, independent of where it is sent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub identifier: String,
    #[serde(with = "onion_client::encoding::base64_bytes")]
    pub payload: Vec<u8>,
    pub ttl_ms: u64,
    pub namespace: i32,
}

impl OutgoingMessage {
    pub fn new(identifier: impl Into<String>, payload: Vec<u8>, ttl_ms: u64) -> Self {
        Self {
            identifier: identifier.into(),
            payload,
            ttl_ms,
            namespace: 0,
        }
    }
}

/// A message addressed to a single device, as kept in the pending cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMessage {
    pub identifier: String,
    pub destination: PubKey,
    #[serde(with = "onion_client::encoding::base64_bytes")]
    pub payload: Vec<u8>,
    pub ttl_ms: u64,
    pub namespace: i32,
    /// Closed group the message belongs to, when fanned out from one
    #[serde(default)]
    pub group: Option<PubKey>,
}

impl RawMessage {
    pub fn new(destination: PubKey, message: &OutgoingMessage, group: Option<PubKey>) -> Self {
        Self {
            identifier: message.identifier.clone(),
            destination,
            payload: message.payload.clone(),
            ttl_ms: message.ttl_ms,
            namespace: message.namespace,
            group,
        }
    }

    /// Same message for the same device
    pub fn same_as(&self, other: &RawMessage) -> bool {
        self.identifier == other.identifier && self.destination == other.destination
    }
}

/// A message together with how it is addressed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    Direct {
        destination: PubKey,
        message: OutgoingMessage,
    },
    ClosedGroup {
        group: PubKey,
        message: OutgoingMessage,
    },
    OpenGroup {
        room: OpenGroupRoom,
        message: OpenGroupMessage,
    },
}

impl OutboundMessage {
    pub fn identifier(&self) -> &str {
        match self {
            OutboundMessage::Direct { message, .. } | OutboundMessage::ClosedGroup { message, .. } => {
                &message.identifier
            }
            OutboundMessage::OpenGroup { message, .. } => &message.identifier,
        }
    }
}
