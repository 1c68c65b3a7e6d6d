//! Wire frames exchanged between peers
//!
//! Every frame is one JSON object: `{type, data, peerId, timestamp,
//! vectorClock?}`. `data` stays untyped until routed, then decodes into the
//! payload named by `type`.

use libweave_core::automaton::{CausalMessage, CausalStamp};
use libweave_core::{Operation, PeerId, PresenceEntry, StateSnapshot, VectorClock};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PeerError;

/// Declared frame type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    NodeUpdate,
    PresenceUpdate,
    FullStateSync,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::NodeUpdate => "node-update",
            MessageType::PresenceUpdate => "presence-update",
            MessageType::FullStateSync => "full-state-sync",
        }
    }

    /// Whether frames of this type take part in causal ordering
    pub fn is_causal(&self) -> bool {
        !matches!(self, MessageType::PresenceUpdate)
    }
}

/// Decoded frame data
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    NodeUpdate(Operation),
    PresenceUpdate(PresenceEntry),
    FullStateSync(StateSnapshot),
}

/// Wire frame envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMessage {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub data: Value,
    /// Sender, set when the frame is stamped
    pub peer_id: PeerId,
    /// Sender wall clock (ms), set when the frame is stamped
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector_clock: Option<VectorClock>,
}

impl SyncMessage {
    fn new(message_type: MessageType, data: Value) -> Self {
        Self {
            message_type,
            data,
            peer_id: PeerId::new(String::new()),
            timestamp: 0,
            vector_clock: None,
        }
    }

    pub fn node_update(op: &Operation) -> Result<Self, PeerError> {
        Ok(Self::new(MessageType::NodeUpdate, serde_json::to_value(op)?))
    }

    pub fn presence_update(entry: &PresenceEntry) -> Result<Self, PeerError> {
        Ok(Self::new(
            MessageType::PresenceUpdate,
            serde_json::to_value(entry)?,
        ))
    }

    /// Node map plus the tombstones that keep deleted nodes deleted
    pub fn full_state_sync(snapshot: &StateSnapshot) -> Result<Self, PeerError> {
        Ok(Self::new(
            MessageType::FullStateSync,
            serde_json::to_value(snapshot)?,
        ))
    }

    /// Sender and time only, for frames outside the causal system
    pub fn stamp_plain(&mut self, peer_id: PeerId, timestamp: u64) {
        self.peer_id = peer_id;
        self.timestamp = timestamp;
        self.vector_clock = None;
    }

    pub fn encode(&self) -> Result<String, PeerError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(frame: &str) -> Result<Self, PeerError> {
        Ok(serde_json::from_str(frame)?)
    }

    /// Decode `data` according to `type`
    pub fn payload(&self) -> Result<Payload, PeerError> {
        let malformed = |e: serde_json::Error| {
            PeerError::Malformed(format!("{} data: {}", self.message_type.as_str(), e))
        };
        let data = self.data.clone();
        Ok(match self.message_type {
            MessageType::NodeUpdate => {
                Payload::NodeUpdate(serde_json::from_value(data).map_err(malformed)?)
            }
            MessageType::PresenceUpdate => {
                Payload::PresenceUpdate(serde_json::from_value(data).map_err(malformed)?)
            }
            MessageType::FullStateSync => {
                Payload::FullStateSync(serde_json::from_value(data).map_err(malformed)?)
            }
        })
    }
}

impl CausalMessage for SyncMessage {
    fn vector_clock(&self) -> Option<&VectorClock> {
        self.vector_clock.as_ref()
    }

    fn stamp(&mut self, stamp: CausalStamp) {
        self.peer_id = stamp.peer_id;
        self.timestamp = stamp.timestamp;
        self.vector_clock = Some(stamp.vector_clock);
    }
}
