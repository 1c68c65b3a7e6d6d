use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::clock::VectorClock;
use super::ids::{NodeId, PeerId};
use crate::error::SyncError;

/// Free-form node fields (shallow JSON object)
pub type NodeData = Map<String, Value>;

/// Canvas coordinate of a node
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Operation kind enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
    Move,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::Move => "move",
        }
    }
}

/// Operation payload, one variant per kind carrying only what it needs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OperationPayload {
    Create {
        data: NodeData,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        position: Option<Position>,
    },
    Update {
        fields: NodeData,
    },
    Delete,
    Move {
        position: Position,
    },
}

impl OperationPayload {
    pub fn kind(&self) -> OperationKind {
        match self {
            OperationPayload::Create { .. } => OperationKind::Create,
            OperationPayload::Update { .. } => OperationKind::Update,
            OperationPayload::Delete => OperationKind::Delete,
            OperationPayload::Move { .. } => OperationKind::Move,
        }
    }

    /// Data fields written by this payload, if any
    pub fn fields(&self) -> Option<&NodeData> {
        match self {
            OperationPayload::Create { data, .. } => Some(data),
            OperationPayload::Update { fields } => Some(fields),
            OperationPayload::Delete | OperationPayload::Move { .. } => None,
        }
    }
}

/// Version tuple for LWW comparison: (timestamp, peer, sequence)
///
/// Field order matters: the derived `Ord` is the tie-break order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Version {
    pub ts: u64,
    pub peer: PeerId,
    pub sequence: u64,
}

impl Version {
    pub fn new(ts: u64, peer: PeerId, sequence: u64) -> Self {
        Self { ts, peer, sequence }
    }

    pub fn is_newer_than(&self, other: &Version) -> bool {
        self > other
    }
}

/// Identity of an operation for duplicate suppression
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OperationKey {
    pub origin: PeerId,
    pub sequence: u64,
}

/// An edit to one canvas node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub node_id: NodeId,
    pub payload: OperationPayload,
    /// Peer that created the operation
    pub origin: PeerId,
    /// Wall clock in ms; only used for tie-breaks
    pub timestamp: u64,
    /// Per-origin monotonic counter
    pub sequence: u64,
    /// Clock snapshot at creation
    pub vector_clock: VectorClock,
}

impl Operation {
    pub fn new(
        node_id: NodeId,
        payload: OperationPayload,
        origin: PeerId,
        timestamp: u64,
        sequence: u64,
        vector_clock: VectorClock,
    ) -> Self {
        Self {
            node_id,
            payload,
            origin,
            timestamp,
            sequence,
            vector_clock,
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.payload.kind()
    }

    pub fn version(&self) -> Version {
        Version::new(self.timestamp, self.origin.clone(), self.sequence)
    }

    pub fn key(&self) -> OperationKey {
        OperationKey {
            origin: self.origin.clone(),
            sequence: self.sequence,
        }
    }

    /// Reject operations that no state transition can accept
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.node_id.is_empty() {
            return Err(SyncError::InvalidOperation(
                "operation has no node id".to_string(),
            ));
        }
        if self.origin.is_empty() {
            return Err(SyncError::InvalidOperation(format!(
                "operation on node '{}' has no origin peer",
                self.node_id
            )));
        }
        Ok(())
    }

    /// Copy with a different payload
    pub fn with_payload(&self, payload: OperationPayload) -> Self {
        Self {
            payload,
            ..self.clone()
        }
    }

    /// Copy that applies under another operation's version
    pub fn restamped(mut self, version: &Version) -> Self {
        self.timestamp = version.ts;
        self.origin = version.peer.clone();
        self.sequence = version.sequence;
        self
    }
}
