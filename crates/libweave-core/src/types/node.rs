use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::clock::VectorClock;
use super::ids::NodeId;
use super::operation::{NodeData, Position, Version};

/// Materialized state of one canvas node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    pub data: NodeData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    /// Newest version that touched this node
    pub last_modified: Version,
}

impl NodeRecord {
    pub fn new(data: NodeData, position: Option<Position>, last_modified: Version) -> Self {
        Self {
            data,
            position,
            last_modified,
        }
    }

    /// Raise `last_modified` to `version` if it is newer
    pub fn touch(&mut self, version: Version) {
        if version.is_newer_than(&self.last_modified) {
            self.last_modified = version;
        }
    }
}

/// Node map owned by one peer; BTreeMap keeps snapshots deterministic
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeState {
    nodes: BTreeMap<NodeId, NodeRecord>,
}

impl NodeState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, node_id: &NodeId) -> Option<&NodeRecord> {
        self.nodes.get(node_id)
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.nodes.contains_key(node_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &NodeRecord)> {
        self.nodes.iter()
    }

    pub(crate) fn insert(&mut self, node_id: NodeId, record: NodeRecord) {
        self.nodes.insert(node_id, record);
    }

    pub(crate) fn get_mut(&mut self, node_id: &NodeId) -> Option<&mut NodeRecord> {
        self.nodes.get_mut(node_id)
    }

    pub(crate) fn remove(&mut self, node_id: &NodeId) -> Option<NodeRecord> {
        self.nodes.remove(node_id)
    }

    /// Adopt nodes from a peer snapshot that are missing here or newer there,
    /// skipping those `refuse` rejects. Returns the ids that changed.
    pub fn adopt_snapshot<F>(&mut self, snapshot: &NodeState, refuse: F) -> Vec<NodeId>
    where
        F: Fn(&NodeId, &NodeRecord) -> bool,
    {
        let mut changed = Vec::new();
        for (node_id, incoming) in &snapshot.nodes {
            if refuse(node_id, incoming) {
                continue;
            }
            let adopt = match self.nodes.get(node_id) {
                None => true,
                Some(local) => incoming.last_modified.is_newer_than(&local.last_modified),
            };
            if adopt {
                self.nodes.insert(node_id.clone(), incoming.clone());
                changed.push(node_id.clone());
            }
        }
        changed
    }
}

/// Marker left by a delete: the newest delete version and its clock
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tombstone {
    pub version: Version,
    pub vector_clock: VectorClock,
}

impl Tombstone {
    /// Whether a replica at `clock` has already integrated this delete
    pub fn seen_by(&self, clock: &VectorClock) -> bool {
        self.vector_clock
            .entries()
            .iter()
            .all(|(peer, &tick)| tick <= clock.get(peer))
    }

    /// Whether a Create stamped `version` at `clock` brings the node back:
    /// it either follows the delete or beats it as a concurrent write
    pub fn revived_by(&self, version: &Version, clock: &VectorClock) -> bool {
        self.vector_clock.happens_before(clock)
            || (!clock.happens_before(&self.vector_clock) && version.is_newer_than(&self.version))
    }
}

/// Payload of a `full-state-sync` frame
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub nodes: NodeState,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tombstones: BTreeMap<NodeId, Tombstone>,
}
