//! Ephemeral presence (cursor, selection) outside the causal system.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::hash::blake2b_256;
use crate::types::ids::{NodeId, PeerId};
use crate::types::operation::Position;

pub const DEFAULT_PRESENCE_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_BROADCAST_INTERVAL_MS: u64 = 1_000;

/// Peer colors, indexed by a hash of the peer id
pub const PALETTE: [&str; 8] = [
    "#e6194b", "#3cb44b", "#4363d8", "#f58231", "#911eb4", "#42d4f4", "#f032e6", "#9a6324",
];

/// Deterministic color for a peer
pub fn peer_color(peer_id: &PeerId) -> String {
    let digest = blake2b_256(peer_id.as_str().as_bytes());
    PALETTE[digest[0] as usize % PALETTE.len()].to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub peer_id: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Position>,
    #[serde(default)]
    pub selection: Vec<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_editor: Option<String>,
    pub color: String,
    /// Local receive time (ms) for remote entries, set time for the local one
    pub last_update: u64,
}

impl PresenceEntry {
    pub fn new(peer_id: PeerId, now_ms: u64) -> Self {
        let color = peer_color(&peer_id);
        Self {
            peer_id,
            cursor: None,
            selection: Vec::new(),
            active_editor: None,
            color,
            last_update: now_ms,
        }
    }

    pub fn is_stale(&self, now_ms: u64, timeout_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_update) > timeout_ms
    }
}

/// Local presence plus the last entry heard from each remote peer
#[derive(Debug, Clone)]
pub struct PresenceTracker {
    local: PresenceEntry,
    remote: BTreeMap<PeerId, PresenceEntry>,
    timeout_ms: u64,
}

impl PresenceTracker {
    pub fn new(peer_id: PeerId, timeout_ms: u64) -> Self {
        Self {
            local: PresenceEntry::new(peer_id, 0),
            remote: BTreeMap::new(),
            timeout_ms,
        }
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    pub fn local(&self) -> &PresenceEntry {
        &self.local
    }

    pub fn set_local(
        &mut self,
        cursor: Option<Position>,
        selection: Vec<NodeId>,
        active_editor: Option<String>,
        now_ms: u64,
    ) -> &PresenceEntry {
        self.local.cursor = cursor;
        self.local.selection = selection;
        self.local.active_editor = active_editor;
        self.local.last_update = now_ms;
        &self.local
    }

    /// Store a remote entry. Returns false for our own echoed entry.
    pub fn apply_remote(&mut self, mut entry: PresenceEntry, now_ms: u64) -> bool {
        if entry.peer_id == self.local.peer_id {
            return false;
        }
        // Sender clocks are not trusted for staleness
        entry.last_update = now_ms;
        self.remote.insert(entry.peer_id.clone(), entry);
        true
    }

    pub fn remove(&mut self, peer_id: &PeerId) -> Option<PresenceEntry> {
        self.remote.remove(peer_id)
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&PresenceEntry> {
        self.remote.get(peer_id)
    }

    /// Evict remote entries older than the timeout
    pub fn sweep(&mut self, now_ms: u64) -> Vec<PeerId> {
        let timeout_ms = self.timeout_ms;
        let evicted: Vec<PeerId> = self
            .remote
            .values()
            .filter(|entry| entry.is_stale(now_ms, timeout_ms))
            .map(|entry| entry.peer_id.clone())
            .collect();
        for peer_id in &evicted {
            self.remote.remove(peer_id);
            debug!(peer = %peer_id, "presence expired");
        }
        evicted
    }

    /// Remote presences currently held
    pub fn get_all_presences(&self) -> Vec<&PresenceEntry> {
        self.remote.values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(peer: &str, sent_at: u64) -> PresenceEntry {
        let mut entry = PresenceEntry::new(PeerId::from(peer), sent_at);
        entry.cursor = Some(Position::new(1.0, 2.0));
        entry
    }

    #[test]
    fn test_color_is_deterministic() {
        let a = peer_color(&PeerId::from("alice"));
        assert_eq!(a, peer_color(&PeerId::from("alice")));
        assert!(PALETTE.contains(&a.as_str()));
    }

    #[test]
    fn test_set_local() {
        let mut tracker = PresenceTracker::new(PeerId::from("me"), DEFAULT_PRESENCE_TIMEOUT_MS);
        tracker.set_local(
            Some(Position::new(5.0, 5.0)),
            vec![NodeId::from("n1")],
            Some("n1".to_string()),
            42,
        );
        assert_eq!(tracker.local().last_update, 42);
        assert_eq!(tracker.local().selection, vec![NodeId::from("n1")]);
        assert!(tracker.get_all_presences().is_empty());
    }

    #[test]
    fn test_apply_remote_stamps_receive_time() {
        let mut tracker = PresenceTracker::new(PeerId::from("me"), 100);
        assert!(tracker.apply_remote(remote("bob", 999_999), 10));
        assert_eq!(tracker.get(&PeerId::from("bob")).unwrap().last_update, 10);
    }

    #[test]
    fn test_apply_remote_ignores_own_entry() {
        let mut tracker = PresenceTracker::new(PeerId::from("me"), 100);
        assert!(!tracker.apply_remote(remote("me", 1), 1));
        assert!(tracker.get_all_presences().is_empty());
    }

    #[test]
    fn test_sweep_evicts_stale_entries() {
        let mut tracker = PresenceTracker::new(PeerId::from("me"), 5_000);
        tracker.apply_remote(remote("old", 0), 1_000);
        tracker.apply_remote(remote("fresh", 0), 5_500);

        let evicted = tracker.sweep(7_000);
        assert_eq!(evicted, vec![PeerId::from("old")]);

        let remaining: Vec<_> = tracker
            .get_all_presences()
            .into_iter()
            .map(|p| p.peer_id.clone())
            .collect();
        assert_eq!(remaining, vec![PeerId::from("fresh")]);
    }

    #[test]
    fn test_remove() {
        let mut tracker = PresenceTracker::new(PeerId::from("me"), 100);
        tracker.apply_remote(remote("bob", 0), 0);
        assert!(tracker.remove(&PeerId::from("bob")).is_some());
        assert!(tracker.remove(&PeerId::from("bob")).is_none());
    }

    #[test]
    fn test_entry_wire_shape() {
        let entry = remote("bob", 3);
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["peerId"], "bob");
        assert_eq!(json["lastUpdate"], 3);
        assert_eq!(json["cursor"]["x"], 1.0);
        assert!(json.get("activeEditor").is_none());
    }
}
