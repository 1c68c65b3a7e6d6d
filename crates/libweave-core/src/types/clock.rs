//! Vector clocks for causality tracking between peers.
//!
//! A missing entry reads as tick 0, so `{p1: 2}` and `{p1: 2, p2: 0}` are the
//! same clock. Entries never decrease within one instance; `merge` and
//! `without_peers` build new instances.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::ids::PeerId;

/// Per-peer logical clock vector, owned by one peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorClock {
    /// Peer whose entry `tick` advances
    owner: PeerId,
    /// Tick per peer
    entries: BTreeMap<PeerId, u64>,
}

impl VectorClock {
    /// Create a clock for `owner` with its own entry at 0
    pub fn new(owner: PeerId) -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(owner.clone(), 0);
        Self { owner, entries }
    }

    /// Build a clock from explicit entries
    pub fn from_entries(owner: PeerId, entries: impl IntoIterator<Item = (PeerId, u64)>) -> Self {
        let mut clock = Self::new(owner);
        for (peer, tick) in entries {
            let slot = clock.entries.entry(peer).or_insert(0);
            *slot = (*slot).max(tick);
        }
        clock
    }

    pub fn owner(&self) -> &PeerId {
        &self.owner
    }

    pub fn entries(&self) -> &BTreeMap<PeerId, u64> {
        &self.entries
    }

    /// Tick for a peer (0 if absent)
    pub fn get(&self, peer: &PeerId) -> u64 {
        self.entries.get(peer).copied().unwrap_or(0)
    }

    /// Increment the owner's entry and return the new value
    pub fn tick(&mut self) -> u64 {
        let slot = self.entries.entry(self.owner.clone()).or_insert(0);
        *slot = slot.saturating_add(1);
        *slot
    }

    /// Element-wise maximum over the union of keys, keeping `self`'s owner
    pub fn merge(&self, other: &VectorClock) -> VectorClock {
        let mut entries = self.entries.clone();
        for (peer, &tick) in &other.entries {
            let slot = entries.entry(peer.clone()).or_insert(0);
            *slot = (*slot).max(tick);
        }
        VectorClock {
            owner: self.owner.clone(),
            entries,
        }
    }

    /// Strict causal precedence: `self <= other` everywhere and `<` somewhere
    pub fn happens_before(&self, other: &VectorClock) -> bool {
        let mut strictly_less = false;
        for peer in self.union_keys(other) {
            let (a, b) = (self.get(peer), other.get(peer));
            if a > b {
                return false;
            }
            if a < b {
                strictly_less = true;
            }
        }
        strictly_less
    }

    /// Neither clock happens before the other
    pub fn is_concurrent(&self, other: &VectorClock) -> bool {
        !self.happens_before(other) && !other.happens_before(self)
    }

    /// Every non-zero entry except the owner's
    pub fn causal_chain(&self) -> Vec<(PeerId, u64)> {
        self.entries
            .iter()
            .filter(|&(peer, &tick)| *peer != self.owner && tick > 0)
            .map(|(peer, &tick)| (peer.clone(), tick))
            .collect()
    }

    /// Copy of this clock with the given peers' entries removed.
    /// The owner's entry is never removed.
    pub fn without_peers(&self, peers: &BTreeSet<PeerId>) -> VectorClock {
        let entries = self
            .entries
            .iter()
            .filter(|(peer, _)| **peer == self.owner || !peers.contains(*peer))
            .map(|(peer, &tick)| (peer.clone(), tick))
            .collect();
        VectorClock {
            owner: self.owner.clone(),
            entries,
        }
    }

    fn union_keys<'a>(&'a self, other: &'a VectorClock) -> BTreeSet<&'a PeerId> {
        self.entries.keys().chain(other.entries.keys()).collect()
    }
}

impl PartialEq for VectorClock {
    /// Tick-wise equality; the owner does not take part
    fn eq(&self, other: &Self) -> bool {
        self.union_keys(other)
            .into_iter()
            .all(|peer| self.get(peer) == other.get(peer))
    }
}

impl Eq for VectorClock {}
