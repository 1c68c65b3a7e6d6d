//! Bidirectional sync between a node's content view and its positional view.
//!
//! The positional side only carries a content address (hash) and a position.
//! Content is remembered in a hash -> content table for as long as some entry
//! references it, so a positional update naming a live hash restores the
//! exact content. Unknown hashes produce a placeholder marked `reconstructed`.
//!
//! Calls are serialized. A call made from the thread that is already inside a
//! bridge call (typically a listener reacting to a notification) is dropped
//! rather than queued, which stops content -> positional -> content loops.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, trace};

use crate::error::SyncError;
use crate::hash::content_hash_hex;
use crate::time::current_time_ms;
use crate::types::ids::NodeId;
use crate::types::operation::Position;

/// Which side of the bridge last wrote an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewSource {
    Content,
    Positional,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentView {
    pub content: Value,
    pub hash: String,
    /// True when the content is a placeholder rebuilt from an unknown hash
    #[serde(default)]
    pub reconstructed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionalView {
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
}

impl PositionalView {
    pub fn new(hash: impl Into<String>, position: Option<Position>) -> Self {
        Self {
            hash: hash.into(),
            position,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastModified {
    pub source: ViewSource,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEntry {
    pub content_view: Option<ContentView>,
    pub positional_view: Option<PositionalView>,
    pub last_modified: Option<LastModified>,
}

/// Result of a bridge call
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeOutcome {
    /// The entry after the call
    Synced(SyncEntry),
    /// Re-entrant call; nothing happened
    Dropped,
}

impl BridgeOutcome {
    pub fn is_dropped(&self) -> bool {
        matches!(self, BridgeOutcome::Dropped)
    }

    pub fn entry(&self) -> Option<&SyncEntry> {
        match self {
            BridgeOutcome::Synced(entry) => Some(entry),
            BridgeOutcome::Dropped => None,
        }
    }
}

pub type ContentListener = Arc<dyn Fn(&NodeId, &ContentView) + Send + Sync>;
pub type PositionalListener = Arc<dyn Fn(&NodeId, &PositionalView) + Send + Sync>;

/// Content behind one hash and how many entries point at it
struct Interned {
    content: Value,
    refs: usize,
}

#[derive(Default)]
struct BridgeState {
    entries: BTreeMap<NodeId, SyncEntry>,
    /// Content address -> content, for hashes some entry references
    lookup: HashMap<String, Interned>,
}

impl BridgeState {
    /// Hash `node_id` currently holds a reference to; placeholders hold none
    fn referenced_hash(&self, node_id: &NodeId) -> Option<String> {
        let entry = self.entries.get(node_id)?;
        match &entry.content_view {
            Some(view) if !view.reconstructed => Some(view.hash.clone()),
            _ => None,
        }
    }

    fn retain(&mut self, hash: &str) {
        if let Some(interned) = self.lookup.get_mut(hash) {
            interned.refs += 1;
        }
    }

    fn release(&mut self, hash: Option<String>) {
        let Some(hash) = hash else {
            return;
        };
        let unused = self.lookup.get_mut(&hash).is_some_and(|interned| {
            interned.refs = interned.refs.saturating_sub(1);
            interned.refs == 0
        });
        if unused {
            self.lookup.remove(&hash);
            trace!(hash = %hash, "evicted content");
        }
    }
}

/// Change to announce once the state lock is released
enum Notify {
    Content(NodeId, ContentView),
    Positional(NodeId, PositionalView),
}

pub struct RepresentationBridge {
    state: Mutex<BridgeState>,
    content_listeners: Mutex<Vec<ContentListener>>,
    positional_listeners: Mutex<Vec<PositionalListener>>,
    /// Thread currently inside a bridge call
    owner: Mutex<Option<ThreadId>>,
    serial: Mutex<()>,
}

/// Held for the duration of one bridge call
struct CallGuard<'a> {
    owner: &'a Mutex<Option<ThreadId>>,
    _serial: MutexGuard<'a, ()>,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        *lock(self.owner) = None;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Default for RepresentationBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RepresentationBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepresentationBridge")
            .field("entries", &self.len())
            .finish_non_exhaustive()
    }
}

impl RepresentationBridge {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BridgeState::default()),
            content_listeners: Mutex::new(Vec::new()),
            positional_listeners: Mutex::new(Vec::new()),
            owner: Mutex::new(None),
            serial: Mutex::new(()),
        }
    }

    pub fn on_content_change(&self, listener: impl Fn(&NodeId, &ContentView) + Send + Sync + 'static) {
        lock(&self.content_listeners).push(Arc::new(listener));
    }

    pub fn on_positional_change(
        &self,
        listener: impl Fn(&NodeId, &PositionalView) + Send + Sync + 'static,
    ) {
        lock(&self.positional_listeners).push(Arc::new(listener));
    }

    pub fn entry(&self, node_id: &NodeId) -> Option<SyncEntry> {
        lock(&self.state).entries.get(node_id).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Distinct contents held in the hash lookup table
    pub fn cached_contents(&self) -> usize {
        lock(&self.state).lookup.len()
    }

    /// Drop every entry and the hash lookup table
    pub fn clear(&self) {
        let mut state = lock(&self.state);
        state.entries.clear();
        state.lookup.clear();
    }

    /// Forget one node, evicting its content if nothing else references it
    pub fn remove(&self, node_id: &NodeId) -> Option<SyncEntry> {
        let mut state = lock(&self.state);
        let previous = state.referenced_hash(node_id);
        let removed = state.entries.remove(node_id);
        state.release(previous);
        removed
    }

    pub fn update_from_content(
        &self,
        node_id: &NodeId,
        content: Value,
    ) -> Result<BridgeOutcome, SyncError> {
        self.update_from_content_at(node_id, content, current_time_ms())
    }

    /// Derive the positional view from new content and notify positional listeners
    pub fn update_from_content_at(
        &self,
        node_id: &NodeId,
        content: Value,
        now_ms: u64,
    ) -> Result<BridgeOutcome, SyncError> {
        let Some(_guard) = self.enter(node_id) else {
            return Ok(BridgeOutcome::Dropped);
        };

        let (entry, notify) = {
            let mut state = lock(&self.state);
            let notify = sync_content(&mut state, node_id, content, ViewSource::Content, now_ms)?;
            (state.entries.get(node_id).cloned().unwrap_or_default(), notify)
        };
        self.notify(notify);
        Ok(BridgeOutcome::Synced(entry))
    }

    pub fn update_from_position(
        &self,
        node_id: &NodeId,
        positional: PositionalView,
    ) -> BridgeOutcome {
        self.update_from_position_at(node_id, positional, current_time_ms())
    }

    /// Rebuild the content view from the positional hash and notify content listeners
    pub fn update_from_position_at(
        &self,
        node_id: &NodeId,
        positional: PositionalView,
        now_ms: u64,
    ) -> BridgeOutcome {
        let Some(_guard) = self.enter(node_id) else {
            return BridgeOutcome::Dropped;
        };

        let (entry, notify) = {
            let mut state = lock(&self.state);
            let notify = sync_position(&mut state, node_id, positional, ViewSource::Positional, now_ms);
            (state.entries.get(node_id).cloned().unwrap_or_default(), notify)
        };
        self.notify(notify);
        BridgeOutcome::Synced(entry)
    }

    pub fn resolve_conflict(
        &self,
        node_id: &NodeId,
        content: Value,
        positional: PositionalView,
    ) -> Result<BridgeOutcome, SyncError> {
        self.resolve_conflict_at(node_id, content, positional, current_time_ms())
    }

    /// Keep the side that wrote the entry last and regenerate the other from it.
    /// With no history the content side wins.
    pub fn resolve_conflict_at(
        &self,
        node_id: &NodeId,
        content: Value,
        positional: PositionalView,
        now_ms: u64,
    ) -> Result<BridgeOutcome, SyncError> {
        let Some(_guard) = self.enter(node_id) else {
            return Ok(BridgeOutcome::Dropped);
        };

        let (entry, notify) = {
            let mut state = lock(&self.state);
            let winner = state
                .entries
                .get(node_id)
                .and_then(|e| e.last_modified)
                .map_or(ViewSource::Content, |m| m.source);

            debug!(node = %node_id, winner = ?winner, "resolving bridge conflict");
            let notify = match winner {
                ViewSource::Content => sync_content(&mut state, node_id, content, winner, now_ms)?,
                ViewSource::Positional => sync_position(&mut state, node_id, positional, winner, now_ms),
            };
            (state.entries.get(node_id).cloned().unwrap_or_default(), notify)
        };
        self.notify(notify);
        Ok(BridgeOutcome::Synced(entry))
    }

    fn enter(&self, node_id: &NodeId) -> Option<CallGuard<'_>> {
        let me = thread::current().id();
        if *lock(&self.owner) == Some(me) {
            trace!(node = %node_id, "re-entrant bridge call dropped");
            return None;
        }
        let serial = lock(&self.serial);
        *lock(&self.owner) = Some(me);
        Some(CallGuard {
            owner: &self.owner,
            _serial: serial,
        })
    }

    fn notify(&self, notify: Notify) {
        match notify {
            Notify::Content(node_id, view) => {
                let listeners = lock(&self.content_listeners).clone();
                for listener in listeners {
                    listener(&node_id, &view);
                }
            }
            Notify::Positional(node_id, view) => {
                let listeners = lock(&self.positional_listeners).clone();
                for listener in listeners {
                    listener(&node_id, &view);
                }
            }
        }
    }
}

fn sync_content(
    state: &mut BridgeState,
    node_id: &NodeId,
    content: Value,
    source: ViewSource,
    now_ms: u64,
) -> Result<Notify, SyncError> {
    let hash = content_hash_hex(&content)?;
    let previous = state.referenced_hash(node_id);
    state
        .lookup
        .entry(hash.clone())
        .or_insert_with(|| Interned {
            content: content.clone(),
            refs: 0,
        })
        .refs += 1;
    state.release(previous);

    let entry = state.entries.entry(node_id.clone()).or_default();
    // Position survives content edits
    let position = entry.positional_view.as_ref().and_then(|p| p.position);
    let positional = PositionalView::new(hash.clone(), position);

    entry.content_view = Some(ContentView {
        content,
        hash,
        reconstructed: false,
    });
    entry.positional_view = Some(positional.clone());
    entry.last_modified = Some(LastModified {
        source,
        timestamp: now_ms,
    });

    Ok(Notify::Positional(node_id.clone(), positional))
}

fn sync_position(
    state: &mut BridgeState,
    node_id: &NodeId,
    positional: PositionalView,
    source: ViewSource,
    now_ms: u64,
) -> Notify {
    let previous = state.referenced_hash(node_id);
    state.retain(&positional.hash);
    state.release(previous);

    let content = match state.lookup.get(&positional.hash) {
        Some(known) => ContentView {
            content: known.content.clone(),
            hash: positional.hash.clone(),
            reconstructed: false,
        },
        None => {
            debug!(node = %node_id, hash = %positional.hash, "unknown content hash, using placeholder");
            ContentView {
                content: json!({ "hash": positional.hash }),
                hash: positional.hash.clone(),
                reconstructed: true,
            }
        }
    };

    let entry = state.entries.entry(node_id.clone()).or_default();
    entry.content_view = Some(content.clone());
    entry.positional_view = Some(positional);
    entry.last_modified = Some(LastModified {
        source,
        timestamp: now_ms,
    });

    Notify::Content(node_id.clone(), content)
}
