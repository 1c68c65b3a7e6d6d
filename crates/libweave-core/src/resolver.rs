//! Conflict resolution for concurrent operations.
//!
//! Every peer runs the same pure `transform` over the same set of concurrent
//! operations, ordered by `(timestamp, peer, sequence)`. Arrival order never
//! takes part, which is what makes replicas converge.
//!
//! Rules shared by both strategies:
//! - a Delete candidate is invalidated by a concurrent Create with a newer
//!   version, otherwise it applies;
//! - any other candidate is invalidated by a newer concurrent Delete, unless
//!   a concurrent Create newer than that Delete brought the node back;
//! - a Create folds every concurrent writer into itself and applies under
//!   the newest version among them.
//!
//! Remote operations go through `deliver`, which holds an operation back
//! until every operation its clock covers has been integrated. Deletes that
//! take effect leave a tombstone, which snapshots carry so a peer that missed
//! the delete cannot bring the node back.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::error::SyncError;
use crate::time::current_time_ms;
use crate::types::clock::VectorClock;
use crate::types::ids::{NodeId, PeerId};
use crate::types::node::{NodeState, StateSnapshot, Tombstone};
use crate::types::operation::{
    NodeData, Operation, OperationKey, OperationKind, OperationPayload, Position, Version,
};

/// Default number of operations kept per node for concurrency detection
pub const DEFAULT_HISTORY_LIMIT: usize = 64;

/// Default number of nodes whose history windows are kept
pub const DEFAULT_HISTORY_NODE_LIMIT: usize = 4096;

/// Default number of operations held back waiting for their causal past
pub const DEFAULT_PENDING_LIMIT: usize = 1024;

/// Conflict resolution strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// The newest operation wins; older ones are folded into it
    #[default]
    LastWriteWins,
    /// Pairwise per-kind rule table
    OperationalTransform,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::LastWriteWins => "last_write_wins",
            Strategy::OperationalTransform => "operational_transform",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "last_write_wins" | "lww" => Some(Strategy::LastWriteWins),
            "operational_transform" | "ot" => Some(Strategy::OperationalTransform),
            _ => None,
        }
    }
}

/// Outcome of integrating one operation
#[derive(Debug, Clone, PartialEq)]
pub enum Integration {
    /// The (possibly transformed) operation was applied
    Applied { resolved: Operation, changed: bool },
    /// A concurrent operation won; nothing was applied
    Invalidated,
    /// Already integrated earlier
    Duplicate,
    /// Held back until the operations it depends on arrive
    Deferred,
}

impl Integration {
    pub fn changed(&self) -> bool {
        matches!(self, Integration::Applied { changed: true, .. })
    }
}

/// One operation leaving the causal buffer, with what integrating it did
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub op: Operation,
    pub outcome: Integration,
}

/// Sequences seen from one origin: contiguous prefix plus stragglers
#[derive(Debug, Default)]
struct SeenSequences {
    watermark: u64,
    pending: BTreeSet<u64>,
}

impl SeenSequences {
    /// Every sequence up to and including `sequence` counts as seen
    fn advance_to(&mut self, sequence: u64) {
        if sequence <= self.watermark {
            return;
        }
        self.watermark = sequence;
        self.pending = self.pending.split_off(&(sequence + 1));
        while self.pending.remove(&(self.watermark + 1)) {
            self.watermark += 1;
        }
    }

    fn contains(&self, sequence: u64) -> bool {
        sequence <= self.watermark || self.pending.contains(&sequence)
    }

    fn insert(&mut self, sequence: u64) {
        if sequence <= self.watermark {
            return;
        }
        self.pending.insert(sequence);
        while self.pending.remove(&(self.watermark + 1)) {
            self.watermark += 1;
        }
    }
}

/// Recent operations on one node plus its slot in the recency index
#[derive(Debug, Default)]
struct NodeHistory {
    ops: VecDeque<Operation>,
    touched: u64,
}

/// Resolves and applies operations for one peer
#[derive(Debug)]
pub struct ConflictResolver {
    strategy: Strategy,
    history_limit: usize,
    node_limit: usize,
    pending_limit: usize,
    /// Recently integrated operations per node
    history: HashMap<NodeId, NodeHistory>,
    /// Touch counter -> node, oldest first
    recency: BTreeMap<u64, NodeId>,
    touches: u64,
    seen: BTreeMap<PeerId, SeenSequences>,
    /// Operations whose causal past has not been integrated yet
    pending: VecDeque<Operation>,
    tombstones: BTreeMap<NodeId, Tombstone>,
    /// Last sequence handed out per local peer
    sequences: BTreeMap<PeerId, u64>,
}

impl ConflictResolver {
    pub fn new(strategy: Strategy) -> Self {
        Self::with_history_limit(strategy, DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_history_limit(strategy: Strategy, history_limit: usize) -> Self {
        Self {
            strategy,
            history_limit: history_limit.max(1),
            node_limit: DEFAULT_HISTORY_NODE_LIMIT,
            pending_limit: DEFAULT_PENDING_LIMIT,
            history: HashMap::new(),
            recency: BTreeMap::new(),
            touches: 0,
            seen: BTreeMap::new(),
            pending: VecDeque::new(),
            tombstones: BTreeMap::new(),
            sequences: BTreeMap::new(),
        }
    }

    /// Cap the number of nodes with a history window; the least recently
    /// touched window goes first
    pub fn with_node_limit(mut self, node_limit: usize) -> Self {
        self.node_limit = node_limit.max(1);
        self
    }

    pub fn with_pending_limit(mut self, pending_limit: usize) -> Self {
        self.pending_limit = pending_limit.max(1);
        self
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Build a local operation with the next sequence number for `peer_id`
    pub fn create_operation(
        &mut self,
        node_id: NodeId,
        payload: OperationPayload,
        peer_id: PeerId,
        clock: VectorClock,
    ) -> Operation {
        self.create_operation_at(node_id, payload, peer_id, clock, current_time_ms())
    }

    pub fn create_operation_at(
        &mut self,
        node_id: NodeId,
        payload: OperationPayload,
        peer_id: PeerId,
        clock: VectorClock,
        timestamp: u64,
    ) -> Operation {
        let sequence = self.sequences.entry(peer_id.clone()).or_insert(0);
        *sequence += 1;
        Operation::new(node_id, payload, peer_id, timestamp, *sequence, clock)
    }

    /// Nodes that currently hold a history window
    pub fn tracked_nodes(&self) -> usize {
        self.history.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn tombstone(&self, node_id: &NodeId) -> Option<&Tombstone> {
        self.tombstones.get(node_id)
    }

    pub fn tombstones(&self) -> &BTreeMap<NodeId, Tombstone> {
        &self.tombstones
    }

    /// Highest sequence from `origin` below which nothing is missing
    pub fn delivered(&self, origin: &PeerId) -> u64 {
        self.seen.get(origin).map_or(0, |seen| seen.watermark)
    }

    /// Operations in the history window that are concurrent with `op`
    pub fn concurrent_with(&self, op: &Operation) -> Vec<Operation> {
        let key = op.key();
        self.history
            .get(&op.node_id)
            .map(|window| {
                window
                    .ops
                    .iter()
                    .filter(|h| h.key() != key && h.vector_clock.is_concurrent(&op.vector_clock))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_duplicate(&self, op: &Operation) -> bool {
        self.seen
            .get(&op.origin)
            .is_some_and(|seen| seen.contains(op.sequence))
    }

    /// Whether everything `op` had seen when it was created has been
    /// integrated here, so it cannot overtake an operation it depends on
    pub fn is_deliverable(&self, op: &Operation) -> bool {
        if op.sequence > self.delivered(&op.origin) + 1 {
            return false;
        }
        op.vector_clock
            .entries()
            .iter()
            .filter(|(peer, _)| **peer != op.origin)
            .all(|(peer, &tick)| tick <= self.delivered(peer))
    }

    /// Integrate `op` once its causal past is here, holding it back otherwise.
    ///
    /// Returns every operation that was integrated as a result: `op` itself
    /// first (or as `Deferred`), then any held-back operations it unblocked.
    pub fn deliver(
        &mut self,
        state: &mut NodeState,
        op: Operation,
    ) -> Result<Vec<Delivery>, SyncError> {
        op.validate()?;
        if self.is_duplicate(&op) {
            return Ok(vec![Delivery {
                op,
                outcome: Integration::Duplicate,
            }]);
        }
        if !self.is_deliverable(&op) {
            self.defer(op.clone());
            return Ok(vec![Delivery {
                op,
                outcome: Integration::Deferred,
            }]);
        }

        let outcome = self.integrate(state, op.clone())?;
        let mut deliveries = vec![Delivery { op, outcome }];
        deliveries.extend(self.drain(state)?);
        Ok(deliveries)
    }

    /// Integrate every held-back operation whose causal past is now complete
    pub fn drain(&mut self, state: &mut NodeState) -> Result<Vec<Delivery>, SyncError> {
        let mut deliveries = Vec::new();
        while let Some(index) = self.next_ready() {
            let Some(op) = self.pending.remove(index) else {
                break;
            };
            let outcome = if self.is_duplicate(&op) {
                Integration::Duplicate
            } else {
                self.integrate(state, op.clone())?
            };
            deliveries.push(Delivery { op, outcome });
        }
        Ok(deliveries)
    }

    fn next_ready(&self) -> Option<usize> {
        self.pending
            .iter()
            .position(|op| self.is_duplicate(op) || self.is_deliverable(op))
    }

    fn defer(&mut self, op: Operation) {
        if self.pending.iter().any(|p| p.key() == op.key()) {
            return;
        }
        trace!(origin = %op.origin, sequence = op.sequence, "deferring operation");
        self.pending.push_back(op);
        while self.pending.len() > self.pending_limit {
            if let Some(dropped) = self.pending.pop_front() {
                warn!(
                    origin = %dropped.origin,
                    sequence = dropped.sequence,
                    "causal buffer full, dropping operation"
                );
            }
        }
    }

    /// Fold a peer snapshot taken at `clock` into `state`.
    ///
    /// A remote tombstone this replica has not integrated yet removes the
    /// local record. A remote record is refused while a local tombstone
    /// exists that the sender had not seen. Everything `clock` covers then
    /// counts as delivered. Returns the ids whose record changed.
    pub fn adopt_snapshot(
        &mut self,
        state: &mut NodeState,
        snapshot: &StateSnapshot,
        clock: &VectorClock,
    ) -> Vec<NodeId> {
        let mut changed = Vec::new();
        for (node_id, incoming) in &snapshot.tombstones {
            if self.has_delivered(&incoming.vector_clock) {
                continue;
            }
            if state.remove(node_id).is_some() {
                changed.push(node_id.clone());
            }
            self.keep_tombstone(node_id, incoming.clone());
        }

        let tombstones = &self.tombstones;
        let adopted = state.adopt_snapshot(&snapshot.nodes, |node_id, _| {
            tombstones.get(node_id).is_some_and(|t| !t.seen_by(clock))
        });
        for node_id in adopted {
            if !changed.contains(&node_id) {
                changed.push(node_id);
            }
        }

        self.acknowledge(clock);
        debug!(
            changed = changed.len(),
            tombstones = snapshot.tombstones.len(),
            "adopted snapshot"
        );
        changed
    }

    /// Count every operation `clock` covers as delivered
    pub fn acknowledge(&mut self, clock: &VectorClock) {
        for (peer, &tick) in clock.entries() {
            self.seen.entry(peer.clone()).or_default().advance_to(tick);
        }
    }

    /// Whether every operation `clock` covers has been delivered here
    fn has_delivered(&self, clock: &VectorClock) -> bool {
        clock
            .entries()
            .iter()
            .all(|(peer, &tick)| tick <= self.delivered(peer))
    }

    fn keep_tombstone(&mut self, node_id: &NodeId, tombstone: Tombstone) {
        let newer = self
            .tombstones
            .get(node_id)
            .map_or(true, |t| tombstone.version.is_newer_than(&t.version));
        if newer {
            self.tombstones.insert(node_id.clone(), tombstone);
        }
    }

    /// Produce the operation to apply given concurrent operations, or `None`
    /// if `op` is invalidated.
    pub fn transform(&self, op: &Operation, concurrent: &[Operation]) -> Option<Operation> {
        let key = op.key();
        let mut relevant: Vec<&Operation> = concurrent
            .iter()
            .filter(|c| c.node_id == op.node_id && c.key() != key)
            .collect();
        if relevant.is_empty() {
            return Some(op.clone());
        }
        relevant.sort_by_key(|c| c.version());

        match self.strategy {
            Strategy::LastWriteWins => transform_lww(op, &relevant),
            Strategy::OperationalTransform => transform_ot(op, &relevant),
        }
    }

    /// Apply a resolved operation (`None` is a no-op)
    pub fn apply(&self, state: &mut NodeState, op: Option<&Operation>) -> Result<bool, SyncError> {
        state.apply_resolved(op)
    }

    /// Deduplicate, transform against the history window, apply and record
    pub fn integrate(
        &mut self,
        state: &mut NodeState,
        op: Operation,
    ) -> Result<Integration, SyncError> {
        op.validate()?;
        if self.is_duplicate(&op) {
            trace!(origin = %op.origin, sequence = op.sequence, "duplicate operation");
            return Ok(Integration::Duplicate);
        }

        let concurrent = self.concurrent_with(&op);
        let resolved = self.transform(&op, &concurrent);
        let changed = self.apply(state, resolved.as_ref())?;

        debug!(
            node = %op.node_id,
            kind = op.kind().as_str(),
            origin = %op.origin,
            concurrent = concurrent.len(),
            invalidated = resolved.is_none(),
            changed,
            "integrated operation"
        );

        self.record(op, resolved.is_none());
        Ok(match resolved {
            Some(resolved) => Integration::Applied { resolved, changed },
            None => Integration::Invalidated,
        })
    }

    fn record(&mut self, op: Operation, invalidated: bool) {
        self.seen
            .entry(op.origin.clone())
            .or_default()
            .insert(op.sequence);
        if !invalidated {
            self.update_tombstone(&op);
        }

        self.touches += 1;
        let window = self.history.entry(op.node_id.clone()).or_default();
        if window.touched != 0 {
            self.recency.remove(&window.touched);
        }
        window.touched = self.touches;
        self.recency.insert(self.touches, op.node_id.clone());

        window.ops.push_back(op);
        while window.ops.len() > self.history_limit {
            window.ops.pop_front();
        }

        while self.history.len() > self.node_limit {
            let Some((_, evicted)) = self.recency.pop_first() else {
                break;
            };
            self.history.remove(&evicted);
            trace!(node = %evicted, "evicted history window");
        }
    }

    /// Deletes leave a tombstone; a Create that revives the node clears it
    fn update_tombstone(&mut self, op: &Operation) {
        match op.kind() {
            OperationKind::Delete => self.keep_tombstone(
                &op.node_id,
                Tombstone {
                    version: op.version(),
                    vector_clock: op.vector_clock.clone(),
                },
            ),
            OperationKind::Create => {
                let revived = self
                    .tombstones
                    .get(&op.node_id)
                    .is_some_and(|t| t.revived_by(&op.version(), &op.vector_clock));
                if revived {
                    self.tombstones.remove(&op.node_id);
                }
            }
            OperationKind::Update | OperationKind::Move => {}
        }
    }
}

/// Delete rules both strategies share; `Some(result)` short-circuits.
///
/// A Delete loses to any newer concurrent Create. Any other candidate is
/// invalidated by the newest concurrent Delete newer than itself, unless a
/// Create newer than that Delete re-created the node.
fn delete_rules(op: &Operation, relevant: &[&Operation]) -> Option<Option<Operation>> {
    let version = op.version();
    let newest = |kind: OperationKind| {
        relevant
            .iter()
            .filter(|c| c.kind() == kind)
            .map(|c| c.version())
            .max()
    };
    let newest_create = newest(OperationKind::Create);

    if op.kind() == OperationKind::Delete {
        return Some(match newest_create {
            Some(create) if create > version => None,
            _ => Some(op.clone()),
        });
    }

    match newest(OperationKind::Delete) {
        Some(delete) if delete > version && newest_create.map_or(true, |c| c < delete) => {
            Some(None)
        }
        _ => None,
    }
}

fn sets_position(op: &Operation) -> bool {
    matches!(
        op.payload,
        OperationPayload::Move { .. }
            | OperationPayload::Create {
                position: Some(_),
                ..
            }
    )
}

/// Fold Create/Update/Move writers in version order into one Create payload
fn fold_create(writers: &[&Operation]) -> (NodeData, Option<Position>) {
    let mut data = NodeData::new();
    let mut position = None;
    for writer in writers {
        match &writer.payload {
            OperationPayload::Create {
                data: fields,
                position: p,
            } => {
                data.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
                if p.is_some() {
                    position = *p;
                }
            }
            OperationPayload::Update { fields } => {
                data.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            OperationPayload::Move { position: p } => position = Some(*p),
            OperationPayload::Delete => {}
        }
    }
    (data, position)
}

/// A Create absorbs every concurrent writer and applies under the newest
/// version among them, so the record is the same whichever arrived first.
fn merge_create(op: &Operation, relevant: &[&Operation]) -> Operation {
    let mut writers: Vec<&Operation> = relevant.to_vec();
    writers.push(op);
    writers.sort_by_key(|w| w.version());

    let (data, position) = fold_create(&writers);
    let latest = writers
        .last()
        .map_or_else(|| op.version(), |w| w.version());
    op.with_payload(OperationPayload::Create { data, position })
        .restamped(&latest)
}

fn transform_lww(op: &Operation, relevant: &[&Operation]) -> Option<Operation> {
    if let Some(decided) = delete_rules(op, relevant) {
        return decided;
    }

    let version = op.version();
    let later: Vec<&Operation> = relevant
        .iter()
        .copied()
        .filter(|c| c.version() > version)
        .collect();
    let latest: Version = later.last().map_or_else(|| version.clone(), |c| c.version());

    match &op.payload {
        OperationPayload::Create { .. } => Some(merge_create(op, relevant)),

        OperationPayload::Update { fields } => {
            if later.is_empty() {
                return Some(op.clone());
            }
            // Fields written by newer operations lose
            let surviving: NodeData = fields
                .iter()
                .filter(|(k, _)| {
                    !later
                        .iter()
                        .any(|c| c.payload.fields().is_some_and(|f| f.contains_key(*k)))
                })
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            let merged = op.with_payload(OperationPayload::Update { fields: surviving });
            Some(merged.restamped(&latest))
        }

        OperationPayload::Move { .. } => {
            if later.iter().any(|c| sets_position(c)) {
                None
            } else {
                Some(op.clone())
            }
        }

        OperationPayload::Delete => Some(op.clone()),
    }
}

fn transform_ot(op: &Operation, relevant: &[&Operation]) -> Option<Operation> {
    if let Some(decided) = delete_rules(op, relevant) {
        return decided;
    }
    if op.kind() == OperationKind::Create {
        return Some(merge_create(op, relevant));
    }

    let mut current = op.clone();
    for other in relevant {
        current = transform_pair(current, other)?;
    }
    Some(current)
}

/// One row of the rule table: adjust `candidate` against a concurrent `other`
fn transform_pair(candidate: Operation, other: &Operation) -> Option<Operation> {
    if other.version() < candidate.version() {
        return Some(candidate);
    }

    let payload = match &candidate.payload {
        // Move vs Move: the later position wins
        OperationPayload::Move { .. } if sets_position(other) => return None,

        // Update vs Update/Create: later write wins per field
        OperationPayload::Update { fields } => {
            let Some(other_fields) = other.payload.fields() else {
                return Some(candidate);
            };
            let fields = fields
                .iter()
                .filter(|(k, _)| !other_fields.contains_key(*k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            OperationPayload::Update { fields }
        }

        _ => return Some(candidate),
    };

    Some(candidate.with_payload(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::node::NodeRecord;
    use serde_json::{json, Value};

    fn fields(v: Value) -> NodeData {
        match v {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn peer(s: &str) -> PeerId {
        PeerId::from(s)
    }

    /// Operation from `origin` whose clock only knows its own tick (so ops
    /// from different origins are concurrent)
    fn op_at(origin: &str, seq: u64, ts: u64, payload: OperationPayload) -> Operation {
        let clock = VectorClock::from_entries(peer(origin), [(peer(origin), seq), (peer("base"), 1)]);
        Operation::new(NodeId::from("n1"), payload, peer(origin), ts, seq, clock)
    }

    fn update(origin: &str, ts: u64, data: Value) -> Operation {
        op_at(origin, 1, ts, OperationPayload::Update { fields: fields(data) })
    }

    fn create(origin: &str, ts: u64, data: Value) -> Operation {
        op_at(
            origin,
            1,
            ts,
            OperationPayload::Create {
                data: fields(data),
                position: None,
            },
        )
    }

    fn delete(origin: &str, ts: u64) -> Operation {
        op_at(origin, 1, ts, OperationPayload::Delete)
    }

    fn mv(origin: &str, ts: u64, x: f64) -> Operation {
        op_at(
            origin,
            1,
            ts,
            OperationPayload::Move {
                position: Position::new(x, x),
            },
        )
    }

    /// Base node created by "base" before every other operation
    fn base_state(resolver: &mut ConflictResolver) -> NodeState {
        let mut state = NodeState::new();
        let base = Operation::new(
            NodeId::from("n1"),
            OperationPayload::Create {
                data: fields(json!({"title": "base"})),
                position: None,
            },
            peer("base"),
            1,
            1,
            VectorClock::from_entries(peer("base"), [(peer("base"), 1)]),
        );
        resolver.integrate(&mut state, base).unwrap();
        state
    }

    /// Integrate `ops` in order on a fresh replica and return the state
    fn replay(strategy: Strategy, with_base: bool, ops: &[Operation]) -> NodeState {
        let mut resolver = ConflictResolver::new(strategy);
        let mut state = if with_base {
            base_state(&mut resolver)
        } else {
            NodeState::new()
        };
        for op in ops {
            resolver.integrate(&mut state, op.clone()).unwrap();
        }
        state
    }

    fn assert_converges(strategy: Strategy, with_base: bool, a: &Operation, b: &Operation) -> NodeState {
        let ab = replay(strategy, with_base, &[a.clone(), b.clone()]);
        let ba = replay(strategy, with_base, &[b.clone(), a.clone()]);
        assert_eq!(ab, ba, "{:?}: {:?} vs {:?} diverged", strategy, a.kind(), b.kind());
        ab
    }

    const STRATEGIES: [Strategy; 2] = [Strategy::LastWriteWins, Strategy::OperationalTransform];

    #[test]
    fn test_create_operation_sequences() {
        let mut resolver = ConflictResolver::new(Strategy::LastWriteWins);
        let clock = VectorClock::new(peer("p1"));
        let a = resolver.create_operation(
            NodeId::from("n1"),
            OperationPayload::Delete,
            peer("p1"),
            clock.clone(),
        );
        let b = resolver.create_operation(NodeId::from("n2"), OperationPayload::Delete, peer("p1"), clock);
        assert_eq!(a.sequence, 1);
        assert_eq!(b.sequence, 2);
        assert_eq!(a.origin, peer("p1"));
    }

    #[test]
    fn test_delete_wins_over_earlier_update_any_order() {
        for strategy in STRATEGIES {
            let op_a = update("pa", 10, json!({"title": "edited"}));
            let op_b = delete("pb", 20);
            let state = assert_converges(strategy, true, &op_a, &op_b);
            assert!(!state.contains(&NodeId::from("n1")));
        }
    }

    #[test]
    fn test_transform_invalidates_update_under_later_delete() {
        for strategy in STRATEGIES {
            let resolver = ConflictResolver::new(strategy);
            let op_a = update("pa", 10, json!({"x": 1}));
            let op_b = delete("pb", 20);
            assert_eq!(resolver.transform(&op_a, &[op_b]), None);
        }
    }

    #[test]
    fn test_earlier_delete_still_beats_later_update() {
        for strategy in STRATEGIES {
            let state = assert_converges(
                strategy,
                true,
                &delete("pa", 10),
                &update("pb", 20, json!({"x": 1})),
            );
            assert!(state.is_empty());
        }
    }

    #[test]
    fn test_later_create_beats_earlier_delete() {
        for strategy in STRATEGIES {
            let state = assert_converges(
                strategy,
                true,
                &delete("pa", 10),
                &create("pb", 20, json!({"title": "again"})),
            );
            assert_eq!(state.get(&NodeId::from("n1")).unwrap().data["title"], "again");
        }
    }

    /// Every ordering of three mutually concurrent operations
    fn permutations(ops: &[Operation; 3]) -> Vec<Vec<Operation>> {
        const ORDERS: [[usize; 3]; 6] = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];
        ORDERS
            .iter()
            .map(|order| order.iter().map(|&i| ops[i].clone()).collect())
            .collect()
    }

    fn assert_converges_all(strategy: Strategy, with_base: bool, ops: &[Operation; 3]) -> NodeState {
        let mut states = permutations(ops)
            .into_iter()
            .map(|order| replay(strategy, with_base, &order));
        let first = states.next().unwrap();
        for state in states {
            assert_eq!(state, first, "{:?} diverged", strategy);
        }
        first
    }

    #[test]
    fn test_recreate_after_delete_keeps_both_creates() {
        for strategy in STRATEGIES {
            let ops = [
                create("px", 1, json!({"x": 1})),
                delete("pd", 2),
                create("py", 3, json!({"y": 1})),
            ];
            let state = assert_converges_all(strategy, false, &ops);
            let record = state.get(&NodeId::from("n1")).unwrap();
            assert_eq!(record.data["x"], 1);
            assert_eq!(record.data["y"], 1);
            assert_eq!(record.last_modified.ts, 3);
        }
    }

    #[test]
    fn test_update_survives_delete_when_node_recreated() {
        for strategy in STRATEGIES {
            let ops = [
                update("pu", 1, json!({"u": 1, "shared": "update"})),
                delete("pd", 2),
                create("py", 3, json!({"y": 1, "shared": "create"})),
            ];
            let state = assert_converges_all(strategy, true, &ops);
            let record = state.get(&NodeId::from("n1")).unwrap();
            assert_eq!(record.data["u"], 1);
            assert_eq!(record.data["y"], 1);
            assert_eq!(record.data["shared"], "create");
        }
    }

    #[test]
    fn test_create_folds_older_updates_in_version_order() {
        for strategy in STRATEGIES {
            let ops = [
                update("p1", 1, json!({"x": 1})),
                update("p2", 2, json!({"x": 2})),
                create("p3", 3, json!({"label": "c"})),
            ];
            let state = assert_converges_all(strategy, false, &ops);
            let record = state.get(&NodeId::from("n1")).unwrap();
            assert_eq!(record.data["x"], 2);
            assert_eq!(record.data["label"], "c");
        }
    }

    #[test]
    fn test_delete_without_newer_create_removes_node() {
        for strategy in STRATEGIES {
            let ops = [
                create("px", 1, json!({"x": 1})),
                update("pu", 2, json!({"u": 1})),
                delete("pd", 3),
            ];
            let state = assert_converges_all(strategy, true, &ops);
            assert!(state.is_empty());
        }
    }

    #[test]
    fn test_lww_merges_fields_and_keeps_latest_timestamp() {
        let a = update("pa", 5, json!({"x": 1}));
        let b = update("pb", 7, json!({"y": 2}));
        let state = assert_converges(Strategy::LastWriteWins, true, &a, &b);

        let record = state.get(&NodeId::from("n1")).unwrap();
        assert_eq!(record.data["x"], 1);
        assert_eq!(record.data["y"], 2);
        assert_eq!(record.last_modified.ts, 7);
    }

    #[test]
    fn test_lww_without_prior_node_merges_creates() {
        let a = create("pa", 5, json!({"x": 1}));
        let b = create("pb", 7, json!({"y": 2}));
        let state = assert_converges(Strategy::LastWriteWins, false, &a, &b);

        let record = state.get(&NodeId::from("n1")).unwrap();
        assert_eq!(record.data["x"], 1);
        assert_eq!(record.data["y"], 2);
        assert_eq!(record.last_modified.ts, 7);
    }

    #[test]
    fn test_update_conflicting_field_later_wins() {
        for strategy in STRATEGIES {
            let a = update("pa", 5, json!({"title": "old", "x": 1}));
            let b = update("pb", 7, json!({"title": "new"}));
            let state = assert_converges(strategy, true, &a, &b);
            let record = state.get(&NodeId::from("n1")).unwrap();
            assert_eq!(record.data["title"], "new");
            assert_eq!(record.data["x"], 1);
        }
    }

    #[test]
    fn test_timestamp_tie_broken_by_peer_id() {
        for strategy in STRATEGIES {
            let a = update("alice", 5, json!({"title": "alice"}));
            let b = update("bob", 5, json!({"title": "bob"}));
            let state = assert_converges(strategy, true, &a, &b);
            assert_eq!(state.get(&NodeId::from("n1")).unwrap().data["title"], "bob");
        }
    }

    #[test]
    fn test_move_vs_move_later_wins() {
        for strategy in STRATEGIES {
            let state = assert_converges(strategy, true, &mv("pa", 5, 1.0), &mv("pb", 9, 2.0));
            assert_eq!(
                state.get(&NodeId::from("n1")).unwrap().position,
                Some(Position::new(2.0, 2.0))
            );
        }
    }

    #[test]
    fn test_move_and_update_are_independent() {
        for strategy in STRATEGIES {
            let state = assert_converges(
                strategy,
                true,
                &mv("pa", 9, 3.0),
                &update("pb", 5, json!({"x": 1})),
            );
            let record = state.get(&NodeId::from("n1")).unwrap();
            assert_eq!(record.position, Some(Position::new(3.0, 3.0)));
            assert_eq!(record.data["x"], 1);
        }
    }

    #[test]
    fn test_create_absorbs_concurrent_update() {
        for strategy in STRATEGIES {
            let state = assert_converges(
                strategy,
                false,
                &create("pa", 5, json!({"a": 1})),
                &update("pb", 7, json!({"a": 2, "b": 2})),
            );
            let record = state.get(&NodeId::from("n1")).unwrap();
            assert_eq!(record.data["a"], 2);
            assert_eq!(record.data["b"], 2);
        }
    }

    #[test]
    fn test_ot_keeps_candidate_version() {
        let resolver = ConflictResolver::new(Strategy::OperationalTransform);
        let a = update("pa", 5, json!({"x": 1, "y": 1}));
        let b = update("pb", 7, json!({"y": 2}));
        let resolved = resolver.transform(&a, &[b]).unwrap();
        assert_eq!(resolved.timestamp, 5);
        assert_eq!(
            resolved.payload,
            OperationPayload::Update {
                fields: fields(json!({"x": 1}))
            }
        );
    }

    #[test]
    fn test_lww_restamps_to_latest() {
        let resolver = ConflictResolver::new(Strategy::LastWriteWins);
        let a = update("pa", 5, json!({"x": 1}));
        let b = update("pb", 7, json!({"y": 2}));
        let resolved = resolver.transform(&a, &[b]).unwrap();
        assert_eq!(resolved.timestamp, 7);
        assert_eq!(resolved.origin, peer("pb"));
    }

    #[test]
    fn test_transform_ignores_other_nodes() {
        let resolver = ConflictResolver::new(Strategy::LastWriteWins);
        let a = update("pa", 5, json!({"x": 1}));
        let mut b = delete("pb", 9);
        b.node_id = NodeId::from("other");
        assert_eq!(resolver.transform(&a, &[b]), Some(a));
    }

    #[test]
    fn test_integrate_suppresses_duplicates() {
        let mut resolver = ConflictResolver::new(Strategy::LastWriteWins);
        let mut state = base_state(&mut resolver);
        let op = update("pa", 5, json!({"x": 1}));

        assert!(resolver.integrate(&mut state, op.clone()).unwrap().changed());
        let snapshot = state.clone();
        assert_eq!(
            resolver.integrate(&mut state, op).unwrap(),
            Integration::Duplicate
        );
        assert_eq!(state, snapshot);
    }

    #[test]
    fn test_integrate_reports_invalidated() {
        let mut resolver = ConflictResolver::new(Strategy::OperationalTransform);
        let mut state = base_state(&mut resolver);
        resolver.integrate(&mut state, delete("pb", 20)).unwrap();
        let outcome = resolver.integrate(&mut state, update("pa", 10, json!({"x": 1}))).unwrap();
        assert_eq!(outcome, Integration::Invalidated);
    }

    #[test]
    fn test_causally_ordered_ops_are_not_transformed() {
        let mut resolver = ConflictResolver::new(Strategy::LastWriteWins);
        let mut state = base_state(&mut resolver);

        // pb saw pa's delete before re-creating, so nothing is concurrent
        let del = delete("pa", 20);
        let recreate = Operation::new(
            NodeId::from("n1"),
            OperationPayload::Create {
                data: fields(json!({"title": "fresh"})),
                position: None,
            },
            peer("pb"),
            10,
            1,
            VectorClock::from_entries(
                peer("pb"),
                [(peer("pa"), 1), (peer("pb"), 1), (peer("base"), 1)],
            ),
        );
        resolver.integrate(&mut state, del).unwrap();
        assert!(resolver.tombstone(&NodeId::from("n1")).is_some());
        assert!(resolver.concurrent_with(&recreate).is_empty());
        resolver.integrate(&mut state, recreate).unwrap();
        assert_eq!(state.get(&NodeId::from("n1")).unwrap().data["title"], "fresh");
        assert!(resolver.tombstone(&NodeId::from("n1")).is_none());
    }

    #[test]
    fn test_history_window_is_bounded() {
        let mut resolver = ConflictResolver::with_history_limit(Strategy::LastWriteWins, 2);
        let mut state = base_state(&mut resolver);
        for seq in 1..=5 {
            let op = op_at(
                "pa",
                seq,
                10 + seq,
                OperationPayload::Update {
                    fields: fields(json!({"n": seq})),
                },
            );
            resolver.integrate(&mut state, op).unwrap();
        }
        assert_eq!(resolver.history.get(&NodeId::from("n1")).unwrap().ops.len(), 2);
    }

    #[test]
    fn test_seen_sequences_out_of_order() {
        let mut seen = SeenSequences::default();
        seen.insert(2);
        assert!(!seen.contains(1));
        assert!(seen.contains(2));
        seen.insert(1);
        assert_eq!(seen.watermark, 2);
        assert!(seen.pending.is_empty());
    }

    /// Operation on n1 with an explicit clock
    fn op_with(
        origin: &str,
        seq: u64,
        ts: u64,
        clock: &[(&str, u64)],
        payload: OperationPayload,
    ) -> Operation {
        let clock = VectorClock::from_entries(peer(origin), clock.iter().map(|(p, t)| (peer(p), *t)));
        Operation::new(NodeId::from("n1"), payload, peer(origin), ts, seq, clock)
    }

    fn create_with(origin: &str, seq: u64, ts: u64, clock: &[(&str, u64)], data: Value) -> Operation {
        op_with(
            origin,
            seq,
            ts,
            clock,
            OperationPayload::Create {
                data: fields(data),
                position: None,
            },
        )
    }

    fn clock_of(owner: &str, entries: &[(&str, u64)]) -> VectorClock {
        VectorClock::from_entries(peer(owner), entries.iter().map(|(p, t)| (peer(p), *t)))
    }

    fn outcomes(deliveries: &[Delivery]) -> Vec<Integration> {
        deliveries.iter().map(|d| d.outcome.clone()).collect()
    }

    #[test]
    fn test_deliver_holds_update_until_its_create_arrives() {
        let x = create_with("P1", 1, 10, &[("P1", 1)], json!({"t": "a"}));
        let y = op_with(
            "P2",
            1,
            20,
            &[("P1", 1), ("P2", 1)],
            OperationPayload::Update {
                fields: fields(json!({"t": "b"})),
            },
        );

        for strategy in STRATEGIES {
            let mut resolver = ConflictResolver::new(strategy);
            let mut state = NodeState::new();

            let first = resolver.deliver(&mut state, y.clone()).unwrap();
            assert_eq!(outcomes(&first), vec![Integration::Deferred]);
            assert_eq!(resolver.pending_len(), 1);
            assert!(state.is_empty());

            let second = resolver.deliver(&mut state, x.clone()).unwrap();
            assert_eq!(second.len(), 2);
            assert_eq!(second[0].op, x);
            assert_eq!(second[1].op, y);
            assert!(second.iter().all(|d| d.outcome.changed()));
            assert_eq!(resolver.pending_len(), 0);

            assert_eq!(state, replay(strategy, false, &[x.clone(), y.clone()]));
            assert_eq!(state.get(&NodeId::from("n1")).unwrap().data["t"], "b");
        }
    }

    #[test]
    fn test_deliver_holds_delete_until_its_create_arrives() {
        let x = create_with("P1", 1, 10, &[("P1", 1)], json!({"t": "a"}));
        let d = op_with("P2", 1, 5, &[("P1", 1), ("P2", 1)], OperationPayload::Delete);

        for strategy in STRATEGIES {
            let mut resolver = ConflictResolver::new(strategy);
            let mut state = NodeState::new();
            resolver.deliver(&mut state, d.clone()).unwrap();
            resolver.deliver(&mut state, x.clone()).unwrap();

            assert!(state.is_empty(), "{:?} resurrected the node", strategy);
            assert!(resolver.tombstone(&NodeId::from("n1")).is_some());
        }
    }

    #[test]
    fn test_deliver_waits_for_missing_sequence() {
        let mut resolver = ConflictResolver::new(Strategy::LastWriteWins);
        let mut state = NodeState::new();
        let first = create_with("P1", 1, 10, &[("P1", 1)], json!({"v": 1}));
        let second = op_with(
            "P1",
            2,
            11,
            &[("P1", 2)],
            OperationPayload::Update {
                fields: fields(json!({"v": 2})),
            },
        );

        let held = resolver.deliver(&mut state, second.clone()).unwrap();
        assert_eq!(outcomes(&held), vec![Integration::Deferred]);
        // a redelivered held op is not queued twice
        resolver.deliver(&mut state, second.clone()).unwrap();
        assert_eq!(resolver.pending_len(), 1);

        resolver.deliver(&mut state, first).unwrap();
        assert_eq!(state.get(&NodeId::from("n1")).unwrap().data["v"], 2);
        assert_eq!(resolver.delivered(&peer("P1")), 2);
        assert_eq!(
            outcomes(&resolver.deliver(&mut state, second).unwrap()),
            vec![Integration::Duplicate]
        );
    }

    #[test]
    fn test_pending_limit_drops_oldest() {
        let mut resolver = ConflictResolver::new(Strategy::LastWriteWins).with_pending_limit(2);
        let mut state = NodeState::new();
        for seq in 2..=4 {
            let op = op_with("P1", seq, seq, &[("P1", seq)], OperationPayload::Delete);
            resolver.deliver(&mut state, op).unwrap();
        }
        assert_eq!(resolver.pending_len(), 2);
        assert!(resolver.pending.iter().all(|op| op.sequence > 2));
    }

    #[test]
    fn test_invalidated_delete_leaves_no_tombstone() {
        let mut resolver = ConflictResolver::new(Strategy::LastWriteWins);
        let mut state = NodeState::new();
        let newer_create = create_with("pb", 1, 30, &[("pb", 1)], json!({"t": "b"}));
        let older_delete = op_with("pa", 1, 20, &[("pa", 1)], OperationPayload::Delete);

        resolver.integrate(&mut state, newer_create.clone()).unwrap();
        assert_eq!(
            resolver.integrate(&mut state, older_delete.clone()).unwrap(),
            Integration::Invalidated
        );
        assert!(resolver.tombstone(&NodeId::from("n1")).is_none());

        // same pair in the other order: the create revives the node
        let mut resolver = ConflictResolver::new(Strategy::LastWriteWins);
        let mut state = NodeState::new();
        resolver.integrate(&mut state, older_delete).unwrap();
        resolver.integrate(&mut state, newer_create).unwrap();
        assert!(resolver.tombstone(&NodeId::from("n1")).is_none());
        assert!(state.contains(&NodeId::from("n1")));
    }

    #[test]
    fn test_snapshot_refuses_record_sender_never_saw_deleted() {
        let mut resolver = ConflictResolver::new(Strategy::LastWriteWins);
        let mut state = NodeState::new();
        resolver
            .integrate(&mut state, create_with("P1", 1, 10, &[("P1", 1)], json!({"t": "a"})))
            .unwrap();
        resolver
            .integrate(&mut state, op_with("P1", 2, 20, &[("P1", 2)], OperationPayload::Delete))
            .unwrap();

        // P2 only saw the create, then edited under a later wall clock
        let mut remote = NodeState::new();
        remote.insert(
            NodeId::from("n1"),
            NodeRecord::new(fields(json!({"t": "b"})), None, Version::new(50, peer("P2"), 1)),
        );
        let snapshot = StateSnapshot {
            nodes: remote,
            tombstones: BTreeMap::new(),
        };
        let changed =
            resolver.adopt_snapshot(&mut state, &snapshot, &clock_of("P2", &[("P1", 1), ("P2", 1)]));
        assert!(changed.is_empty());
        assert!(state.is_empty());
        assert_eq!(resolver.delivered(&peer("P2")), 1);
    }

    #[test]
    fn test_snapshot_tombstone_removes_unseen_node() {
        let mut resolver = ConflictResolver::new(Strategy::OperationalTransform);
        let mut state = NodeState::new();
        resolver
            .integrate(&mut state, create_with("P1", 1, 10, &[("P1", 1)], json!({"t": "a"})))
            .unwrap();

        let tombstone = Tombstone {
            version: Version::new(20, peer("P1"), 2),
            vector_clock: clock_of("P1", &[("P1", 2)]),
        };
        let snapshot = StateSnapshot {
            nodes: NodeState::new(),
            tombstones: BTreeMap::from([(NodeId::from("n1"), tombstone.clone())]),
        };
        let changed = resolver.adopt_snapshot(&mut state, &snapshot, &clock_of("P1", &[("P1", 2)]));
        assert_eq!(changed, vec![NodeId::from("n1")]);
        assert!(state.is_empty());
        assert_eq!(resolver.tombstone(&NodeId::from("n1")), Some(&tombstone));

        // the delete itself arriving later is already covered
        let late = op_with("P1", 2, 20, &[("P1", 2)], OperationPayload::Delete);
        assert_eq!(
            outcomes(&resolver.deliver(&mut state, late).unwrap()),
            vec![Integration::Duplicate]
        );
    }

    #[test]
    fn test_snapshot_keeps_node_recreated_after_delete() {
        let mut resolver = ConflictResolver::new(Strategy::LastWriteWins);
        let mut state = NodeState::new();
        resolver
            .integrate(&mut state, create_with("P1", 1, 10, &[("P1", 1)], json!({"t": "a"})))
            .unwrap();
        resolver
            .integrate(&mut state, op_with("P1", 2, 20, &[("P1", 2)], OperationPayload::Delete))
            .unwrap();

        // P2 saw the delete and created the node again
        let mut remote = NodeState::new();
        remote.insert(
            NodeId::from("n1"),
            NodeRecord::new(fields(json!({"t": "again"})), None, Version::new(30, peer("P2"), 1)),
        );
        let snapshot = StateSnapshot {
            nodes: remote,
            tombstones: BTreeMap::new(),
        };
        let changed =
            resolver.adopt_snapshot(&mut state, &snapshot, &clock_of("P2", &[("P1", 2), ("P2", 1)]));
        assert_eq!(changed, vec![NodeId::from("n1")]);
        assert_eq!(state.get(&NodeId::from("n1")).unwrap().data["t"], "again");
    }

    #[test]
    fn test_snapshot_clock_releases_deferred_ops() {
        let mut resolver = ConflictResolver::new(Strategy::LastWriteWins);
        let mut state = NodeState::new();
        let late = op_with(
            "P2",
            1,
            40,
            &[("P1", 3), ("P2", 1)],
            OperationPayload::Update {
                fields: fields(json!({"t": "late"})),
            },
        );
        resolver.deliver(&mut state, late).unwrap();
        assert_eq!(resolver.pending_len(), 1);

        let mut remote = NodeState::new();
        remote.insert(
            NodeId::from("n1"),
            NodeRecord::new(fields(json!({"t": "p1"})), None, Version::new(30, peer("P1"), 3)),
        );
        let snapshot = StateSnapshot {
            nodes: remote,
            tombstones: BTreeMap::new(),
        };
        resolver.adopt_snapshot(&mut state, &snapshot, &clock_of("P1", &[("P1", 3)]));
        let released = resolver.drain(&mut state).unwrap();
        assert_eq!(released.len(), 1);
        assert!(released[0].outcome.changed());
        assert_eq!(state.get(&NodeId::from("n1")).unwrap().data["t"], "late");
    }

    #[test]
    fn test_history_evicts_least_recently_touched_node() {
        let mut resolver = ConflictResolver::new(Strategy::LastWriteWins).with_node_limit(2);
        let mut state = NodeState::new();
        for (seq, node) in ["n1", "n2", "n1", "n3"].iter().enumerate() {
            let seq = seq as u64 + 1;
            let op = Operation::new(
                NodeId::from(*node),
                OperationPayload::Delete,
                peer("pa"),
                seq,
                seq,
                clock_of("pa", &[("pa", seq)]),
            );
            resolver.integrate(&mut state, op).unwrap();
        }
        assert_eq!(resolver.tracked_nodes(), 2);
        assert!(resolver.history.contains_key(&NodeId::from("n1")));
        assert!(resolver.history.contains_key(&NodeId::from("n3")));
        assert!(!resolver.history.contains_key(&NodeId::from("n2")));
        assert_eq!(resolver.recency.len(), 2);
    }

    #[test]
    fn test_seen_sequences_advance_absorbs_stragglers() {
        let mut seen = SeenSequences::default();
        seen.insert(3);
        seen.insert(6);
        seen.advance_to(4);
        assert_eq!(seen.watermark, 4);
        assert!(seen.contains(6));
        seen.insert(5);
        assert_eq!(seen.watermark, 6);
        assert!(seen.pending.is_empty());
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!(Strategy::parse("lww"), Some(Strategy::LastWriteWins));
        assert_eq!(
            Strategy::parse("operational_transform"),
            Some(Strategy::OperationalTransform)
        );
        assert_eq!(Strategy::parse("nope"), None);
        assert_eq!(Strategy::default().as_str(), "last_write_wins");
    }
}
