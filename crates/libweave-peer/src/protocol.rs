//! Per-peer sync protocol
//!
//! Owns one peer's clock, node state, bridge, presence and channels, and
//! routes inbound frames by type:
//! - `node-update`: integrate the operation once its causal past is here,
//!   merging its clock only then
//! - `presence-update`: store the sender's own entry (no clock involvement)
//! - `full-state-sync`: merge clock, adopt missing or newer nodes, apply
//!   tombstones, release operations the snapshot unblocked
//!
//! Nothing here blocks; sends only enqueue on channels.

use std::sync::Arc;

use libweave_core::automaton::{CausalAutomaton, CausalSink};
use libweave_core::bridge::{BridgeOutcome, PositionalView, RepresentationBridge};
use libweave_core::resolver::{ConflictResolver, Delivery, Integration, Strategy};
use libweave_core::time::current_time_ms;
use libweave_core::{
    NodeId, NodeState, OperationPayload, PeerId, Position, PresenceTracker, StateSnapshot,
    SyncConfig, SyncError, VectorClock,
};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::channel::{ChannelState, InboundFrame, PeerChannel};
use crate::error::PeerError;
use crate::messages::{Payload, SyncMessage};
use crate::notifications::{CanvasListener, NullListener};
use crate::registry::ChannelRegistry;

/// What an inbound frame did
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Operation(Integration),
    Presence { peer_id: PeerId, stored: bool },
    Snapshot { adopted: Vec<NodeId> },
}

pub struct PeerSyncProtocol {
    peer_id: PeerId,
    automaton: CausalAutomaton,
    resolver: ConflictResolver,
    state: NodeState,
    bridge: Arc<RepresentationBridge>,
    presence: PresenceTracker,
    registry: ChannelRegistry,
    listener: Box<dyn CanvasListener>,
    clock_retention_ms: Option<u64>,
}

impl std::fmt::Debug for PeerSyncProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSyncProtocol")
            .field("peer_id", &self.peer_id)
            .field("nodes", &self.state.len())
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl PeerSyncProtocol {
    pub fn new(peer_id: PeerId, config: &SyncConfig) -> Self {
        let mut automaton = CausalAutomaton::new(peer_id.clone());
        automaton.start();

        Self {
            automaton,
            resolver: ConflictResolver::with_history_limit(config.strategy, config.history_limit)
                .with_node_limit(config.history_node_limit),
            state: NodeState::new(),
            bridge: Arc::new(RepresentationBridge::new()),
            presence: PresenceTracker::new(peer_id.clone(), config.presence.timeout_ms),
            registry: ChannelRegistry::new(),
            listener: Box::new(NullListener),
            clock_retention_ms: config.clock_retention_ms,
            peer_id,
        }
    }

    pub fn with_sink(mut self, sink: impl CausalSink + 'static) -> Self {
        self.automaton = self.automaton.with_sink(sink);
        self
    }

    pub fn with_listener(mut self, listener: impl CanvasListener + 'static) -> Self {
        self.listener = Box::new(listener);
        self
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn state(&self) -> &NodeState {
        &self.state
    }

    pub fn vector_clock(&self) -> &VectorClock {
        self.automaton.vector_clock()
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn bridge(&self) -> &Arc<RepresentationBridge> {
        &self.bridge
    }

    pub fn strategy(&self) -> Strategy {
        self.resolver.strategy()
    }

    /// Operations held back until their causal past arrives
    pub fn pending_operations(&self) -> usize {
        self.resolver.pending_len()
    }

    /// Node map and tombstones as sent to a newly opened channel
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            nodes: self.state.clone(),
            tombstones: self.resolver.tombstones().clone(),
        }
    }

    pub fn channel_state(&self, peer_id: &PeerId) -> ChannelState {
        self.registry.state(peer_id)
    }

    pub fn open_peers(&self) -> Vec<PeerId> {
        self.registry.open_peers()
    }

    // --- Channels ---

    pub fn connect(&mut self, channel: Box<dyn PeerChannel>) -> ChannelState {
        let remote = channel.remote().clone();
        let state = self.registry.connect(channel);
        debug!(peer = %self.peer_id, remote = %remote, "channel connecting");
        state
    }

    /// Open the channel and send the new peer our state and presence
    pub fn mark_open(&mut self, remote: &PeerId) -> Result<(), PeerError> {
        self.registry.mark_open(remote)?;
        info!(peer = %self.peer_id, remote = %remote, "channel open");

        let snapshot = SyncMessage::full_state_sync(&self.snapshot())?;
        if let Err(e) = self.send(remote, snapshot) {
            warn!(peer = %self.peer_id, remote = %remote, error = %e, "failed to send state snapshot");
        }
        let presence = SyncMessage::presence_update(self.presence.local())?;
        if let Err(e) = self.send(remote, presence) {
            warn!(peer = %self.peer_id, remote = %remote, error = %e, "failed to send presence");
        }
        Ok(())
    }

    /// Close the channel, evict the peer's presence and tell the listener
    pub fn disconnect(&mut self, remote: &PeerId) -> bool {
        let existed = self.registry.close(remote);
        self.presence.remove(remote);
        self.listener.on_presence_update(remote, None);
        info!(peer = %self.peer_id, remote = %remote, existed, "channel closed");
        existed
    }

    // --- Outbound ---

    /// Stamp and send to every open channel; returns how many accepted it
    pub fn broadcast(&mut self, mut message: SyncMessage) -> usize {
        self.stamp(None, &mut message);
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(peer = %self.peer_id, error = %e, "failed to encode frame");
                return 0;
            }
        };

        let open = self.registry.open_peers().len();
        let failures = self.registry.broadcast(&frame);
        for (remote, e) in &failures {
            warn!(
                peer = %self.peer_id,
                remote = %remote,
                kind = message.message_type.as_str(),
                error = %e,
                "dropping frame"
            );
        }
        open - failures.len()
    }

    /// Stamp and send to one open channel
    pub fn send(&mut self, remote: &PeerId, mut message: SyncMessage) -> Result<(), PeerError> {
        self.stamp(Some(remote), &mut message);
        let frame = message.encode()?;
        self.registry.send_to(remote, frame)
    }

    fn stamp(&mut self, to: Option<&PeerId>, message: &mut SyncMessage) {
        if message.message_type.is_causal() {
            self.automaton.send(to, message);
        } else {
            message.stamp_plain(self.peer_id.clone(), current_time_ms());
        }
    }

    // --- Edits ---

    /// Tick, integrate a local edit, and broadcast it
    pub fn local_edit(
        &mut self,
        node_id: NodeId,
        payload: OperationPayload,
    ) -> Result<Integration, PeerError> {
        if node_id.is_empty() {
            return Err(SyncError::InvalidOperation("local edit has no node id".into()).into());
        }

        self.automaton.tick("local-edit");
        let op = self.resolver.create_operation(
            node_id,
            payload,
            self.peer_id.clone(),
            self.automaton.snapshot(),
        );
        let outcome = self.resolver.integrate(&mut self.state, op.clone())?;
        self.after_integration(&op.node_id, &outcome);

        let message = SyncMessage::node_update(&op)?;
        self.broadcast(message);
        Ok(outcome)
    }

    // --- Inbound ---

    /// Route one inbound frame. Bad frames are logged and dropped.
    pub fn handle_frame(&mut self, inbound: &InboundFrame) -> Option<Inbound> {
        match self.try_handle(&inbound.from, &inbound.frame) {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!(
                    peer = %self.peer_id,
                    from = %inbound.from,
                    code = e.error_code(),
                    error = %e,
                    "dropping inbound frame"
                );
                None
            }
        }
    }

    fn try_handle(&mut self, from: &PeerId, frame: &str) -> Result<Inbound, PeerError> {
        let message = SyncMessage::decode(frame)?;
        let payload = message.payload()?;
        let now = current_time_ms();

        match payload {
            Payload::NodeUpdate(op) => {
                op.validate()?;
                let deliveries = self.resolver.deliver(&mut self.state, op)?;
                let outcome = deliveries
                    .first()
                    .map_or(Integration::Duplicate, |d| d.outcome.clone());
                if matches!(outcome, Integration::Deferred) {
                    self.automaton.observe(from, None, now);
                }
                self.after_delivery(deliveries, now);
                Ok(Inbound::Operation(outcome))
            }

            Payload::PresenceUpdate(entry) => {
                if entry.peer_id != *from {
                    return Err(PeerError::Malformed(format!(
                        "presence for {} sent by {}",
                        entry.peer_id, from
                    )));
                }
                let peer_id = entry.peer_id.clone();
                let stored = self.presence.apply_remote(entry, now);
                if stored {
                    self.listener
                        .on_presence_update(&peer_id, self.presence.get(&peer_id));
                }
                Ok(Inbound::Presence { peer_id, stored })
            }

            Payload::FullStateSync(snapshot) => {
                self.automaton.receive_at(from, &message, now);
                let clock = message
                    .vector_clock
                    .clone()
                    .unwrap_or_else(|| VectorClock::new(from.clone()));
                let adopted = self
                    .resolver
                    .adopt_snapshot(&mut self.state, &snapshot, &clock);
                for node_id in &adopted {
                    self.sync_bridge(node_id);
                    self.listener.on_node_update(node_id, self.state.get(node_id));
                }

                let released = self.resolver.drain(&mut self.state)?;
                debug!(
                    peer = %self.peer_id,
                    from = %from,
                    adopted = adopted.len(),
                    released = released.len(),
                    "adopted snapshot"
                );
                self.after_delivery(released, now);
                Ok(Inbound::Snapshot { adopted })
            }
        }
    }

    /// Merge the clock of every integrated operation, then propagate changes
    fn after_delivery(&mut self, deliveries: Vec<Delivery>, now: u64) {
        for delivery in deliveries {
            if matches!(delivery.outcome, Integration::Deferred) {
                continue;
            }
            self.automaton
                .observe(&delivery.op.origin, Some(&delivery.op.vector_clock), now);
            self.after_integration(&delivery.op.node_id, &delivery.outcome);
        }
    }

    fn after_integration(&mut self, node_id: &NodeId, outcome: &Integration) {
        if !outcome.changed() {
            return;
        }
        self.sync_bridge(node_id);
        self.listener.on_node_update(node_id, self.state.get(node_id));
    }

    /// Push the node's current record through the bridge
    fn sync_bridge(&self, node_id: &NodeId) {
        let Some(record) = self.state.get(node_id) else {
            self.bridge.remove(node_id);
            return;
        };

        let content = Value::Object(record.data.clone());
        match self.bridge.update_from_content(node_id, content) {
            Ok(BridgeOutcome::Synced(entry)) => {
                let Some(view) = entry.positional_view else {
                    return;
                };
                if view.position != record.position {
                    self.bridge
                        .update_from_position(node_id, PositionalView::new(view.hash, record.position));
                }
            }
            Ok(BridgeOutcome::Dropped) => {
                debug!(peer = %self.peer_id, node = %node_id, "bridge busy, update dropped");
            }
            Err(e) => {
                warn!(peer = %self.peer_id, node = %node_id, error = %e, "bridge update failed");
            }
        }
    }

    // --- Presence ---

    pub fn set_local_presence(
        &mut self,
        cursor: Option<Position>,
        selection: Vec<NodeId>,
        active_editor: Option<String>,
    ) {
        self.presence
            .set_local(cursor, selection, active_editor, current_time_ms());
    }

    pub fn broadcast_presence(&mut self) -> usize {
        match SyncMessage::presence_update(self.presence.local()) {
            Ok(message) => self.broadcast(message),
            Err(e) => {
                warn!(peer = %self.peer_id, error = %e, "failed to encode presence");
                0
            }
        }
    }

    /// Evict stale presences and, if configured, prune silent clock entries
    pub fn maintain(&mut self, now_ms: u64) -> Vec<PeerId> {
        let evicted = self.presence.sweep(now_ms);
        for peer_id in &evicted {
            self.listener.on_presence_update(peer_id, None);
        }
        if let Some(retention_ms) = self.clock_retention_ms {
            self.automaton.prune_absent(now_ms, retention_ms);
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MpscChannel;
    use crate::notifications::{Notification, NotificationListener};
    use libweave_core::automaton::MemorySink;
    use libweave_core::PresenceEntry;
    use serde_json::json;
    use tokio::sync::mpsc;

    struct Peer {
        protocol: PeerSyncProtocol,
        inbox: mpsc::Receiver<InboundFrame>,
        inbox_tx: mpsc::Sender<InboundFrame>,
    }

    fn peer(id: &str) -> Peer {
        let (inbox_tx, inbox) = mpsc::channel(64);
        Peer {
            protocol: PeerSyncProtocol::new(PeerId::from(id), &SyncConfig::default()),
            inbox,
            inbox_tx,
        }
    }

    /// One-way open channel from `a` to `b`
    fn link(a: &mut Peer, b: &Peer) {
        let channel = MpscChannel::new(
            a.protocol.peer_id().clone(),
            b.protocol.peer_id().clone(),
            b.inbox_tx.clone(),
        );
        a.protocol.connect(Box::new(channel));
        a.protocol.mark_open(b.protocol.peer_id()).unwrap();
    }

    fn drain(p: &mut Peer) -> Vec<Option<Inbound>> {
        let mut out = Vec::new();
        while let Ok(frame) = p.inbox.try_recv() {
            out.push(p.protocol.handle_frame(&frame));
        }
        out
    }

    fn fields(v: Value) -> libweave_core::NodeData {
        match v {
            Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_open_sends_snapshot_and_presence() {
        let mut a = peer("a");
        let mut b = peer("b");
        a.protocol
            .local_edit(
                NodeId::from("n1"),
                OperationPayload::Create {
                    data: fields(json!({"text": "hi"})),
                    position: None,
                },
            )
            .unwrap();

        link(&mut a, &b);
        let outcomes = drain(&mut b);
        assert_eq!(outcomes.len(), 2);
        assert_eq!(
            outcomes[0],
            Some(Inbound::Snapshot {
                adopted: vec![NodeId::from("n1")]
            })
        );
        assert_eq!(b.protocol.state(), a.protocol.state());
        assert!(b.protocol.presence().get(&PeerId::from("a")).is_some());
    }

    #[test]
    fn test_local_edit_broadcasts_and_remote_applies() {
        let mut a = peer("a");
        let mut b = peer("b");
        link(&mut a, &b);
        drain(&mut b);

        a.protocol
            .local_edit(
                NodeId::from("n1"),
                OperationPayload::Create {
                    data: fields(json!({"text": "hi"})),
                    position: Some(Position::new(1.0, 2.0)),
                },
            )
            .unwrap();
        let outcomes = drain(&mut b);
        assert!(matches!(
            outcomes[0],
            Some(Inbound::Operation(Integration::Applied { changed: true, .. }))
        ));

        let record = b.protocol.state().get(&NodeId::from("n1")).unwrap();
        assert_eq!(record.data["text"], "hi");
        // Receiver merged the sender's clock
        assert_eq!(b.protocol.vector_clock().get(&PeerId::from("a")), 1);

        let entry = b.protocol.bridge().entry(&NodeId::from("n1")).unwrap();
        assert_eq!(
            entry.positional_view.unwrap().position,
            Some(Position::new(1.0, 2.0))
        );
    }

    #[test]
    fn test_listener_sees_applied_changes_only() {
        let (listener, mut rx) = NotificationListener::channel(16);
        let mut a = peer("a");
        a.protocol = a.protocol.with_listener(listener);

        a.protocol
            .local_edit(
                NodeId::from("ghost"),
                OperationPayload::Update {
                    fields: fields(json!({"x": 1})),
                },
            )
            .unwrap();
        assert!(rx.try_recv().is_err());

        a.protocol
            .local_edit(NodeId::from("n1"), OperationPayload::Create {
                data: fields(json!({})),
                position: None,
            })
            .unwrap();
        assert!(matches!(
            rx.try_recv().unwrap(),
            Notification::NodeUpdated { record: Some(_), .. }
        ));

        a.protocol.local_edit(NodeId::from("n1"), OperationPayload::Delete).unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            Notification::NodeUpdated {
                node_id: NodeId::from("n1"),
                record: None
            }
        );
        assert!(a.protocol.bridge().entry(&NodeId::from("n1")).is_none());
    }

    #[test]
    fn test_malformed_frames_are_dropped() {
        let mut a = peer("a");
        let from = PeerId::from("b");
        let frames = [
            "not json".to_string(),
            r#"{"type":"node-update","data":{"bogus":true},"peerId":"b","timestamp":1}"#.to_string(),
            r#"{"type":"warp","data":{},"peerId":"b","timestamp":1}"#.to_string(),
        ];
        for frame in frames {
            let inbound = InboundFrame {
                from: from.clone(),
                frame,
            };
            assert!(a.protocol.handle_frame(&inbound).is_none());
        }
        assert!(a.protocol.state().is_empty());
        assert_eq!(a.protocol.vector_clock().get(&from), 0);
    }

    #[test]
    fn test_operation_without_node_id_is_rejected() {
        let mut a = peer("a");
        assert!(matches!(
            a.protocol.local_edit(NodeId::from(""), OperationPayload::Delete),
            Err(PeerError::Sync(SyncError::InvalidOperation(_)))
        ));
        assert_eq!(a.protocol.vector_clock().get(&PeerId::from("a")), 0);
    }

    #[test]
    fn test_redelivered_operation_is_duplicate() {
        let mut a = peer("a");
        let mut b = peer("b");
        link(&mut a, &b);
        drain(&mut b);

        a.protocol
            .local_edit(NodeId::from("n1"), OperationPayload::Create {
                data: fields(json!({"v": 1})),
                position: None,
            })
            .unwrap();
        let frame = b.inbox.try_recv().unwrap();
        b.protocol.handle_frame(&frame);
        assert_eq!(
            b.protocol.handle_frame(&frame),
            Some(Inbound::Operation(Integration::Duplicate))
        );
    }

    #[test]
    fn test_disconnect_evicts_presence() {
        let (listener, mut rx) = NotificationListener::channel(16);
        let mut a = peer("a");
        a.protocol = a.protocol.with_listener(listener);

        let entry = PresenceEntry::new(PeerId::from("b"), 0);
        let mut msg = SyncMessage::presence_update(&entry).unwrap();
        msg.stamp_plain(PeerId::from("b"), 0);
        a.protocol.handle_frame(&InboundFrame {
            from: PeerId::from("b"),
            frame: msg.encode().unwrap(),
        });
        assert!(rx.try_recv().is_ok());

        a.protocol.disconnect(&PeerId::from("b"));
        assert!(a.protocol.presence().get(&PeerId::from("b")).is_none());
        assert_eq!(
            rx.try_recv().unwrap(),
            Notification::PresenceUpdated {
                peer_id: PeerId::from("b"),
                presence: None
            }
        );
    }

    #[test]
    fn test_presence_for_another_peer_is_rejected() {
        let mut a = peer("a");
        let entry = PresenceEntry::new(PeerId::from("c"), 0);
        let mut msg = SyncMessage::presence_update(&entry).unwrap();
        msg.stamp_plain(PeerId::from("b"), 0);

        let outcome = a.protocol.handle_frame(&InboundFrame {
            from: PeerId::from("b"),
            frame: msg.encode().unwrap(),
        });
        assert!(outcome.is_none());
        assert!(a.protocol.presence().get(&PeerId::from("c")).is_none());
        assert!(a.protocol.presence().get(&PeerId::from("b")).is_none());
    }

    #[test]
    fn test_operation_waits_for_its_causal_past() {
        let mut a = peer("a");
        let mut b = peer("b");
        let mut c = peer("c");
        link(&mut a, &b);
        link(&mut a, &c);
        link(&mut b, &c);
        drain(&mut b);
        drain(&mut c);

        a.protocol
            .local_edit(NodeId::from("n1"), OperationPayload::Create {
                data: fields(json!({"t": "a"})),
                position: None,
            })
            .unwrap();
        drain(&mut b);
        b.protocol
            .local_edit(NodeId::from("n1"), OperationPayload::Update {
                fields: fields(json!({"t": "b"})),
            })
            .unwrap();

        // c sees b's update before a's create
        let mut frames = Vec::new();
        while let Ok(frame) = c.inbox.try_recv() {
            frames.push(frame);
        }
        assert_eq!(frames.len(), 2);
        frames.reverse();

        assert_eq!(
            c.protocol.handle_frame(&frames[0]),
            Some(Inbound::Operation(Integration::Deferred))
        );
        assert_eq!(c.protocol.pending_operations(), 1);
        assert!(c.protocol.state().is_empty());
        assert_eq!(c.protocol.vector_clock().get(&PeerId::from("b")), 0);

        assert!(matches!(
            c.protocol.handle_frame(&frames[1]),
            Some(Inbound::Operation(Integration::Applied { changed: true, .. }))
        ));
        assert_eq!(c.protocol.pending_operations(), 0);
        assert_eq!(c.protocol.state(), b.protocol.state());
        assert_eq!(c.protocol.state().get(&NodeId::from("n1")).unwrap().data["t"], "b");
        assert_eq!(c.protocol.vector_clock().get(&PeerId::from("b")), 1);
    }

    #[test]
    fn test_snapshot_tombstone_removes_stale_node() {
        let mut a = peer("a");
        let mut b = peer("b");
        link(&mut a, &b);
        drain(&mut b);
        a.protocol
            .local_edit(NodeId::from("n1"), OperationPayload::Create {
                data: fields(json!({"t": "a"})),
                position: None,
            })
            .unwrap();
        drain(&mut b);
        assert!(b.protocol.state().contains(&NodeId::from("n1")));

        // b misses the delete
        a.protocol.disconnect(&PeerId::from("b"));
        a.protocol.local_edit(NodeId::from("n1"), OperationPayload::Delete).unwrap();
        assert!(drain(&mut b).is_empty());

        link(&mut a, &b);
        let outcomes = drain(&mut b);
        assert_eq!(
            outcomes[0],
            Some(Inbound::Snapshot {
                adopted: vec![NodeId::from("n1")]
            })
        );
        assert!(b.protocol.state().is_empty());
        assert!(b.protocol.bridge().entry(&NodeId::from("n1")).is_none());
    }

    #[test]
    fn test_maintain_sweeps_presence() {
        let mut a = peer("a");
        let mut b = peer("b");
        link(&mut b, &a);
        drain(&mut a);
        assert!(a.protocol.presence().get(&PeerId::from("b")).is_some());

        let later = current_time_ms() + SyncConfig::default().presence.timeout_ms + 1_000;
        assert_eq!(a.protocol.maintain(later), vec![PeerId::from("b")]);
        assert!(a.protocol.presence().get_all_presences().is_empty());
    }

    #[test]
    fn test_sink_records_send_and_receive() {
        let sink = MemorySink::new();
        let mut a = peer("a");
        let mut b = peer("b");
        b.protocol = b.protocol.with_sink(sink.clone());
        link(&mut a, &b);
        drain(&mut b);

        assert_eq!(sink.facts_with("receive-event").len(), 1);
        link(&mut b, &a);
        assert_eq!(sink.facts_with("send-event").len(), 1);
    }

    #[test]
    fn test_broadcast_skips_connecting_channels() {
        let mut a = peer("a");
        let mut b = peer("b");
        let channel = MpscChannel::new(PeerId::from("a"), PeerId::from("b"), b.inbox_tx.clone());
        a.protocol.connect(Box::new(channel));
        assert_eq!(a.protocol.channel_state(&PeerId::from("b")), ChannelState::Connecting);

        assert_eq!(a.protocol.broadcast_presence(), 0);
        assert!(drain(&mut b).is_empty());
    }

    #[test]
    fn test_strategy_from_config() {
        let config = SyncConfig {
            strategy: Strategy::OperationalTransform,
            ..SyncConfig::default()
        };
        let protocol = PeerSyncProtocol::new(PeerId::from("a"), &config);
        assert_eq!(protocol.strategy(), Strategy::OperationalTransform);
        assert!(protocol.open_peers().is_empty());
    }
}
