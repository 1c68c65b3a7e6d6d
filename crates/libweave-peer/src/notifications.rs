//! Canvas-facing callbacks and notifications
//!
//! Listeners are invoked only after a change has been applied locally.

use libweave_core::{NodeId, NodeRecord, PeerId, PresenceEntry};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;

/// Rendering side of a peer
pub trait CanvasListener: Send {
    /// `None` means the node was deleted
    fn on_node_update(&mut self, node_id: &NodeId, record: Option<&NodeRecord>);

    /// `None` means the peer's presence was evicted
    fn on_presence_update(&mut self, peer_id: &PeerId, presence: Option<&PresenceEntry>);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullListener;

impl CanvasListener for NullListener {
    fn on_node_update(&mut self, _node_id: &NodeId, _record: Option<&NodeRecord>) {}
    fn on_presence_update(&mut self, _peer_id: &PeerId, _presence: Option<&PresenceEntry>) {}
}

/// Notifications emitted by a peer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    NodeUpdated {
        node_id: NodeId,
        record: Option<NodeRecord>,
    },
    PresenceUpdated {
        peer_id: PeerId,
        presence: Option<PresenceEntry>,
    },
}

impl Notification {
    /// Notification type as a string (for filtering)
    pub fn notification_type(&self) -> &'static str {
        match self {
            Notification::NodeUpdated { .. } => "NodeUpdated",
            Notification::PresenceUpdated { .. } => "PresenceUpdated",
        }
    }
}

/// Forwards listener callbacks as notifications over a tokio channel
#[derive(Debug, Clone)]
pub struct NotificationListener {
    tx: mpsc::Sender<Notification>,
}

impl NotificationListener {
    pub fn new(tx: mpsc::Sender<Notification>) -> Self {
        Self { tx }
    }

    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    fn forward(&self, notification: Notification) {
        if let Err(e) = self.tx.try_send(notification) {
            warn!(error = %e, "dropping notification");
        }
    }
}

impl CanvasListener for NotificationListener {
    fn on_node_update(&mut self, node_id: &NodeId, record: Option<&NodeRecord>) {
        self.forward(Notification::NodeUpdated {
            node_id: node_id.clone(),
            record: record.cloned(),
        });
    }

    fn on_presence_update(&mut self, peer_id: &PeerId, presence: Option<&PresenceEntry>) {
        self.forward(Notification::PresenceUpdated {
            peer_id: peer_id.clone(),
            presence: presence.cloned(),
        });
    }
}
