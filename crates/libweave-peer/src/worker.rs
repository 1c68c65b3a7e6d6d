//! Worker module - single writer for one peer
//!
//! Each worker owns its PeerSyncProtocol exclusively. Commands and inbound
//! frames are handled one at a time from tokio queues; presence broadcast and
//! expiry run on an interval inside the same loop.

use std::time::Duration;

use libweave_core::resolver::Integration;
use libweave_core::time::current_time_ms;
use libweave_core::{NodeId, NodeState, OperationPayload, PeerId, Position, PresenceEntry, SyncConfig, VectorClock};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::channel::{InboundFrame, MpscChannel, PeerChannel};
use crate::error::PeerError;
use crate::protocol::PeerSyncProtocol;
use crate::{DEFAULT_MAILBOX_CAPACITY, PROTOCOL_NAME};

/// Message sent to a worker
pub enum PeerCommand {
    /// Register an outbound channel (Connecting)
    Connect { channel: Box<dyn PeerChannel> },
    /// Mark a channel open and send our snapshot
    Open { remote: PeerId },
    Disconnect { remote: PeerId },
    LocalEdit {
        node_id: NodeId,
        payload: OperationPayload,
        reply: oneshot::Sender<Result<Integration, PeerError>>,
    },
    SetPresence {
        cursor: Option<Position>,
        selection: Vec<NodeId>,
        active_editor: Option<String>,
    },
    Snapshot { reply: oneshot::Sender<WorkerSnapshot> },
    /// Shutdown the worker
    Shutdown,
}

/// Point-in-time view of a worker's state
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSnapshot {
    pub peer_id: PeerId,
    pub nodes: NodeState,
    pub vector_clock: VectorClock,
    pub presences: Vec<PresenceEntry>,
    pub open_peers: Vec<PeerId>,
}

/// Cloneable handle used to talk to a running worker
#[derive(Debug, Clone)]
pub struct PeerHandle {
    peer_id: PeerId,
    commands: mpsc::Sender<PeerCommand>,
    inbound: mpsc::Sender<InboundFrame>,
}

impl PeerHandle {
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Queue that delivers frames to this peer
    pub fn inbound(&self) -> mpsc::Sender<InboundFrame> {
        self.inbound.clone()
    }

    async fn request(&self, command: PeerCommand) -> Result<(), PeerError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| PeerError::WorkerUnavailable)
    }

    /// Open a one-way channel from this peer to `remote`
    pub async fn connect_to(&self, remote: &PeerHandle) -> Result<(), PeerError> {
        let channel = MpscChannel::new(self.peer_id.clone(), remote.peer_id.clone(), remote.inbound());
        self.request(PeerCommand::Connect {
            channel: Box::new(channel),
        })
        .await?;
        self.request(PeerCommand::Open {
            remote: remote.peer_id.clone(),
        })
        .await
    }

    pub async fn disconnect(&self, remote: &PeerId) -> Result<(), PeerError> {
        self.request(PeerCommand::Disconnect {
            remote: remote.clone(),
        })
        .await
    }

    pub async fn local_edit(
        &self,
        node_id: NodeId,
        payload: OperationPayload,
    ) -> Result<Integration, PeerError> {
        let (reply, rx) = oneshot::channel();
        self.request(PeerCommand::LocalEdit {
            node_id,
            payload,
            reply,
        })
        .await?;
        rx.await.map_err(|_| PeerError::WorkerUnavailable)?
    }

    pub async fn set_presence(
        &self,
        cursor: Option<Position>,
        selection: Vec<NodeId>,
        active_editor: Option<String>,
    ) -> Result<(), PeerError> {
        self.request(PeerCommand::SetPresence {
            cursor,
            selection,
            active_editor,
        })
        .await
    }

    pub async fn snapshot(&self) -> Result<WorkerSnapshot, PeerError> {
        let (reply, rx) = oneshot::channel();
        self.request(PeerCommand::Snapshot { reply }).await?;
        rx.await.map_err(|_| PeerError::WorkerUnavailable)
    }

    pub async fn shutdown(&self) -> Result<(), PeerError> {
        self.request(PeerCommand::Shutdown).await
    }
}

/// Worker state for a single peer
pub struct PeerWorker {
    protocol: PeerSyncProtocol,
    commands: mpsc::Receiver<PeerCommand>,
    inbound: mpsc::Receiver<InboundFrame>,
    presence_interval: Duration,
}

impl PeerWorker {
    /// Create a worker and the handle that drives it
    pub fn new(protocol: PeerSyncProtocol, config: &SyncConfig) -> (Self, PeerHandle) {
        let (commands_tx, commands) = mpsc::channel(DEFAULT_MAILBOX_CAPACITY);
        let (inbound_tx, inbound) = mpsc::channel(config.channel_capacity.max(1));

        let handle = PeerHandle {
            peer_id: protocol.peer_id().clone(),
            commands: commands_tx,
            inbound: inbound_tx,
        };
        let worker = Self {
            protocol,
            commands,
            inbound,
            presence_interval: Duration::from_millis(config.presence.broadcast_interval_ms.max(1)),
        };
        (worker, handle)
    }

    /// Spawn the worker on the current tokio runtime
    pub fn spawn(protocol: PeerSyncProtocol, config: &SyncConfig) -> (PeerHandle, JoinHandle<()>) {
        let (worker, handle) = Self::new(protocol, config);
        (handle, tokio::spawn(worker.run()))
    }

    /// Run the worker event loop
    pub async fn run(mut self) {
        let peer_id = self.protocol.peer_id().clone();
        info!(peer = %peer_id, protocol = PROTOCOL_NAME, "Peer worker started");

        let mut presence_tick = tokio::time::interval(self.presence_interval);
        presence_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(PeerCommand::Shutdown) | None => {
                        info!(peer = %peer_id, "Peer worker shutdown requested");
                        break;
                    }
                    Some(command) => self.handle_command(command),
                },
                Some(frame) = self.inbound.recv() => {
                    self.protocol.handle_frame(&frame);
                }
                _ = presence_tick.tick() => {
                    self.protocol.broadcast_presence();
                    self.protocol.maintain(current_time_ms());
                }
            }
        }

        // Cleanup
        for remote in self.protocol.open_peers() {
            self.protocol.disconnect(&remote);
        }
        info!(peer = %peer_id, "Peer worker stopped");
    }

    fn handle_command(&mut self, command: PeerCommand) {
        match command {
            PeerCommand::Connect { channel } => {
                self.protocol.connect(channel);
            }
            PeerCommand::Open { remote } => {
                if let Err(e) = self.protocol.mark_open(&remote) {
                    debug!(peer = %self.protocol.peer_id(), remote = %remote, error = %e, "open failed");
                }
            }
            PeerCommand::Disconnect { remote } => {
                self.protocol.disconnect(&remote);
            }
            PeerCommand::LocalEdit {
                node_id,
                payload,
                reply,
            } => {
                let result = self.protocol.local_edit(node_id, payload);
                let _ = reply.send(result);
            }
            PeerCommand::SetPresence {
                cursor,
                selection,
                active_editor,
            } => {
                self.protocol
                    .set_local_presence(cursor, selection, active_editor);
            }
            PeerCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            PeerCommand::Shutdown => {}
        }
    }

    fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            peer_id: self.protocol.peer_id().clone(),
            nodes: self.protocol.state().clone(),
            vector_clock: self.protocol.vector_clock().clone(),
            presences: self
                .protocol
                .presence()
                .get_all_presences()
                .into_iter()
                .cloned()
                .collect(),
            open_peers: self.protocol.open_peers(),
        }
    }
}
