//! Peer sync protocol for weave
//!
//! This crate provides:
//! - Wire frames exchanged between peers (SyncMessage)
//! - The channel abstraction and per-peer channel registry
//! - PeerSyncProtocol, which routes frames into the core state machines
//! - Canvas listener hooks and notifications
//! - PeerWorker, a single-writer task that owns one peer's protocol

pub mod channel;
pub mod error;
pub mod messages;
pub mod notifications;
pub mod protocol;
pub mod registry;
pub mod worker;

pub use channel::{ChannelState, InboundFrame, MpscChannel, PeerChannel};
pub use error::PeerError;
pub use messages::{MessageType, Payload, SyncMessage};
pub use notifications::{CanvasListener, Notification, NotificationListener, NullListener};
pub use protocol::{Inbound, PeerSyncProtocol};
pub use registry::ChannelRegistry;
pub use worker::{PeerCommand, PeerHandle, PeerWorker, WorkerSnapshot};

/// Protocol identifier carried in logs
pub const PROTOCOL_NAME: &str = "weave-sync";

/// Default capacity of a worker's command mailbox
pub const DEFAULT_MAILBOX_CAPACITY: usize = 1000;
