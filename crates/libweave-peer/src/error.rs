//! Peer protocol error types

use libweave_core::{PeerId, SyncError};
use thiserror::Error;

/// Errors that can occur while exchanging frames with peers
#[derive(Error, Debug)]
pub enum PeerError {
    /// Remote side of the channel is gone
    #[error("Channel to {0} is closed")]
    ChannelClosed(PeerId),

    /// Outbound buffer is full; the frame was dropped
    #[error("Channel to {0} is full")]
    ChannelFull(PeerId),

    /// No channel registered for the peer
    #[error("Unknown peer: {0}")]
    UnknownPeer(PeerId),

    /// Frame parsed but its payload does not match its type
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// JSON error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Core sync error
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    /// Worker task has stopped
    #[error("Peer worker unavailable")]
    WorkerUnavailable,
}

impl PeerError {
    /// Error code for logs and JSON summaries
    pub fn error_code(&self) -> &'static str {
        match self {
            PeerError::ChannelClosed(_) => codes::CHANNEL_CLOSED,
            PeerError::ChannelFull(_) => codes::CHANNEL_FULL,
            PeerError::UnknownPeer(_) => codes::UNKNOWN_PEER,
            PeerError::Malformed(_) | PeerError::Serialization(_) => codes::MALFORMED,
            PeerError::Sync(e) => e.error_code(),
            PeerError::WorkerUnavailable => codes::WORKER_UNAVAILABLE,
        }
    }

    /// Transport failures are dropped; everything else reaches the caller
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PeerError::ChannelClosed(_)
                | PeerError::ChannelFull(_)
                | PeerError::Malformed(_)
                | PeerError::Serialization(_)
        )
    }
}

pub mod codes {
    pub const CHANNEL_CLOSED: &str = "channel_closed";
    pub const CHANNEL_FULL: &str = "channel_full";
    pub const UNKNOWN_PEER: &str = "unknown_peer";
    pub const MALFORMED: &str = "malformed_frame";
    pub const WORKER_UNAVAILABLE: &str = "worker_unavailable";
}
