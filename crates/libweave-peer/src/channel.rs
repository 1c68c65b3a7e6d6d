//! Channel abstraction between two peers
//!
//! A channel is ordered and reliable while open. `send` only enqueues; it
//! never waits for the remote side.

use libweave_core::PeerId;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::PeerError;

/// Lifecycle of one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
}

impl ChannelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelState::Connecting => "connecting",
            ChannelState::Open => "open",
            ChannelState::Closed => "closed",
        }
    }
}

/// A raw frame as delivered to the receiving peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    /// Peer on the other end of the channel the frame came in on
    pub from: PeerId,
    pub frame: String,
}

/// Outbound half of a channel to one remote peer
pub trait PeerChannel: Send {
    fn remote(&self) -> &PeerId;

    /// Enqueue one encoded frame
    fn send(&mut self, frame: String) -> Result<(), PeerError>;

    fn close(&mut self);
}

/// In-process channel backed by the remote peer's inbound tokio queue
#[derive(Debug)]
pub struct MpscChannel {
    local: PeerId,
    remote: PeerId,
    tx: Option<mpsc::Sender<InboundFrame>>,
}

impl MpscChannel {
    pub fn new(local: PeerId, remote: PeerId, tx: mpsc::Sender<InboundFrame>) -> Self {
        Self {
            local,
            remote,
            tx: Some(tx),
        }
    }
}

impl PeerChannel for MpscChannel {
    fn remote(&self) -> &PeerId {
        &self.remote
    }

    fn send(&mut self, frame: String) -> Result<(), PeerError> {
        let Some(tx) = &self.tx else {
            return Err(PeerError::ChannelClosed(self.remote.clone()));
        };
        let inbound = InboundFrame {
            from: self.local.clone(),
            frame,
        };
        tx.try_send(inbound).map_err(|e| match e {
            TrySendError::Full(_) => PeerError::ChannelFull(self.remote.clone()),
            TrySendError::Closed(_) => PeerError::ChannelClosed(self.remote.clone()),
        })
    }

    fn close(&mut self) {
        self.tx = None;
    }
}
