//! Channels keyed by remote peer id

use std::collections::BTreeMap;

use libweave_core::PeerId;
use tracing::debug;

use crate::channel::{ChannelState, PeerChannel};
use crate::error::PeerError;

struct ChannelEntry {
    state: ChannelState,
    channel: Box<dyn PeerChannel>,
}

/// Open and connecting channels owned by one protocol instance
#[derive(Default)]
pub struct ChannelRegistry {
    channels: BTreeMap<PeerId, ChannelEntry>,
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let states: BTreeMap<&PeerId, &str> = self
            .channels
            .iter()
            .map(|(peer, entry)| (peer, entry.state.as_str()))
            .collect();
        f.debug_struct("ChannelRegistry").field("channels", &states).finish()
    }
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel in `Connecting`, closing any previous one for the peer
    pub fn connect(&mut self, channel: Box<dyn PeerChannel>) -> ChannelState {
        let peer_id = channel.remote().clone();
        let entry = ChannelEntry {
            state: ChannelState::Connecting,
            channel,
        };
        if let Some(mut previous) = self.channels.insert(peer_id.clone(), entry) {
            previous.channel.close();
            debug!(peer = %peer_id, "replaced existing channel");
        }
        ChannelState::Connecting
    }

    pub fn mark_open(&mut self, peer_id: &PeerId) -> Result<(), PeerError> {
        let entry = self
            .channels
            .get_mut(peer_id)
            .ok_or_else(|| PeerError::UnknownPeer(peer_id.clone()))?;
        entry.state = ChannelState::Open;
        Ok(())
    }

    /// Close and remove the channel; returns whether one existed
    pub fn close(&mut self, peer_id: &PeerId) -> bool {
        match self.channels.remove(peer_id) {
            Some(mut entry) => {
                entry.channel.close();
                true
            }
            None => false,
        }
    }

    /// `Closed` for peers with no registered channel
    pub fn state(&self, peer_id: &PeerId) -> ChannelState {
        self.channels
            .get(peer_id)
            .map_or(ChannelState::Closed, |entry| entry.state)
    }

    pub fn open_peers(&self) -> Vec<PeerId> {
        self.channels
            .iter()
            .filter(|(_, entry)| entry.state == ChannelState::Open)
            .map(|(peer, _)| peer.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Send to one peer whose channel is open
    pub fn send_to(&mut self, peer_id: &PeerId, frame: String) -> Result<(), PeerError> {
        match self.channels.get_mut(peer_id) {
            Some(entry) if entry.state == ChannelState::Open => entry.channel.send(frame),
            _ => Err(PeerError::UnknownPeer(peer_id.clone())),
        }
    }

    /// Send to every open channel; returns the failures
    pub fn broadcast(&mut self, frame: &str) -> Vec<(PeerId, PeerError)> {
        let mut failures = Vec::new();
        for (peer_id, entry) in self.channels.iter_mut() {
            if entry.state != ChannelState::Open {
                continue;
            }
            if let Err(e) = entry.channel.send(frame.to_string()) {
                failures.push((peer_id.clone(), e));
            }
        }
        failures
    }
}
