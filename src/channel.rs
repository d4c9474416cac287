//! Channel lifecycle: `Pending -> Established`, and the bounded buffer a
//! channel accumulates while pending (spec §4.2, §4.4).
//!
//! Grounded on `freeq-server`'s `s2s::PeerEntry` (generation-tagged peer
//! table entry) and `connection::Connection` (per-connection registry row).

use std::collections::VecDeque;
use std::time::Instant;

use crate::identity::RepoIdentity;
use crate::wire::ChannelMsg;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// A live network connection to another repo.
    Network,
    /// A local storage backend, addressed as a peer per spec §4.7.
    Storage,
    /// A bridge process relaying on behalf of another repo.
    Bridge,
    /// Carries ephemeral messages only; never appears in directory/sync.
    EphemeralOnly,
}

impl ChannelKind {
    /// Storage channels never propagate ephemeral gossip (spec §4.5.5).
    pub fn ephemeral_hop_budget(self, configured_network_hops: u8) -> u8 {
        match self {
            ChannelKind::Storage => 0,
            ChannelKind::Network | ChannelKind::Bridge | ChannelKind::EphemeralOnly => {
                configured_network_hops
            }
        }
    }

    pub fn participates_in_directory(self) -> bool {
        !matches!(self, ChannelKind::EphemeralOnly)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    /// Handshake in flight. `our_request_sent` and `their_identity` track
    /// how far the establish exchange has progressed; `generation` guards
    /// against a late response for a channel that has since been reset.
    Pending {
        our_request_sent: bool,
        their_identity: Option<RepoIdentity>,
        opened_at: Instant,
        generation: u64,
    },
    Established {
        peer: RepoIdentity,
        generation: u64,
    },
}

impl ChannelState {
    pub fn generation(&self) -> u64 {
        match self {
            ChannelState::Pending { generation, .. } => *generation,
            ChannelState::Established { generation, .. } => *generation,
        }
    }

    pub fn is_established(&self) -> bool {
        matches!(self, ChannelState::Established { .. })
    }

    pub fn peer(&self) -> Option<&RepoIdentity> {
        match self {
            ChannelState::Established { peer, .. } => Some(peer),
            ChannelState::Pending { their_identity, .. } => their_identity.as_ref(),
        }
    }
}

/// A single registered channel: its lifecycle state, kind, and the queue
/// of messages held back while it is `Pending`.
#[derive(Debug)]
pub struct Channel {
    pub id: ChannelId,
    pub kind: ChannelKind,
    pub adapter_id: String,
    pub state: ChannelState,
    pending_buffer: VecDeque<ChannelMsg>,
    buffer_capacity: usize,
}

/// Raised when the pending buffer would exceed its capacity; the caller
/// must reset the channel (spec §4.4: "overflow triggers a full reset").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingBufferOverflow;

impl Channel {
    pub fn new_pending(id: ChannelId, kind: ChannelKind, adapter_id: String, generation: u64, buffer_capacity: usize) -> Self {
        Self {
            id,
            kind,
            adapter_id,
            state: ChannelState::Pending {
                our_request_sent: false,
                their_identity: None,
                opened_at: Instant::now(),
                generation,
            },
            pending_buffer: VecDeque::new(),
            buffer_capacity,
        }
    }

    /// Buffers a message that arrived (or was queued for send) while the
    /// channel is still pending. Returns `Err` once capacity is exceeded;
    /// the caller resets the channel rather than growing the buffer
    /// unboundedly.
    pub fn buffer(&mut self, msg: ChannelMsg) -> Result<(), PendingBufferOverflow> {
        if self.pending_buffer.len() >= self.buffer_capacity {
            return Err(PendingBufferOverflow);
        }
        self.pending_buffer.push_back(msg);
        Ok(())
    }

    pub fn drain_buffer(&mut self) -> Vec<ChannelMsg> {
        self.pending_buffer.drain(..).collect()
    }

    pub fn establish(&mut self, peer: RepoIdentity) {
        let generation = self.state.generation();
        self.state = ChannelState::Established { peer, generation };
    }
}

/// The set of all channels known to this repo, keyed by `ChannelId`.
/// Mirrors `s2s.rs`'s peer table: a flat map plus a monotonic generation
/// counter used to detect and discard stale responses after a reset.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: std::collections::HashMap<ChannelId, Channel>,
    next_id: u64,
    next_generation: u64,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            channels: std::collections::HashMap::new(),
            next_id: 0,
            next_generation: 0,
        }
    }

    pub fn allocate_id(&mut self) -> ChannelId {
        let id = ChannelId(self.next_id);
        self.next_id += 1;
        id
    }

    fn next_generation(&mut self) -> u64 {
        let g = self.next_generation;
        self.next_generation += 1;
        g
    }

    pub fn insert_pending(&mut self, id: ChannelId, kind: ChannelKind, adapter_id: String, buffer_capacity: usize) {
        let generation = self.next_generation();
        self.channels
            .insert(id, Channel::new_pending(id, kind, adapter_id, generation, buffer_capacity));
    }

    pub fn channel_ids_for_adapter(&self, adapter_id: &str) -> Vec<ChannelId> {
        self.channels
            .values()
            .filter(|c| c.adapter_id == adapter_id)
            .map(|c| c.id)
            .collect()
    }

    pub fn get(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.get(&id)
    }

    pub fn get_mut(&mut self, id: ChannelId) -> Option<&mut Channel> {
        self.channels.get_mut(&id)
    }

    pub fn remove(&mut self, id: ChannelId) -> Option<Channel> {
        self.channels.remove(&id)
    }

    /// Resets a channel back to `Pending` under a fresh generation,
    /// dropping any buffered messages. Used on buffer overflow and on
    /// handshake timeout.
    pub fn reset(&mut self, id: ChannelId) {
        let generation = self.next_generation();
        if let Some(channel) = self.channels.get_mut(&id) {
            let capacity = channel.buffer_capacity;
            let kind = channel.kind;
            let adapter_id = channel.adapter_id.clone();
            *channel = Channel::new_pending(id, kind, adapter_id, generation, capacity);
        }
    }

    pub fn established_channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values().filter(|c| c.state.is_established())
    }

    pub fn directory_channels(&self) -> impl Iterator<Item = &Channel> {
        self.established_channels()
            .filter(|c| c.kind.participates_in_directory())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::PeerKind;

    #[test]
    fn pending_buffer_overflow_signals_reset_needed() {
        let mut channel = Channel::new_pending(ChannelId(0), ChannelKind::Network, "adapter-1".into(), 0, 2);
        channel.buffer(ChannelMsg::DirectoryRequest).unwrap();
        channel.buffer(ChannelMsg::DirectoryRequest).unwrap();
        assert_eq!(channel.buffer(ChannelMsg::DirectoryRequest), Err(PendingBufferOverflow));
    }

    #[test]
    fn reset_bumps_generation_and_clears_buffer() {
        let mut reg = ChannelRegistry::new();
        let id = reg.allocate_id();
        reg.insert_pending(id, ChannelKind::Network, "adapter-1".into(), 4);
        let gen_before = reg.get(id).unwrap().state.generation();
        reg.get_mut(id).unwrap().buffer(ChannelMsg::DirectoryRequest).unwrap();
        reg.reset(id);
        let channel = reg.get(id).unwrap();
        assert!(channel.state.generation() > gen_before);
        assert!(matches!(channel.state, ChannelState::Pending { .. }));
    }

    #[test]
    fn storage_channels_never_get_ephemeral_hops() {
        assert_eq!(ChannelKind::Storage.ephemeral_hop_budget(3), 0);
        assert_eq!(ChannelKind::Network.ephemeral_hop_budget(3), 3);
    }

    #[test]
    fn establishing_preserves_generation() {
        let mut channel = Channel::new_pending(ChannelId(0), ChannelKind::Network, "adapter-1".into(), 7, 4);
        channel.establish(RepoIdentity::new("2", "bob", PeerKind::User));
        assert_eq!(channel.state.generation(), 7);
        assert!(channel.state.is_established());
    }
}
