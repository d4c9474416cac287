//! Peer registry: the logical remote repo, reachable via zero or more
//! channels (spec §3 `PeerState`, `PerDocSyncState`).

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use crate::channel::ChannelId;
use crate::identity::RepoIdentity;
use crate::wire::{DocId, VersionVector};

/// Our belief about a peer's knowledge of a document (spec glossary:
/// "Awareness").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PerDocSyncState {
    Pending { last_updated: Instant },
    Synced { last_known_version: VersionVector, last_updated: Instant },
    Absent { last_updated: Instant },
}

impl PerDocSyncState {
    pub fn last_updated(&self) -> Instant {
        match self {
            PerDocSyncState::Pending { last_updated }
            | PerDocSyncState::Synced { last_updated, .. }
            | PerDocSyncState::Absent { last_updated } => *last_updated,
        }
    }

    pub fn last_known_version(&self) -> Option<&VersionVector> {
        match self {
            PerDocSyncState::Synced { last_known_version, .. } => Some(last_known_version),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct PeerState {
    pub identity: RepoIdentity,
    pub channels: HashSet<ChannelId>,
    pub doc_sync_states: HashMap<DocId, PerDocSyncState>,
    /// Documents this peer asked us to push future changes for
    /// (`bidirectional=true` sync-requests); spec glossary "Subscription".
    pub subscriptions: HashSet<DocId>,
}

impl PeerState {
    pub fn new(identity: RepoIdentity) -> Self {
        Self {
            identity,
            channels: HashSet::new(),
            doc_sync_states: HashMap::new(),
            subscriptions: HashSet::new(),
        }
    }

    /// Records a new `last_known_version` for `doc_id` (spec §3, §8
    /// invariant 2: callers must only pass versions that are vector-equal
    /// to or ahead of any prior recorded version for this peer/doc pair).
    pub fn mark_synced(&mut self, doc_id: &str, version: VersionVector, now: Instant) {
        self.doc_sync_states.insert(
            doc_id.to_string(),
            PerDocSyncState::Synced { last_known_version: version, last_updated: now },
        );
    }

    /// Unconditionally overwrites any prior state for (peer, doc_id),
    /// matching `mark_synced`/`mark_absent`: a peer re-announcing a doc it
    /// was previously `Absent` for must move back to `Pending`, not stay
    /// stuck (spec §4.5.2).
    pub fn mark_pending(&mut self, doc_id: &str, now: Instant) {
        self.doc_sync_states
            .insert(doc_id.to_string(), PerDocSyncState::Pending { last_updated: now });
    }

    pub fn mark_absent(&mut self, doc_id: &str, now: Instant) {
        self.doc_sync_states
            .insert(doc_id.to_string(), PerDocSyncState::Absent { last_updated: now });
    }
}

/// Map from peer id to `PeerState`. Peers are born on first `Established`
/// channel and persist after the last channel is removed (spec §3) so
/// their `doc_sync_states` remain useful if they reconnect.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<String, PeerState>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self { peers: HashMap::new() }
    }

    pub fn get(&self, peer_id: &str) -> Option<&PeerState> {
        self.peers.get(peer_id)
    }

    pub fn get_mut(&mut self, peer_id: &str) -> Option<&mut PeerState> {
        self.peers.get_mut(peer_id)
    }

    pub fn get_or_insert(&mut self, identity: &RepoIdentity) -> &mut PeerState {
        self.peers
            .entry(identity.peer_id.clone())
            .or_insert_with(|| PeerState::new(identity.clone()))
    }

    /// Removes a channel from its peer's reachable set. The peer record
    /// itself is retained even if this empties its channel set (spec §3).
    pub fn remove_channel(&mut self, peer_id: &str, channel_id: ChannelId) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.channels.remove(&channel_id);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PeerState)> {
        self.peers.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut PeerState)> {
        self.peers.iter_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::PeerKind;

    #[test]
    fn peer_persists_after_last_channel_removed() {
        let mut registry = PeerRegistry::new();
        let identity = RepoIdentity::new("2", "bob", PeerKind::User);
        registry.get_or_insert(&identity).channels.insert(ChannelId(0));
        registry.remove_channel("2", ChannelId(0));
        let peer = registry.get("2").unwrap();
        assert!(peer.channels.is_empty());
    }

    #[test]
    fn mark_pending_overwrites_prior_absent_state() {
        let mut peer = PeerState::new(RepoIdentity::new("2", "bob", PeerKind::User));
        let now = Instant::now();
        peer.mark_absent("d1", now);
        peer.mark_pending("d1", now);
        assert!(matches!(peer.doc_sync_states.get("d1"), Some(PerDocSyncState::Pending { .. })));
    }

    #[test]
    fn mark_synced_records_latest_version() {
        let mut peer = PeerState::new(RepoIdentity::new("2", "bob", PeerKind::User));
        let now = Instant::now();
        peer.mark_synced("d1", VersionVector(vec![1]), now);
        assert_eq!(
            peer.doc_sync_states.get("d1").unwrap().last_known_version(),
            Some(&VersionVector(vec![1]))
        );
    }
}
