//! Version-vector-driven document sync (spec §4.5.3, §4.5.4).

use std::time::Instant;

use tracing::Level;

use super::{Cmd, Model};
use crate::channel::ChannelId;
use crate::error::SyncError;
use crate::peer::PerDocSyncState;
use crate::rules::RuleCtx;
use crate::wire::{ChannelMsg, DocId, Envelope, SyncTransmission, VersionVector};

pub fn on_sync_request(
    model: &mut Model,
    from_channel_id: ChannelId,
    doc_id: DocId,
    requester_version: VersionVector,
    bidirectional: bool,
) -> Vec<Cmd> {
    let Some(channel) = model.channels.get(from_channel_id) else {
        return Vec::new();
    };
    let channel_kind = channel.kind;
    let Some(peer_identity) = channel.state.peer().cloned() else {
        return Vec::new();
    };

    let ctx = RuleCtx {
        channel_kind,
        adapter_type: "",
        peer_identity: Some(&peer_identity),
        doc_id: &doc_id,
        our_identity: &model.our_identity,
    };
    if !model.rules.can_receive(&ctx) {
        return vec![Cmd::log(
            Level::WARN,
            SyncError::PermissionDenied { channel: from_channel_id, doc_id }.to_string(),
        )];
    }

    let Some(state) = model.documents.get(&doc_id) else {
        return vec![
            Cmd::log(Level::DEBUG, SyncError::DocumentMissing(doc_id.clone()).to_string()),
            Cmd::SendMessage(Envelope::Established {
                to: vec![from_channel_id],
                msg: ChannelMsg::Sync { doc_id, transmission: SyncTransmission::Unavailable },
            }),
        ];
    };

    let requester_is_empty = requester_version.is_empty();
    let data = state.doc.export(if requester_is_empty { None } else { Some(&requester_version) });
    let our_version = state.doc.version();

    // Empty `requester_version` always yields a snapshot, never an
    // up-to-date/update response (spec §8 boundary behavior).
    let transmission = if requester_is_empty {
        SyncTransmission::Snapshot { data, version: our_version }
    } else if data.is_empty() {
        SyncTransmission::UpToDate { version: our_version }
    } else {
        SyncTransmission::Update { data, version: our_version }
    };

    if let Some(peer) = model.peers.get_mut(&peer_identity.peer_id) {
        peer.mark_synced(&doc_id, requester_version, Instant::now());
        if bidirectional {
            peer.subscriptions.insert(doc_id.clone());
        }
    }

    vec![Cmd::SendMessage(Envelope::Established {
        to: vec![from_channel_id],
        msg: ChannelMsg::Sync { doc_id, transmission },
    })]
}

pub fn on_sync_response(
    model: &mut Model,
    from_channel_id: ChannelId,
    doc_id: DocId,
    transmission: SyncTransmission,
) -> Vec<Cmd> {
    let Some(channel) = model.channels.get(from_channel_id) else {
        return Vec::new();
    };
    let channel_kind = channel.kind;
    let Some(peer_identity) = channel.state.peer().cloned() else {
        return Vec::new();
    };
    let now = Instant::now();

    match transmission {
        SyncTransmission::Snapshot { data, version } | SyncTransmission::Update { data, version } => {
            let ctx = RuleCtx {
                channel_kind,
                adapter_type: "",
                peer_identity: Some(&peer_identity),
                doc_id: &doc_id,
                our_identity: &model.our_identity,
            };
            if !model.rules.can_receive(&ctx) {
                return vec![Cmd::log(
                    Level::WARN,
                    SyncError::PermissionDenied { channel: from_channel_id, doc_id }.to_string(),
                )];
            }
            let Some(state) = model.documents.get(&doc_id) else {
                return vec![Cmd::log(Level::WARN, SyncError::DocumentMissing(doc_id).to_string())];
            };
            // Idempotent: re-importing the same bytes is a no-op for the
            // CRDT (spec §8 round-trip law).
            state.doc.import(&data);
            if let Some(peer) = model.peers.get_mut(&peer_identity.peer_id) {
                peer.mark_synced(&doc_id, version, now);
            }
            // No rebroadcast here: the import fires the doc's own
            // `subscribe_local_updates` callback, which enqueues
            // `local-doc-change` on the same dispatch queue (spec §4.5.3).
            Vec::new()
        }
        SyncTransmission::UpToDate { version } => {
            if let Some(peer) = model.peers.get_mut(&peer_identity.peer_id) {
                peer.mark_synced(&doc_id, version, now);
            }
            Vec::new()
        }
        SyncTransmission::Unavailable => {
            if let Some(peer) = model.peers.get_mut(&peer_identity.peer_id) {
                peer.mark_absent(&doc_id, now);
            }
            Vec::new()
        }
    }
}

/// Propagates a local commit or imported change to every established
/// channel per the decision table in spec §4.5.4. Peers that caused the
/// change by sending it to us need no special exclusion: their
/// `last_known_version` was just advanced to (or past) this version, so
/// the diff computed for them below comes back empty and they are
/// naturally skipped.
pub fn on_local_doc_change(model: &mut Model, doc_id: &DocId) -> Vec<Cmd> {
    let Some(state) = model.documents.get(doc_id) else {
        return Vec::new();
    };
    let our_version = state.doc.version();
    let now = Instant::now();

    let channel_ids: Vec<ChannelId> = model.channels.directory_channels().map(|c| c.id).collect();
    let mut cmds = Vec::new();

    for channel_id in channel_ids {
        let Some(channel) = model.channels.get(channel_id) else { continue };
        let channel_kind = channel.kind;
        let Some(peer_identity) = channel.state.peer().cloned() else { continue };
        let peer_id = peer_identity.peer_id.clone();

        let is_subscribed = model
            .peers
            .get(&peer_id)
            .map(|p| p.subscriptions.contains(doc_id))
            .unwrap_or(false);

        if is_subscribed {
            let last_known = model.peers.get(&peer_id).and_then(|p| p.doc_sync_states.get(doc_id)).and_then(|s| s.last_known_version());
            let Some(state) = model.documents.get(doc_id) else { continue };
            let data = state.doc.export(last_known);
            if data.is_empty() {
                continue;
            }
            cmds.push(Cmd::SendMessage(Envelope::Established {
                to: vec![channel_id],
                msg: ChannelMsg::Sync {
                    doc_id: doc_id.clone(),
                    transmission: SyncTransmission::Update { data, version: our_version.clone() },
                },
            }));
            if let Some(peer) = model.peers.get_mut(&peer_id) {
                peer.mark_synced(doc_id, our_version.clone(), now);
            }
            continue;
        }

        let awareness = model.peers.get(&peer_id).and_then(|p| p.doc_sync_states.get(doc_id));
        let should_announce = match awareness {
            None => {
                let ctx = RuleCtx {
                    channel_kind,
                    adapter_type: "",
                    peer_identity: Some(&peer_identity),
                    doc_id,
                    our_identity: &model.our_identity,
                };
                model.rules.can_reveal(&ctx)
            }
            Some(PerDocSyncState::Pending { .. }) => true,
            Some(PerDocSyncState::Synced { last_known_version, .. }) => {
                let Some(state) = model.documents.get(doc_id) else { continue };
                !state.doc.export(Some(last_known_version)).is_empty()
            }
            Some(PerDocSyncState::Absent { .. }) => false,
        };

        if should_announce {
            cmds.push(Cmd::SendMessage(Envelope::Established {
                to: vec![channel_id],
                msg: ChannelMsg::DirectoryResponse { doc_ids: vec![doc_id.clone()] },
            }));
        }
    }

    cmds
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelKind;
    use crate::config::SynchronizerConfig;
    use crate::document::{CrdtDoc, DocState, LocalUpdateCallback, SubscriptionToken};
    use crate::ephemeral::EphemeralStore;
    use crate::identity::{PeerKind, RepoIdentity};
    use crate::rules::Rules;
    use crate::testkit::AutomergeDoc;
    use crate::wire::Namespace;
    use std::sync::{Arc, Mutex};

    /// A minimal real `CrdtDoc` whose `version`/`export` actually honor
    /// `from`, unlike [`AutomergeDoc`]'s documented always-full-snapshot
    /// simplification — needed to exercise the `Update`-vs-`UpToDate`
    /// distinction in [`on_sync_request`].
    struct CounterDoc {
        changes: Mutex<Vec<u8>>,
    }

    impl CounterDoc {
        fn new() -> Self {
            Self { changes: Mutex::new(Vec::new()) }
        }

        fn append_change(&self) {
            let mut changes = self.changes.lock().unwrap();
            let next = changes.len() as u8;
            changes.push(next);
        }
    }

    impl CrdtDoc for CounterDoc {
        fn version(&self) -> VersionVector {
            VersionVector(vec![self.changes.lock().unwrap().len() as u8])
        }

        fn export(&self, from: Option<&VersionVector>) -> Vec<u8> {
            let changes = self.changes.lock().unwrap();
            let start = from.and_then(|v| v.0.first().copied()).unwrap_or(0) as usize;
            changes[start.min(changes.len())..].to_vec()
        }

        fn import(&self, data: &[u8]) {
            self.changes.lock().unwrap().extend_from_slice(data);
        }

        fn subscribe_local_updates(&self, _callback: LocalUpdateCallback) -> SubscriptionToken {
            SubscriptionToken(0)
        }

        fn unsubscribe(&self, _token: SubscriptionToken) {}

        fn change(&self, edit: Box<dyn FnOnce(&mut dyn std::any::Any) + '_>) {
            edit(&mut () as &mut dyn std::any::Any);
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    fn test_model(our_id: &str) -> Model {
        Model::new(
            RepoIdentity::new(our_id, "me", PeerKind::User),
            SynchronizerConfig::default(),
            Rules::default(),
            Arc::new(|_: &DocId| -> Arc<dyn CrdtDoc> { panic!("doc factory not exercised by this test") }),
            Arc::new(|_: &DocId, _: &Namespace| -> Arc<dyn EphemeralStore> {
                panic!("ephemeral factory not exercised by this test")
            }),
        )
    }

    fn establish_channel(model: &mut Model, peer_id: &str) -> ChannelId {
        let channel_id = model.channels.allocate_id();
        model.channels.insert_pending(channel_id, ChannelKind::Network, "adapter-1".into(), 64);
        model
            .channels
            .get_mut(channel_id)
            .unwrap()
            .establish(RepoIdentity::new(peer_id, "peer", PeerKind::User));
        model.peers.get_or_insert(&RepoIdentity::new(peer_id, "peer", PeerKind::User)).channels.insert(channel_id);
        channel_id
    }

    /// Scenario 2 (spec §8): a peer resuming from a stale version vector
    /// gets an `Update`, not a full `Snapshot`; once caught up, it gets
    /// `UpToDate`.
    #[test]
    fn sync_request_with_stale_version_resumes_with_update_then_up_to_date() {
        let mut model = test_model("1");
        let doc = Arc::new(CounterDoc::new());
        doc.append_change();
        let stale_version = doc.version();
        doc.append_change();
        let current_version = doc.version();
        assert_ne!(stale_version, current_version);

        model.documents.insert(DocState::new("d1".to_string(), doc.clone() as Arc<dyn CrdtDoc>));
        let channel_id = establish_channel(&mut model, "2");

        let cmds = on_sync_request(&mut model, channel_id, "d1".to_string(), stale_version, false);
        assert_eq!(cmds.len(), 1);
        match &cmds[0] {
            Cmd::SendMessage(Envelope::Established { msg: ChannelMsg::Sync { transmission, .. }, .. }) => {
                assert!(matches!(transmission, SyncTransmission::Update { .. }));
            }
            _ => panic!("expected a Sync message"),
        }

        let cmds = on_sync_request(&mut model, channel_id, "d1".to_string(), current_version, false);
        assert_eq!(cmds.len(), 1);
        match &cmds[0] {
            Cmd::SendMessage(Envelope::Established { msg: ChannelMsg::Sync { transmission, .. }, .. }) => {
                assert!(matches!(transmission, SyncTransmission::UpToDate { .. }));
            }
            _ => panic!("expected a Sync message"),
        }
    }

    /// Scenario 5 (spec §8): a peer marked `Absent` for a doc moves back to
    /// `Pending` on re-announcement and is no longer suppressed by
    /// `on_local_doc_change`.
    #[test]
    fn peer_marked_absent_resumes_propagation_after_reannouncement() {
        let mut model = test_model("1");
        let doc = Arc::new(AutomergeDoc::new("1"));
        doc.change(Box::new(|any| {
            let doc: &mut automerge::AutoCommit = any.downcast_mut().unwrap();
            let root = crate::testkit::ensure_root_map(doc, "root");
            doc.put(root, "k", "v1").unwrap();
        }));
        model.documents.insert(DocState::new("d1".to_string(), doc.clone() as Arc<dyn CrdtDoc>));
        let channel_id = establish_channel(&mut model, "2");

        let cmds = on_sync_response(&mut model, channel_id, "d1".to_string(), SyncTransmission::Unavailable);
        assert!(cmds.is_empty());
        assert!(matches!(
            model.peers.get("2").unwrap().doc_sync_states.get("d1"),
            Some(PerDocSyncState::Absent { .. })
        ));

        let suppressed = on_local_doc_change(&mut model, &"d1".to_string());
        assert!(
            suppressed.is_empty(),
            "an Absent peer must not be re-announced to until it re-announces itself"
        );

        super::super::directory::on_directory_response(&mut model, channel_id, vec!["d1".to_string()]);
        assert!(matches!(
            model.peers.get("2").unwrap().doc_sync_states.get("d1"),
            Some(PerDocSyncState::Pending { .. })
        ));

        let cmds = on_local_doc_change(&mut model, &"d1".to_string());
        assert_eq!(cmds.len(), 1);
        match &cmds[0] {
            Cmd::SendMessage(Envelope::Established { msg: ChannelMsg::DirectoryResponse { doc_ids }, .. }) => {
                assert_eq!(doc_ids, &vec!["d1".to_string()]);
            }
            _ => panic!("expected a DirectoryResponse announcement"),
        }
    }
}
