//! Periodic tick: keeps ephemeral presence alive and nudges stalled
//! sync-requests (spec §4.5.6).

use std::time::Instant;

use tracing::Level;

use super::{Cmd, Model};
use crate::channel::{ChannelId, ChannelState};
use crate::peer::PerDocSyncState;
use crate::wire::{ChannelMsg, DocId, Envelope, VersionVector};

pub fn on_heartbeat(model: &mut Model) -> Vec<Cmd> {
    let mut cmds = Vec::new();
    cmds.extend(expire_stalled_handshakes(model));
    cmds.extend(rebroadcast_ephemeral(model));
    cmds.extend(reissue_stalled_sync_requests(model));
    cmds
}

/// Closes (resets) any channel still `Pending` past `handshake_timeout`
/// (spec §5: "Pending handshake has a pending_timeout... Expiry closes the
/// channel").
fn expire_stalled_handshakes(model: &mut Model) -> Vec<Cmd> {
    let now = Instant::now();
    let timeout = model.config.handshake_timeout;

    let stalled: Vec<ChannelId> = model
        .channels
        .iter()
        .filter_map(|c| match &c.state {
            ChannelState::Pending { opened_at, .. } if now.duration_since(*opened_at) >= timeout => Some(c.id),
            _ => None,
        })
        .collect();

    let mut cmds = Vec::new();
    for channel_id in stalled {
        model.channels.reset(channel_id);
        cmds.push(Cmd::log(Level::WARN, format!("handshake on {channel_id:?} timed out, channel reset")));
    }
    cmds
}

fn rebroadcast_ephemeral(model: &Model) -> Vec<Cmd> {
    let to: Vec<ChannelId> = model
        .channels
        .established_channels()
        .filter(|c| c.kind.ephemeral_hop_budget(model.config.ephemeral_hops_network) > 0)
        .map(|c| c.id)
        .collect();
    if to.is_empty() {
        return Vec::new();
    }

    let entries: Vec<(DocId, String, _)> = model
        .documents
        .iter()
        .flat_map(|(doc_id, state)| {
            state
                .ephemeral_stores
                .iter()
                .map(move |(ns, store)| (doc_id.clone(), ns.clone(), store.clone()))
        })
        .collect();

    if entries.is_empty() {
        return Vec::new();
    }

    vec![Cmd::BroadcastEphemeralBatch {
        our_peer_id: model.our_identity.peer_id.clone(),
        hops_remaining: model.config.ephemeral_hops_network,
        entries,
        to,
    }]
}

fn reissue_stalled_sync_requests(model: &mut Model) -> Vec<Cmd> {
    let now = Instant::now();
    let timeout = model.config.pending_sync_timeout;
    let mut cmds = Vec::new();

    let stalled: Vec<(String, DocId, ChannelId)> = model
        .peers
        .iter()
        .filter_map(|(peer_id, peer)| {
            let channel_id = *peer.channels.iter().next()?;
            let docs: Vec<DocId> = peer
                .doc_sync_states
                .iter()
                .filter_map(|(doc_id, state)| match state {
                    PerDocSyncState::Pending { last_updated } if now.duration_since(*last_updated) >= timeout => {
                        Some(doc_id.clone())
                    }
                    _ => None,
                })
                .collect();
            if docs.is_empty() {
                None
            } else {
                Some(docs.into_iter().map(move |d| (peer_id.clone(), d, channel_id)).collect::<Vec<_>>())
            }
        })
        .flatten()
        .collect();

    for (_, doc_id, channel_id) in stalled {
        let requester_version =
            model.documents.get(&doc_id).map(|s| s.doc.version()).unwrap_or_else(VersionVector::empty);
        cmds.push(Cmd::SendMessage(Envelope::Established {
            to: vec![channel_id],
            msg: ChannelMsg::SyncRequest { doc_id, requester_version, bidirectional: true },
        }));
    }

    cmds
}
