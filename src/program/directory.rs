//! Pull-based document discovery (spec §4.5.2).

use std::time::Instant;

use super::Cmd;
use super::Model;
use crate::channel::ChannelId;
use crate::rules::RuleCtx;
use crate::wire::{ChannelMsg, DocId, Envelope, VersionVector};

pub fn on_directory_request(model: &mut Model, from_channel_id: ChannelId) -> Vec<Cmd> {
    let Some(channel) = model.channels.get(from_channel_id) else {
        return Vec::new();
    };
    let channel_kind = channel.kind;
    let peer_identity = channel.state.peer().cloned();

    let doc_ids: Vec<DocId> = model
        .documents
        .doc_ids()
        .filter(|doc_id| {
            let ctx = RuleCtx {
                channel_kind,
                adapter_type: "",
                peer_identity: peer_identity.as_ref(),
                doc_id,
                our_identity: &model.our_identity,
            };
            model.rules.visibility(&ctx)
        })
        .cloned()
        .collect();

    vec![Cmd::SendMessage(Envelope::Established {
        to: vec![from_channel_id],
        msg: ChannelMsg::DirectoryResponse { doc_ids },
    })]
}

pub fn on_directory_response(model: &mut Model, from_channel_id: ChannelId, doc_ids: Vec<DocId>) -> Vec<Cmd> {
    let Some(peer_id) = model
        .channels
        .get(from_channel_id)
        .and_then(|c| c.state.peer())
        .map(|p| p.peer_id.clone())
    else {
        return Vec::new();
    };

    let now = Instant::now();
    let mut cmds = Vec::new();
    let mut sync_requests = Vec::new();

    for doc_id in doc_ids {
        if !model.documents.contains(&doc_id) {
            let doc = (model.doc_factory)(&doc_id);
            let state = crate::document::DocState::new(doc_id.clone(), doc.clone());
            model.documents.insert(state);
            cmds.push(Cmd::SubscribeDoc { doc_id: doc_id.clone(), doc });
        }

        if let Some(peer) = model.peers.get_mut(&peer_id) {
            peer.mark_pending(&doc_id, now);
        }

        let requester_version = model
            .documents
            .get(&doc_id)
            .map(|state| state.doc.version())
            .unwrap_or_else(VersionVector::empty);

        sync_requests.push(ChannelMsg::SyncRequest { doc_id, requester_version, bidirectional: true });
    }

    if sync_requests.len() == 1 {
        cmds.push(Cmd::SendMessage(Envelope::Established {
            to: vec![from_channel_id],
            msg: sync_requests.pop().expect("len checked above"),
        }));
    } else if !sync_requests.is_empty() {
        cmds.push(Cmd::SendMessage(Envelope::Established {
            to: vec![from_channel_id],
            msg: ChannelMsg::Batch { messages: sync_requests },
        }));
    }

    cmds
}
