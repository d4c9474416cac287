//! Hop-bounded ephemeral gossip: presence/cursor data with best-effort,
//! unordered delivery (spec §4.5.5).

use super::{Cmd, Model};
use crate::channel::ChannelId;
use crate::wire::{ChannelMsg, DocId, EphemeralEntry, Envelope, Namespace};

pub fn on_local_ephemeral_change(model: &mut Model, doc_id: &DocId, namespace: &Namespace) -> Vec<Cmd> {
    let Some(state) = model.documents.get(doc_id) else {
        return Vec::new();
    };
    let Some(store) = state.ephemeral_stores.get(namespace).cloned() else {
        return Vec::new();
    };

    let to = non_storage_established_channels(model, None);
    if to.is_empty() {
        return Vec::new();
    }

    vec![Cmd::BroadcastEphemeralNamespace {
        our_peer_id: model.our_identity.peer_id.clone(),
        doc_id: doc_id.clone(),
        namespace: namespace.clone(),
        store,
        hops_remaining: model.config.ephemeral_hops_network,
        to,
    }]
}

pub fn on_ephemeral_message(
    model: &mut Model,
    from_channel_id: ChannelId,
    doc_id: DocId,
    hops_remaining: u8,
    stores: Vec<EphemeralEntry>,
) -> Vec<Cmd> {
    let mut cmds = Vec::new();
    let factory = model.ephemeral_factory.clone();

    for entry in &stores {
        let Some(state) = model.documents.get_mut(&doc_id) else { continue };
        let ns = entry.namespace.clone();
        let doc_id_for_factory = doc_id.clone();
        let store = state.ephemeral_store(&ns, || factory(&doc_id_for_factory, &ns));
        cmds.push(Cmd::ApplyEphemeral {
            doc_id: doc_id.clone(),
            namespace: ns,
            store,
            data: entry.data.clone(),
        });
    }

    if hops_remaining > 0 {
        let to = non_storage_established_channels(model, Some(from_channel_id));
        if !to.is_empty() {
            cmds.push(Cmd::SendMessage(Envelope::Established {
                to,
                msg: ChannelMsg::Ephemeral { doc_id, hops_remaining: hops_remaining - 1, stores },
            }));
        }
    }

    cmds
}

fn non_storage_established_channels(model: &Model, exclude: Option<ChannelId>) -> Vec<ChannelId> {
    model
        .channels
        .established_channels()
        .filter(|c| c.kind.ephemeral_hop_budget(model.config.ephemeral_hops_network) > 0 && Some(c.id) != exclude)
        .map(|c| c.id)
        .collect()
}
