//! Handshake phase: `Pending -> Established` (spec §4.4, §4.5.1).

use tracing::Level;

use super::{dispatch_established, Cmd, Model};
use crate::channel::{ChannelId, ChannelKind};
use crate::wire::{ChannelMsg, Envelope};

pub fn on_channel_open(
    model: &mut Model,
    channel_id: ChannelId,
    kind: ChannelKind,
    adapter_id: String,
    known_peer_id: Option<String>,
) -> Vec<Cmd> {
    model
        .channels
        .insert_pending(channel_id, kind, adapter_id.clone(), model.config.pending_buffer_capacity);

    if kind == ChannelKind::Storage {
        // A storage backend has no establish-request/response exchange of
        // its own (spec §4.6): it is addressed as a peer the instant its
        // channel opens, under a synthetic identity derived from the
        // adapter id.
        let identity = crate::identity::RepoIdentity::new(
            format!("storage:{adapter_id}"),
            adapter_id,
            crate::identity::PeerKind::Service,
        );
        return complete_handshake(model, channel_id, identity);
    }

    // Both sides send unconditionally unless we already know the remote
    // id and it sorts after ours — see `SPEC_FULL.md` §4.4's tie-break
    // resolution.
    let should_send = match &known_peer_id {
        None => true,
        Some(remote_id) => model.our_identity.sorts_before(remote_id),
    };

    if !should_send {
        return vec![Cmd::log(
            Level::DEBUG,
            format!("suppressing establish-request on {channel_id:?}: remote {known_peer_id:?} sorts first"),
        )];
    }

    if let Some(channel) = model.channels.get_mut(channel_id) {
        if let crate::channel::ChannelState::Pending { our_request_sent, .. } = &mut channel.state {
            *our_request_sent = true;
        }
    }

    vec![Cmd::SendEstablishmentMessage {
        channel_id,
        msg: ChannelMsg::EstablishRequest { identity: model.our_identity.clone() },
    }]
}

pub fn on_channel_close(model: &mut Model, channel_id: ChannelId) -> Vec<Cmd> {
    let Some(channel) = model.channels.remove(channel_id) else {
        return Vec::new();
    };
    let Some(peer_id) = channel.state.peer().map(|p| p.peer_id.clone()) else {
        return Vec::new();
    };
    model.peers.remove_channel(&peer_id, channel_id);

    for (_, state) in model.documents.iter() {
        for store in state.ephemeral_stores.values() {
            store.delete(&peer_id);
        }
    }

    vec![Cmd::log(Level::INFO, format!("channel {channel_id:?} closed, peer {peer_id} disconnected"))]
}

/// Handles a message arriving on a channel that has not yet completed its
/// handshake: either it advances the handshake, or it gets buffered
/// (spec §4.4).
pub fn on_pending_receive(model: &mut Model, channel_id: ChannelId, message: ChannelMsg) -> Vec<Cmd> {
    match message {
        ChannelMsg::EstablishRequest { identity } => {
            let mut cmds = vec![Cmd::SendEstablishmentMessage {
                channel_id,
                msg: ChannelMsg::EstablishResponse { identity: model.our_identity.clone() },
            }];
            cmds.extend(complete_handshake(model, channel_id, identity));
            cmds
        }
        ChannelMsg::EstablishResponse { identity } => complete_handshake(model, channel_id, identity),
        other => {
            let Some(channel) = model.channels.get_mut(channel_id) else {
                return Vec::new();
            };
            if channel.buffer(other).is_err() {
                model.channels.reset(channel_id);
                return vec![Cmd::log(
                    Level::WARN,
                    format!("pending buffer overflow on {channel_id:?}, channel reset"),
                )];
            }
            Vec::new()
        }
    }
}

fn complete_handshake(model: &mut Model, channel_id: ChannelId, peer_identity: crate::identity::RepoIdentity) -> Vec<Cmd> {
    let Some(channel) = model.channels.get_mut(channel_id) else {
        return Vec::new();
    };
    let buffered = channel.drain_buffer();
    channel.establish(peer_identity.clone());

    model.peers.get_or_insert(&peer_identity).channels.insert(channel_id);

    let mut cmds = vec![
        Cmd::log(Level::INFO, format!("channel {channel_id:?} established with peer {}", peer_identity.peer_id)),
        Cmd::SendMessage(Envelope::Established { to: vec![channel_id], msg: ChannelMsg::DirectoryRequest }),
    ];

    for msg in buffered {
        cmds.extend(dispatch_established(model, channel_id, msg));
    }

    cmds
}
