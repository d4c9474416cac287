//! The Synchronizer Program: an Elm-style `update(msg, model) -> commands`
//! core (spec §4.5). `Model` owns every registry; `update` is the single
//! entry point that mutates it and returns the `Cmd`s the executor must
//! run. No other component mutates the model (spec §5).
//!
//! Grounded on `s2s.rs`'s single ordered-dispatch design: one task owns
//! the peer/channel state, everything else talks to it through messages.

mod directory;
mod ephemeral_gossip;
mod handshake;
mod heartbeat;
mod sync;

use std::sync::Arc;

use tracing::Level;

use crate::channel::{ChannelId, ChannelKind, ChannelRegistry};
use crate::config::SynchronizerConfig;
use crate::document::{CrdtDoc, DocumentRegistry};
use crate::ephemeral::EphemeralStore;
use crate::identity::RepoIdentity;
use crate::peer::PeerRegistry;
use crate::rules::Rules;
use crate::wire::{ChannelMsg, DocId, Envelope, Namespace};

pub type DocFactory = Arc<dyn Fn(&DocId) -> Arc<dyn CrdtDoc> + Send + Sync>;
pub type EphemeralFactory = Arc<dyn Fn(&DocId, &Namespace) -> Arc<dyn EphemeralStore> + Send + Sync>;

#[derive(Debug, Clone)]
pub enum Msg {
    Start,
    Heartbeat,
    ChannelOpen {
        channel_id: ChannelId,
        kind: ChannelKind,
        adapter_id: String,
        /// Peer id learned out of band (e.g. a cached reconnect identity),
        /// used only for the handshake tie-break (spec §4.4, §9 resolution
        /// in `SPEC_FULL.md`).
        known_peer_id: Option<String>,
    },
    ChannelClose {
        channel_id: ChannelId,
    },
    ChannelReceiveMessage {
        from_channel_id: ChannelId,
        message: ChannelMsg,
    },
    LocalDocChange {
        doc_id: DocId,
    },
    LocalEphemeralChange {
        doc_id: DocId,
        namespace: Namespace,
    },
    DocRequested {
        doc_id: DocId,
    },
    DocDeleted {
        doc_id: DocId,
    },
    /// Internal feedback from the executor once `Cmd::SubscribeDoc`
    /// completes; not part of `spec.md`'s external message set but needed
    /// to thread the subscription token back into the model.
    DocSubscribed {
        doc_id: DocId,
        token: crate::document::SubscriptionToken,
    },
}

pub enum Cmd {
    SendMessage(Envelope),
    SendEstablishmentMessage { channel_id: ChannelId, msg: ChannelMsg },
    SubscribeDoc { doc_id: DocId, doc: Arc<dyn CrdtDoc> },
    UnsubscribeDoc { doc: Arc<dyn CrdtDoc>, token: crate::document::SubscriptionToken },
    ApplyEphemeral { doc_id: DocId, namespace: Namespace, store: Arc<dyn EphemeralStore>, data: Vec<u8> },
    BroadcastEphemeralBatch {
        our_peer_id: String,
        hops_remaining: u8,
        entries: Vec<(DocId, Namespace, Arc<dyn EphemeralStore>)>,
        to: Vec<ChannelId>,
    },
    BroadcastEphemeralNamespace {
        our_peer_id: String,
        doc_id: DocId,
        namespace: Namespace,
        store: Arc<dyn EphemeralStore>,
        hops_remaining: u8,
        to: Vec<ChannelId>,
    },
    Dispatch(Msg),
    Batch(Vec<Cmd>),
    Log { level: Level, message: String },
}

impl Cmd {
    pub fn log(level: Level, message: impl Into<String>) -> Cmd {
        Cmd::Log { level, message: message.into() }
    }
}

/// Owns every piece of mutable state the program reasons about. The only
/// writer is [`update`]; everything else is read-only access from the
/// executor or the Repo facade.
pub struct Model {
    pub our_identity: RepoIdentity,
    pub config: SynchronizerConfig,
    pub rules: Rules,
    pub channels: ChannelRegistry,
    pub peers: PeerRegistry,
    pub documents: DocumentRegistry,
    pub doc_factory: DocFactory,
    pub ephemeral_factory: EphemeralFactory,
}

impl Model {
    pub fn new(
        our_identity: RepoIdentity,
        config: SynchronizerConfig,
        rules: Rules,
        doc_factory: DocFactory,
        ephemeral_factory: EphemeralFactory,
    ) -> Self {
        Self {
            our_identity,
            config,
            rules,
            channels: ChannelRegistry::new(),
            peers: PeerRegistry::new(),
            documents: DocumentRegistry::new(),
            doc_factory,
            ephemeral_factory,
        }
    }
}

/// The single entry point: dispatches `msg` to the handler for its
/// phase and returns the commands the executor must run.
pub fn update(model: &mut Model, msg: Msg) -> Vec<Cmd> {
    match msg {
        Msg::Start => vec![Cmd::log(Level::INFO, "synchronizer started")],
        Msg::Heartbeat => heartbeat::on_heartbeat(model),
        Msg::ChannelOpen { channel_id, kind, adapter_id, known_peer_id } => {
            handshake::on_channel_open(model, channel_id, kind, adapter_id, known_peer_id)
        }
        Msg::ChannelClose { channel_id } => handshake::on_channel_close(model, channel_id),
        Msg::ChannelReceiveMessage { from_channel_id, message } => {
            on_channel_receive_message(model, from_channel_id, message)
        }
        Msg::LocalDocChange { doc_id } => sync::on_local_doc_change(model, &doc_id),
        Msg::LocalEphemeralChange { doc_id, namespace } => {
            ephemeral_gossip::on_local_ephemeral_change(model, &doc_id, &namespace)
        }
        Msg::DocRequested { doc_id } => on_doc_requested(model, doc_id),
        Msg::DocDeleted { doc_id } => on_doc_deleted(model, doc_id),
        Msg::DocSubscribed { doc_id, token } => {
            if let Some(state) = model.documents.get_mut(&doc_id) {
                state.subscription_token = Some(token);
            }
            Vec::new()
        }
    }
}

/// Dispatches a message arriving on an established (or still-pending)
/// channel to its phase handler, buffering it if the channel has not yet
/// completed its handshake (spec §4.4).
fn on_channel_receive_message(model: &mut Model, from_channel_id: ChannelId, message: ChannelMsg) -> Vec<Cmd> {
    let Some(channel) = model.channels.get(from_channel_id) else {
        return vec![Cmd::log(
            Level::WARN,
            format!("message on unknown channel {from_channel_id:?}, dropping"),
        )];
    };

    if !channel.state.is_established() {
        return handshake::on_pending_receive(model, from_channel_id, message);
    }

    dispatch_established(model, from_channel_id, message)
}

/// Dispatches one already-unwrapped message against an `Established`
/// channel. `Batch` is flattened here so every phase handler only ever
/// sees concrete message kinds.
pub(crate) fn dispatch_established(model: &mut Model, from_channel_id: ChannelId, message: ChannelMsg) -> Vec<Cmd> {
    match message {
        ChannelMsg::EstablishRequest { .. } | ChannelMsg::EstablishResponse { .. } => {
            vec![Cmd::log(
                Level::WARN,
                format!("unexpected handshake message on established channel {from_channel_id:?}"),
            )]
        }
        ChannelMsg::DirectoryRequest => directory::on_directory_request(model, from_channel_id),
        ChannelMsg::DirectoryResponse { doc_ids } => directory::on_directory_response(model, from_channel_id, doc_ids),
        ChannelMsg::SyncRequest { doc_id, requester_version, bidirectional } => {
            sync::on_sync_request(model, from_channel_id, doc_id, requester_version, bidirectional)
        }
        ChannelMsg::Sync { doc_id, transmission } => sync::on_sync_response(model, from_channel_id, doc_id, transmission),
        ChannelMsg::Delete { doc_id } => {
            model.documents.remove(&doc_id);
            vec![Cmd::log(Level::INFO, format!("peer on {from_channel_id:?} deleted {doc_id}"))]
        }
        ChannelMsg::Ephemeral { doc_id, hops_remaining, stores } => {
            ephemeral_gossip::on_ephemeral_message(model, from_channel_id, doc_id, hops_remaining, stores)
        }
        ChannelMsg::Batch { messages } => {
            let mut cmds = Vec::new();
            for m in messages {
                cmds.extend(dispatch_established(model, from_channel_id, m));
            }
            cmds
        }
    }
}

fn on_doc_requested(model: &mut Model, doc_id: DocId) -> Vec<Cmd> {
    if model.documents.contains(&doc_id) {
        return Vec::new();
    }
    let doc = (model.doc_factory)(&doc_id);
    let state = crate::document::DocState::new(doc_id.clone(), doc.clone());
    model.documents.insert(state);
    vec![Cmd::SubscribeDoc { doc_id, doc }]
}

fn on_doc_deleted(model: &mut Model, doc_id: DocId) -> Vec<Cmd> {
    let mut cmds = Vec::new();
    if let Some(state) = model.documents.remove(&doc_id) {
        if let Some(token) = state.subscription_token {
            cmds.push(Cmd::UnsubscribeDoc { doc: state.doc, token });
        }
    }
    let targets: Vec<ChannelId> = model.channels.established_channels().map(|c| c.id).collect();
    if !targets.is_empty() {
        cmds.push(Cmd::SendMessage(Envelope::Established {
            to: targets,
            msg: ChannelMsg::Delete { doc_id },
        }));
    }
    cmds
}
