//! The Repo Facade: thin assembly wiring adapters, rules, identity, and
//! the Synchronizer Program; the only part of this crate external code
//! touches directly (spec §2, §6).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::adapter::{Adapter, AdapterEvent, AdapterManager};
use crate::channel::ChannelId;
use crate::config::SynchronizerConfig;
use crate::document::CrdtDoc;
use crate::ephemeral::EphemeralStore;
use crate::error::SyncError;
use crate::identity::RepoIdentity;
use crate::program::{self, DocFactory, EphemeralFactory, Model, Msg};
use crate::rules::Rules;
use crate::wire::{DocId, Namespace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyStatus {
    Absent,
    Pending,
    Synced,
}

/// Derived per-(doc, identity) view for driving UI; never persisted
/// (spec §3 `ReadyState`).
#[derive(Debug, Clone)]
pub struct ReadyState {
    pub peer_id: String,
    pub status: ReadyStatus,
    pub channels: Vec<ChannelId>,
}

pub struct RepoConfig {
    pub identity: RepoIdentity,
    pub adapters: Vec<Arc<dyn Adapter>>,
    pub rules: Rules,
    pub config: SynchronizerConfig,
    pub doc_factory: DocFactory,
    pub ephemeral_factory: EphemeralFactory,
}

enum RepoRequest {
    GetDoc { doc_id: DocId, reply: oneshot::Sender<Arc<dyn CrdtDoc>> },
    Has { doc_id: DocId, reply: oneshot::Sender<bool> },
    ReadyStates { doc_id: DocId, reply: oneshot::Sender<Vec<ReadyState>> },
    EphemeralStore {
        doc_id: DocId,
        namespace: Namespace,
        reply: oneshot::Sender<Arc<dyn EphemeralStore>>,
    },
    AddAdapter { adapter: Arc<dyn Adapter>, reply: oneshot::Sender<()> },
    RemoveAdapter { adapter_id: String, reply: oneshot::Sender<()> },
}

/// Thin external handle. All real state lives inside the dispatch task
/// spawned by [`Repo::new`]; this struct only holds senders into it, so
/// cloning a `Repo` is cheap and every clone reaches the same program
/// loop (spec §5: the Synchronizer owns the sole mutable model).
#[derive(Clone)]
pub struct Repo {
    our_identity: RepoIdentity,
    msg_tx: mpsc::UnboundedSender<Msg>,
    request_tx: mpsc::UnboundedSender<RepoRequest>,
}

impl Repo {
    pub fn new(config: RepoConfig) -> Self {
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let our_identity = config.identity.clone();
        let heartbeat_interval = config.config.heartbeat_interval;

        let model = Model::new(
            config.identity,
            config.config,
            config.rules,
            config.doc_factory,
            config.ephemeral_factory,
        );
        let mut manager = AdapterManager::new(events_tx);
        let initial_adapters = config.adapters;

        let repo = Self { our_identity, msg_tx: msg_tx.clone(), request_tx };

        tokio::spawn(async move {
            for adapter in initial_adapters {
                manager.add_adapter(adapter).await;
            }
            let executor = crate::executor::Executor::new(manager, msg_tx.clone());
            run_dispatch_loop(model, executor, msg_rx, request_rx, events_rx).await;
        });

        let heartbeat_tx = repo.msg_tx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat_interval);
            loop {
                ticker.tick().await;
                if heartbeat_tx.send(Msg::Heartbeat).is_err() {
                    break;
                }
            }
        });

        let _ = repo.msg_tx.send(Msg::Start);
        repo
    }

    pub fn identity(&self) -> &RepoIdentity {
        &self.our_identity
    }

    pub async fn get(&self, doc_id: impl Into<DocId>) -> DocHandle {
        let doc_id = doc_id.into();
        let _ = self.msg_tx.send(Msg::DocRequested { doc_id: doc_id.clone() });
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.request_tx.send(RepoRequest::GetDoc { doc_id: doc_id.clone(), reply: reply_tx });
        let doc = reply_rx.await.expect("dispatch loop dropped without replying");
        DocHandle {
            doc_id,
            doc,
            msg_tx: self.msg_tx.clone(),
            request_tx: self.request_tx.clone(),
        }
    }

    pub async fn has(&self, doc_id: &str) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.request_tx.send(RepoRequest::Has { doc_id: doc_id.to_string(), reply: reply_tx });
        reply_rx.await.unwrap_or(false)
    }

    pub fn delete(&self, doc_id: impl Into<DocId>) {
        let _ = self.msg_tx.send(Msg::DocDeleted { doc_id: doc_id.into() });
    }

    pub async fn add_adapter(&self, adapter: Arc<dyn Adapter>) {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.request_tx.send(RepoRequest::AddAdapter { adapter, reply: reply_tx });
        let _ = reply_rx.await;
    }

    pub async fn remove_adapter(&self, adapter_id: &str) {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.request_tx.send(RepoRequest::RemoveAdapter { adapter_id: adapter_id.to_string(), reply: reply_tx });
        let _ = reply_rx.await;
    }

    /// Flushes and stops every adapter. Idempotent: calling this again on
    /// a repo whose dispatch task has already exited is a harmless no-op
    /// (spec §5).
    pub async fn shutdown(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.request_tx.send(RepoRequest::RemoveAdapter { adapter_id: String::new(), reply: reply_tx }).is_err() {
            return;
        }
        let _ = reply_rx.await;
    }
}

/// A handle to a single document: the public surface real applications
/// mutate, view, and wait on (spec §6).
pub struct DocHandle {
    doc_id: DocId,
    doc: Arc<dyn CrdtDoc>,
    msg_tx: mpsc::UnboundedSender<Msg>,
    request_tx: mpsc::UnboundedSender<RepoRequest>,
}

impl DocHandle {
    pub fn doc_id(&self) -> &DocId {
        &self.doc_id
    }

    /// Applies a local edit. The document's concrete type is opaque here
    /// (spec §1 Non-goals); `f` downcasts `&mut dyn Any` to whatever
    /// concrete type the embedding application's `DocFactory` produced.
    pub fn change(&self, f: impl FnOnce(&mut dyn std::any::Any) + '_) {
        self.doc.change(Box::new(f));
    }

    pub fn doc_view(&self) -> &dyn std::any::Any {
        self.doc.as_any()
    }

    pub async fn ephemeral(&self, namespace: impl Into<Namespace>) -> EphemeralHandle {
        let namespace = namespace.into();
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.request_tx.send(RepoRequest::EphemeralStore {
            doc_id: self.doc_id.clone(),
            namespace: namespace.clone(),
            reply: reply_tx,
        });
        let store = reply_rx.await.expect("dispatch loop dropped without replying");
        EphemeralHandle {
            doc_id: self.doc_id.clone(),
            namespace,
            store,
            msg_tx: self.msg_tx.clone(),
        }
    }

    pub async fn ready_states(&self) -> Vec<ReadyState> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self
            .request_tx
            .send(RepoRequest::ReadyStates { doc_id: self.doc_id.clone(), reply: reply_tx });
        reply_rx.await.unwrap_or_default()
    }

    /// Polls [`DocHandle::ready_states`] until every known peer reports
    /// `Synced` (or there are no peers at all), or `timeout` elapses.
    pub async fn wait_for_sync(&self, timeout: Duration) -> Result<(), SyncError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let states = self.ready_states().await;
            if states.iter().all(|s| s.status == ReadyStatus::Synced) {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(SyncError::Timeout(timeout));
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

pub struct EphemeralHandle {
    doc_id: DocId,
    namespace: Namespace,
    store: Arc<dyn EphemeralStore>,
    msg_tx: mpsc::UnboundedSender<Msg>,
}

impl EphemeralHandle {
    pub fn get_all_states(&self) -> std::collections::HashMap<String, serde_json::Value> {
        self.store.get_all_states()
    }

    /// Downcast escape hatch for publishing local state, mirroring
    /// [`DocHandle::doc_view`].
    pub fn store_view(&self) -> &dyn std::any::Any {
        self.store.as_any()
    }

    /// Notifies the synchronizer that this namespace changed locally,
    /// triggering gossip to established peers (spec §4.5.5). The actual
    /// mutation of `self.store`'s contents is the caller's/store's own
    /// business — this method only fires the propagation message.
    pub fn notify_changed(&self) {
        let _ = self.msg_tx.send(Msg::LocalEphemeralChange {
            doc_id: self.doc_id.clone(),
            namespace: self.namespace.clone(),
        });
    }
}

async fn run_dispatch_loop(
    mut model: Model,
    mut executor: crate::executor::Executor,
    mut msg_rx: mpsc::UnboundedReceiver<Msg>,
    mut request_rx: mpsc::UnboundedReceiver<RepoRequest>,
    mut events_rx: mpsc::UnboundedReceiver<AdapterEvent>,
) {
    loop {
        tokio::select! {
            msg = msg_rx.recv() => {
                match msg {
                    Some(msg) => {
                        let cmds = program::update(&mut model, msg);
                        executor.run(cmds).await;
                    }
                    None => break,
                }
            }
            event = events_rx.recv() => {
                match event {
                    Some(event) => {
                        let msg = match event {
                            AdapterEvent::ChannelOpen { channel_id, kind, adapter_id, known_peer_id } => {
                                Msg::ChannelOpen { channel_id, kind, adapter_id, known_peer_id }
                            }
                            AdapterEvent::ChannelClose { channel_id } => Msg::ChannelClose { channel_id },
                            AdapterEvent::Receive { from_channel_id, message } => {
                                Msg::ChannelReceiveMessage { from_channel_id, message }
                            }
                        };
                        let cmds = program::update(&mut model, msg);
                        executor.run(cmds).await;
                    }
                    None => {}
                }
            }
            req = request_rx.recv() => {
                match req {
                    Some(req) => handle_request(&mut model, &mut executor, req).await,
                    None => break,
                }
            }
        }
    }
}

async fn handle_request(model: &mut Model, executor: &mut crate::executor::Executor, req: RepoRequest) {
    match req {
        RepoRequest::GetDoc { doc_id, reply } => {
            if !model.documents.contains(&doc_id) {
                let cmds = program::update(model, Msg::DocRequested { doc_id: doc_id.clone() });
                executor.run(cmds).await;
            }
            let doc = model
                .documents
                .get(&doc_id)
                .map(|s| s.doc.clone())
                .expect("DocRequested always creates the entry");
            let _ = reply.send(doc);
        }
        RepoRequest::Has { doc_id, reply } => {
            let _ = reply.send(model.documents.contains(&doc_id));
        }
        RepoRequest::ReadyStates { doc_id, reply } => {
            let mut states = vec![ReadyState {
                peer_id: model.our_identity.peer_id.clone(),
                status: ReadyStatus::Synced,
                channels: Vec::new(),
            }];
            for (peer_id, peer) in model.peers.iter() {
                let status = match peer.doc_sync_states.get(&doc_id) {
                    None => continue,
                    Some(crate::peer::PerDocSyncState::Pending { .. }) => ReadyStatus::Pending,
                    Some(crate::peer::PerDocSyncState::Synced { .. }) => ReadyStatus::Synced,
                    Some(crate::peer::PerDocSyncState::Absent { .. }) => ReadyStatus::Absent,
                };
                states.push(ReadyState { peer_id: peer_id.clone(), status, channels: peer.channels.iter().copied().collect() });
            }
            let _ = reply.send(states);
        }
        RepoRequest::EphemeralStore { doc_id, namespace, reply } => {
            let factory = model.ephemeral_factory.clone();
            if let Some(state) = model.documents.get_mut(&doc_id) {
                let doc_id_for_factory = doc_id.clone();
                let ns_for_factory = namespace.clone();
                let store = state.ephemeral_store(&namespace, || factory(&doc_id_for_factory, &ns_for_factory));
                let _ = reply.send(store);
            }
        }
        RepoRequest::AddAdapter { adapter, reply } => {
            executor.adapters_mut().add_adapter(adapter).await;
            let _ = reply.send(());
        }
        RepoRequest::RemoveAdapter { adapter_id, reply } => {
            if adapter_id.is_empty() {
                executor.adapters_mut().shutdown().await;
            } else {
                let affected = model.channels.channel_ids_for_adapter(&adapter_id);
                executor.adapters_mut().remove_adapter(&adapter_id).await;
                for channel_id in affected {
                    let cmds = program::update(model, Msg::ChannelClose { channel_id });
                    executor.run(cmds).await;
                }
            }
            let _ = reply.send(());
        }
    }
}
