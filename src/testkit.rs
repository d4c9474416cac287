//! Reference implementations of the pluggable traits: a real (not mocked)
//! CRDT document backed by `automerge`, an in-memory ephemeral store, and
//! two `Adapter`s — an in-process bridge for testing two repos against
//! each other, and a storage adapter persisting documents to memory.
//!
//! Grounded on `freeq-server`'s `crdt.rs` (`AutoCommit` wrapped for async
//! access, actor identity, save/load) and `s2s.rs`'s single per-link task
//! driven by an `mpsc` channel.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use automerge::{transaction::Transactable, AutoCommit, ObjType, ReadDoc};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::adapter::{Adapter, AdapterEvent};
use crate::channel::{ChannelId, ChannelKind};
use crate::document::{CrdtDoc, LocalUpdateCallback, SubscriptionToken};
use crate::ephemeral::{EphemeralCallback, EphemeralStore, PeerId};
use crate::error::SyncError;
use crate::wire::{ChannelMsg, VersionVector};

/// A real `automerge` document behind the [`CrdtDoc`] seam. Unlike
/// `ClusterDoc` this crate's synchronizer never reads document content —
/// so there is no schema here, just save/load/merge plumbing.
pub struct AutomergeDoc {
    doc: Mutex<AutoCommit>,
    subscriptions: Mutex<HashMap<SubscriptionToken, LocalUpdateCallback>>,
    next_token: AtomicU64,
}

impl AutomergeDoc {
    pub fn new(actor_id: &str) -> Self {
        let actor = automerge::ActorId::from(actor_id.as_bytes());
        Self {
            doc: Mutex::new(AutoCommit::new().with_actor(actor)),
            subscriptions: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(0),
        }
    }

    pub fn load(data: &[u8], actor_id: &str) -> Result<Self, automerge::AutomergeError> {
        let actor = automerge::ActorId::from(actor_id.as_bytes());
        let doc = AutoCommit::load(data)?.with_actor(actor);
        Ok(Self {
            doc: Mutex::new(doc),
            subscriptions: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(0),
        })
    }

    fn notify(&self) {
        for callback in self.subscriptions.lock().expect("doc lock poisoned").values() {
            callback();
        }
    }
}

impl CrdtDoc for AutomergeDoc {
    fn version(&self) -> VersionVector {
        let mut doc = self.doc.lock().expect("doc lock poisoned");
        let mut heads: Vec<automerge::ChangeHash> = doc.get_heads();
        heads.sort();
        let mut bytes = Vec::with_capacity(heads.len() * 32);
        for head in heads {
            bytes.extend_from_slice(&head.0);
        }
        VersionVector(bytes)
    }

    /// Always ships a full snapshot. A production `CrdtDoc` backend may
    /// diff against `from` to save bandwidth; this reference
    /// implementation favors simplicity over that optimization.
    fn export(&self, _from: Option<&VersionVector>) -> Vec<u8> {
        self.doc.lock().expect("doc lock poisoned").save()
    }

    fn import(&self, data: &[u8]) {
        let Ok(mut incoming) = AutoCommit::load(data) else {
            tracing::warn!("dropping undecodable automerge bytes");
            return;
        };
        let mut doc = self.doc.lock().expect("doc lock poisoned");
        if let Err(err) = doc.merge(&mut incoming) {
            tracing::warn!(%err, "automerge merge failed");
            return;
        }
        drop(doc);
        self.notify();
    }

    fn subscribe_local_updates(&self, callback: LocalUpdateCallback) -> SubscriptionToken {
        let token = SubscriptionToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.subscriptions.lock().expect("doc lock poisoned").insert(token, callback);
        token
    }

    fn unsubscribe(&self, token: SubscriptionToken) {
        self.subscriptions.lock().expect("doc lock poisoned").remove(&token);
    }

    /// `edit` downcasts to `&mut automerge::AutoCommit`, so applications
    /// use automerge's own `Transactable` API (`put`, `insert`, ...)
    /// directly against the live document.
    fn change(&self, edit: Box<dyn FnOnce(&mut dyn Any) + '_>) {
        let mut doc = self.doc.lock().expect("doc lock poisoned");
        edit(&mut *doc as &mut dyn Any);
        drop(doc);
        self.notify();
    }

    /// Downcasts to `&AutomergeDoc` itself (not the inner `AutoCommit`,
    /// which lives behind a lock) — callers read through the same
    /// methods this module exposes, e.g. by re-locking internally.
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl AutomergeDoc {
    /// Convenience reader for tests: looks up a string value at
    /// `root.<key>`, matching the shape [`ensure_root_map`] builds.
    pub fn get_string(&self, key: &str) -> Option<String> {
        let mut doc = self.doc.lock().expect("doc lock poisoned");
        let (value, _) = doc.get(automerge::ROOT, key).ok()??;
        match value {
            automerge::Value::Scalar(s) => match s.as_ref() {
                automerge::ScalarValue::Str(s) => Some(s.to_string()),
                _ => None,
            },
            _ => None,
        }
    }
}

/// Convenience used by tests/demos: ensure a `"root"` map key exists so
/// callers have somewhere to `put` scalar values without first creating
/// an object themselves.
pub fn ensure_root_map(doc: &mut AutoCommit, key: &str) -> automerge::ObjId {
    match doc.get(automerge::ROOT, key) {
        Ok(Some((automerge::Value::Object(ObjType::Map), id))) => id,
        _ => doc
            .put_object(automerge::ROOT, key, ObjType::Map)
            .expect("creating a root map key cannot fail"),
    }
}

struct StoredEntry {
    value: Value,
    seq: u64,
}

/// In-memory ephemeral store keyed by peer id; last-write-wins per peer
/// by a local logical clock (no automerge involved — presence data is
/// explicitly out of CRDT scope, matching `crdt.rs`'s design principle
/// that presence is not durable/convergent state).
pub struct MemoryEphemeralStore {
    entries: Mutex<HashMap<PeerId, StoredEntry>>,
    next_seq: AtomicU64,
    subscriptions: Mutex<HashMap<SubscriptionToken, EphemeralCallback>>,
    next_token: AtomicU64,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct WireEntry {
    peer_id: String,
    value: Value,
    seq: u64,
}

impl Default for MemoryEphemeralStore {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            subscriptions: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(0),
        }
    }
}

impl MemoryEphemeralStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes this node's own presence value under `peer_id`, bumping
    /// its sequence number so remote merges prefer it over anything
    /// they've already seen from us.
    pub fn set_local(&self, peer_id: &str, value: Value) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.entries
            .lock()
            .expect("store lock poisoned")
            .insert(peer_id.to_string(), StoredEntry { value, seq });
        self.notify();
    }

    fn notify(&self) {
        for callback in self.subscriptions.lock().expect("store lock poisoned").values() {
            callback();
        }
    }
}

impl EphemeralStore for MemoryEphemeralStore {
    fn encode_all(&self) -> Vec<u8> {
        let entries = self.entries.lock().expect("store lock poisoned");
        let wire: Vec<WireEntry> = entries
            .iter()
            .map(|(peer_id, entry)| WireEntry { peer_id: peer_id.clone(), value: entry.value.clone(), seq: entry.seq })
            .collect();
        serde_json::to_vec(&wire).unwrap_or_default()
    }

    fn apply(&self, data: &[u8]) -> Result<(), SyncError> {
        if data.is_empty() {
            // Explicit absence still fires local observers (spec §4.5.5).
            self.notify();
            return Ok(());
        }
        let wire: Vec<WireEntry> = serde_json::from_slice(data).map_err(|err| SyncError::EphemeralApplyFailure {
            doc_id: String::new(),
            namespace: String::new(),
            detail: err.to_string(),
        })?;
        let mut entries = self.entries.lock().expect("store lock poisoned");
        for item in wire {
            match entries.get(&item.peer_id) {
                Some(existing) if existing.seq >= item.seq => continue,
                _ => {
                    entries.insert(item.peer_id, StoredEntry { value: item.value, seq: item.seq });
                }
            }
        }
        drop(entries);
        self.notify();
        Ok(())
    }

    fn get_all_states(&self) -> HashMap<PeerId, Value> {
        self.entries
            .lock()
            .expect("store lock poisoned")
            .iter()
            .map(|(peer_id, entry)| (peer_id.clone(), entry.value.clone()))
            .collect()
    }

    fn delete(&self, peer_id: &str) {
        self.entries.lock().expect("store lock poisoned").remove(peer_id);
        self.notify();
    }

    fn touch(&self) {
        // Entries carry no expiry here; `encode_all` always reflects the
        // latest local state, so there is nothing to refresh.
    }

    fn subscribe(&self, callback: EphemeralCallback) -> SubscriptionToken {
        let token = SubscriptionToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.subscriptions.lock().expect("store lock poisoned").insert(token, callback);
        token
    }

    fn unsubscribe(&self, token: SubscriptionToken) {
        self.subscriptions.lock().expect("store lock poisoned").remove(&token);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct BridgeLink {
    channel_id: ChannelId,
    kind: ChannelKind,
    to_peer: mpsc::UnboundedSender<ChannelMsg>,
}

/// An in-process transport pairing two repos via `tokio::sync::mpsc`,
/// grounded on `s2s.rs`'s one-task-per-link model but without any actual
/// socket — useful for integration tests that need two full `Repo`
/// instances talking to each other in one process.
pub struct BridgeAdapter {
    adapter_id: String,
    links: Mutex<Vec<BridgeLink>>,
    events_tx: Mutex<Option<mpsc::UnboundedSender<AdapterEvent>>>,
}

impl BridgeAdapter {
    pub fn new(adapter_id: impl Into<String>) -> Self {
        Self {
            adapter_id: adapter_id.into(),
            links: Mutex::new(Vec::new()),
            events_tx: Mutex::new(None),
        }
    }

    /// Wires `self` to `other` as peers of the given kind, each getting a
    /// fresh channel id and a known remote peer id for the handshake
    /// tie-break, then spawns one forwarding task per direction.
    pub fn link(self: &Arc<Self>, channel_id_here: ChannelId, other: &Arc<Self>, channel_id_there: ChannelId, kind: ChannelKind, known_peer_id: Option<String>) {
        let (here_tx, mut here_rx) = mpsc::unbounded_channel::<ChannelMsg>();
        let (there_tx, mut there_rx) = mpsc::unbounded_channel::<ChannelMsg>();

        self.links.lock().expect("links lock poisoned").push(BridgeLink { channel_id: channel_id_here, kind, to_peer: there_tx });
        other.links.lock().expect("links lock poisoned").push(BridgeLink { channel_id: channel_id_there, kind, to_peer: here_tx });

        let here = Arc::clone(self);
        let here_id = channel_id_here;
        tokio::spawn(async move {
            while let Some(msg) = there_rx.recv().await {
                let tx = here.events_tx.lock().expect("events lock poisoned").clone();
                if let Some(tx) = tx {
                    let _ = tx.send(AdapterEvent::Receive { from_channel_id: here_id, message: msg });
                }
            }
        });

        let there = Arc::clone(other);
        let there_id = channel_id_there;
        tokio::spawn(async move {
            while let Some(msg) = here_rx.recv().await {
                let tx = there.events_tx.lock().expect("events lock poisoned").clone();
                if let Some(tx) = tx {
                    let _ = tx.send(AdapterEvent::Receive { from_channel_id: there_id, message: msg });
                }
            }
        });

        let events_tx_here = self.events_tx.lock().expect("events lock poisoned").clone();
        if let Some(tx) = events_tx_here {
            let _ = tx.send(AdapterEvent::ChannelOpen {
                channel_id: channel_id_here,
                kind,
                adapter_id: self.adapter_id.clone(),
                known_peer_id: known_peer_id.clone(),
            });
        }
        let events_tx_there = other.events_tx.lock().expect("events lock poisoned").clone();
        if let Some(tx) = events_tx_there {
            let _ = tx.send(AdapterEvent::ChannelOpen {
                channel_id: channel_id_there,
                kind,
                adapter_id: other.adapter_id.clone(),
                known_peer_id: None,
            });
        }
    }
}

#[async_trait]
impl Adapter for BridgeAdapter {
    fn adapter_id(&self) -> &str {
        &self.adapter_id
    }

    fn adapter_type(&self) -> &str {
        "bridge"
    }

    async fn start(&self, events: mpsc::UnboundedSender<AdapterEvent>) {
        *self.events_tx.lock().expect("events lock poisoned") = Some(events);
    }

    async fn stop(&self) {
        *self.events_tx.lock().expect("events lock poisoned") = None;
        self.links.lock().expect("links lock poisoned").clear();
    }

    async fn flush(&self) {}

    fn channels(&self) -> Vec<(ChannelId, ChannelKind)> {
        self.links.lock().expect("links lock poisoned").iter().map(|l| (l.channel_id, l.kind)).collect()
    }

    async fn send_establishment(&self, channel_id: ChannelId, msg: ChannelMsg) -> usize {
        self.send(&[channel_id], msg).await
    }

    async fn send(&self, channel_ids: &[ChannelId], msg: ChannelMsg) -> usize {
        let links = self.links.lock().expect("links lock poisoned");
        let mut sent = 0;
        for link in links.iter() {
            if channel_ids.contains(&link.channel_id) && link.to_peer.send(msg.clone()).is_ok() {
                sent += 1;
            }
        }
        sent
    }
}

/// In-memory storage adapter: one [`ChannelKind::Storage`] channel
/// exposed to the synchronizer as an ordinary peer (spec §4.7) that
/// simply persists every document it is handed.
///
/// Shaped like `policy::store::PolicyStore` (a single lock-guarded
/// backing store behind a narrow API) but kept in memory — a durable
/// variant would swap the `HashMap` for a real embedded database without
/// changing the `Adapter` surface.
pub struct StorageAdapter {
    adapter_id: String,
    channel_id: ChannelId,
    docs: Mutex<HashMap<String, Vec<u8>>>,
    events_tx: Mutex<Option<mpsc::UnboundedSender<AdapterEvent>>>,
}

impl StorageAdapter {
    pub fn new(adapter_id: impl Into<String>, channel_id: ChannelId) -> Self {
        Self {
            adapter_id: adapter_id.into(),
            channel_id,
            docs: Mutex::new(HashMap::new()),
            events_tx: Mutex::new(None),
        }
    }

    pub fn snapshot(&self, doc_id: &str) -> Option<Vec<u8>> {
        self.docs.lock().expect("docs lock poisoned").get(doc_id).cloned()
    }
}

#[async_trait]
impl Adapter for StorageAdapter {
    fn adapter_id(&self) -> &str {
        &self.adapter_id
    }

    fn adapter_type(&self) -> &str {
        "storage"
    }

    async fn start(&self, events: mpsc::UnboundedSender<AdapterEvent>) {
        let _ = events.send(AdapterEvent::ChannelOpen {
            channel_id: self.channel_id,
            kind: ChannelKind::Storage,
            adapter_id: self.adapter_id.clone(),
            known_peer_id: None,
        });
        *self.events_tx.lock().expect("events lock poisoned") = Some(events);
    }

    async fn stop(&self) {
        *self.events_tx.lock().expect("events lock poisoned") = None;
    }

    async fn flush(&self) {}

    fn channels(&self) -> Vec<(ChannelId, ChannelKind)> {
        vec![(self.channel_id, ChannelKind::Storage)]
    }

    async fn send_establishment(&self, _channel_id: ChannelId, _msg: ChannelMsg) -> usize {
        // Storage channels are established synthetically the instant they
        // open (`program::handshake::on_channel_open`'s storage branch), so
        // the synchronizer never actually routes establish-request traffic
        // here. Kept as a harmless no-op in case that ever changes.
        0
    }

    async fn send(&self, channel_ids: &[ChannelId], msg: ChannelMsg) -> usize {
        if !channel_ids.contains(&self.channel_id) {
            return 0;
        }
        match msg {
            ChannelMsg::Sync { doc_id, transmission } => {
                use crate::wire::SyncTransmission::*;
                match transmission {
                    Snapshot { data, .. } | Update { data, .. } => {
                        self.docs.lock().expect("docs lock poisoned").insert(doc_id, data);
                    }
                    UpToDate { .. } | Unavailable => {}
                }
                1
            }
            ChannelMsg::Delete { doc_id } => {
                self.docs.lock().expect("docs lock poisoned").remove(&doc_id);
                1
            }
            // Storage eagerly sync-requests every announced doc rather than
            // selectively deciding (spec §4.6); it always asks for a full
            // snapshot, matching `AutomergeDoc::export`'s own simplification
            // of never diffing for this reference implementation. The
            // request is looped back through `events_tx` as if storage, a
            // peer like any other, had sent it to us.
            ChannelMsg::DirectoryResponse { doc_ids } => {
                let tx = self.events_tx.lock().expect("events lock poisoned").clone();
                if let Some(tx) = tx {
                    for doc_id in doc_ids {
                        let _ = tx.send(AdapterEvent::Receive {
                            from_channel_id: self.channel_id,
                            message: ChannelMsg::SyncRequest {
                                doc_id,
                                requester_version: VersionVector::empty(),
                                bidirectional: true,
                            },
                        });
                    }
                }
                1
            }
            ChannelMsg::Batch { messages } => {
                let mut sent = 0;
                for m in messages {
                    sent += self.send(channel_ids, m).await;
                }
                sent
            }
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn automerge_docs_converge_after_import() {
        let a = AutomergeDoc::new("a");
        let b = AutomergeDoc::new("b");

        a.change(Box::new(|doc: &mut dyn Any| {
            let doc = doc.downcast_mut::<AutoCommit>().unwrap();
            let map = ensure_root_map(doc, "root");
            doc.put(&map, "hello", "world").unwrap();
        }));

        let snapshot = a.export(None);
        b.import(&snapshot);

        assert_eq!(a.version(), b.version());
    }

    #[test]
    fn ephemeral_store_last_write_wins_by_seq() {
        let store = MemoryEphemeralStore::new();
        store.set_local("me", serde_json::json!({"cursor": 1}));
        let encoded = store.encode_all();

        let remote = MemoryEphemeralStore::new();
        remote.apply(&encoded).unwrap();
        assert_eq!(remote.get_all_states().get("me"), Some(&serde_json::json!({"cursor": 1})));

        // A stale copy of the same peer's earlier state must not win.
        let stale = serde_json::to_vec(&vec![WireEntry { peer_id: "me".into(), value: serde_json::json!({"cursor": 0}), seq: 0 }]).unwrap();
        remote.apply(&stale).unwrap();
        assert_eq!(remote.get_all_states().get("me"), Some(&serde_json::json!({"cursor": 1})));
    }

    #[tokio::test]
    async fn bridge_adapter_delivers_across_link() {
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();

        let a = Arc::new(BridgeAdapter::new("a"));
        let b = Arc::new(BridgeAdapter::new("b"));
        a.start(tx_a).await;
        b.start(tx_b).await;

        a.link(ChannelId(0), &b, ChannelId(0), ChannelKind::Network, None);

        assert!(matches!(rx_a.recv().await, Some(AdapterEvent::ChannelOpen { .. })));
        assert!(matches!(rx_b.recv().await, Some(AdapterEvent::ChannelOpen { .. })));

        a.send(&[ChannelId(0)], ChannelMsg::DirectoryRequest).await;
        match rx_b.recv().await {
            Some(AdapterEvent::Receive { message: ChannelMsg::DirectoryRequest, .. }) => {}
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
