//! The CRDT document boundary and per-document registry (spec §3 `DocState`,
//! §1 Non-goals: the CRDT runtime itself is an external black box reached
//! only through the [`CrdtDoc`] trait).

use std::collections::HashMap;
use std::sync::Arc;

use crate::ephemeral::EphemeralStore;
use crate::wire::{DocId, Namespace, VersionVector};

/// Opaque token returned by a subscription; dropping it does not
/// unsubscribe — callers must call the owning `unsubscribe` explicitly,
/// matching the explicit-unsubscribe-token design note in spec §9.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(pub u64);

pub type LocalUpdateCallback = Box<dyn Fn() + Send + Sync>;

/// The contract the CRDT runtime must satisfy. The runtime itself —
/// merge semantics, diff algorithms, actor ids — is out of scope; this
/// crate only ever calls through this trait (spec §1).
///
/// Implementors must ensure `subscribe_local_updates`'s callback enqueues
/// work onto the caller's dispatch queue rather than mutating program
/// state directly (spec §5) — the trait itself cannot enforce that, so
/// this is a contract on implementors, not a type-level guarantee.
pub trait CrdtDoc: Send + Sync {
    /// Current version vector / frontier, opaque to this crate.
    fn version(&self) -> VersionVector;

    /// Exports document bytes. `from = None` (or an empty vector) means a
    /// full snapshot; a non-empty `from` means an incremental update
    /// relative to that version (spec §4.5.3).
    fn export(&self, from: Option<&VersionVector>) -> Vec<u8>;

    /// Merges remote bytes into the document. Idempotent: importing the
    /// same bytes twice is a no-op (spec §8 round-trip law).
    fn import(&self, data: &[u8]);

    /// Registers a callback fired after any local commit or imported
    /// change. Returns a token for later [`CrdtDoc::unsubscribe`].
    fn subscribe_local_updates(&self, callback: LocalUpdateCallback) -> SubscriptionToken;

    fn unsubscribe(&self, token: SubscriptionToken);

    /// Applies a local edit and commits it, firing the local-update
    /// subscription exactly once. The document's concrete type (schemas,
    /// typed accessors) is out of scope for this crate (spec §1), so the
    /// edit closure receives `&mut dyn Any` and downcasts to whatever
    /// concrete document type the embedding application constructed —
    /// one explicit, documented downcast, not the source's dynamic
    /// property dispatch (spec §9 design note).
    fn change(&self, edit: Box<dyn FnOnce(&mut dyn std::any::Any) + '_>);

    /// Read-only escape hatch for viewing document content, used by
    /// `DocHandle::doc_view` (spec §6).
    fn as_any(&self) -> &dyn std::any::Any;
}

/// Owns one document's CRDT handle plus its namespaced ephemeral stores
/// (spec §3 `DocState`).
pub struct DocState {
    pub doc_id: DocId,
    pub doc: Arc<dyn CrdtDoc>,
    /// Set once the executor completes `Cmd::SubscribeDoc`; `None` in the
    /// brief window between doc creation and that completion.
    pub subscription_token: Option<SubscriptionToken>,
    pub ephemeral_stores: HashMap<Namespace, Arc<dyn EphemeralStore>>,
}

impl DocState {
    pub fn new(doc_id: DocId, doc: Arc<dyn CrdtDoc>) -> Self {
        Self {
            doc_id,
            doc,
            subscription_token: None,
            ephemeral_stores: HashMap::new(),
        }
    }

    pub fn ephemeral_store(&mut self, namespace: &str, make: impl FnOnce() -> Arc<dyn EphemeralStore>) -> Arc<dyn EphemeralStore> {
        self.ephemeral_stores
            .entry(namespace.to_string())
            .or_insert_with(make)
            .clone()
    }
}

/// Map from document id to `DocState`. Documents are created lazily on
/// first reference (local `get` or remote announcement) and destroyed
/// only on explicit deletion (spec §3).
#[derive(Default)]
pub struct DocumentRegistry {
    docs: HashMap<DocId, DocState>,
}

impl DocumentRegistry {
    pub fn new() -> Self {
        Self { docs: HashMap::new() }
    }

    pub fn contains(&self, doc_id: &str) -> bool {
        self.docs.contains_key(doc_id)
    }

    pub fn get(&self, doc_id: &str) -> Option<&DocState> {
        self.docs.get(doc_id)
    }

    pub fn get_mut(&mut self, doc_id: &str) -> Option<&mut DocState> {
        self.docs.get_mut(doc_id)
    }

    pub fn insert(&mut self, state: DocState) {
        self.docs.insert(state.doc_id.clone(), state);
    }

    pub fn remove(&mut self, doc_id: &str) -> Option<DocState> {
        self.docs.remove(doc_id)
    }

    pub fn doc_ids(&self) -> impl Iterator<Item = &DocId> {
        self.docs.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DocId, &DocState)> {
        self.docs.iter()
    }
}
