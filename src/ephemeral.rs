//! Ephemeral (presence/cursor) stores: namespaced, short-lived, CRDT-backed
//! (spec §3 `EphemeralStore`, §4.5.5).

use std::collections::HashMap;

use serde_json::Value;

use crate::document::SubscriptionToken;
use crate::error::SyncError;

pub type PeerId = String;

pub type EphemeralCallback = Box<dyn Fn() + Send + Sync>;

/// The contract an ephemeral store implementation must satisfy. Like
/// [`crate::document::CrdtDoc`], the actual CRDT merge logic is an
/// external black box reached only through this trait (spec §1).
pub trait EphemeralStore: Send + Sync {
    /// Serializes every entry currently held, after refreshing timestamps
    /// (spec §4.5.5: "touch all stores... before encode").
    fn encode_all(&self) -> Vec<u8>;

    /// Merges remote bytes. Empty `data` is a signal (explicit absence)
    /// and must not be treated as a decode failure (spec §4.5.5).
    fn apply(&self, data: &[u8]) -> Result<(), SyncError>;

    fn get_all_states(&self) -> HashMap<PeerId, Value>;

    /// Removes one peer's entries, e.g. on channel close.
    fn delete(&self, peer_id: &str);

    /// Refreshes expiry timestamps for all held entries without changing
    /// their values.
    fn touch(&self);

    fn subscribe(&self, callback: EphemeralCallback) -> SubscriptionToken;

    fn unsubscribe(&self, token: SubscriptionToken);

    /// Read-only escape hatch mirroring [`crate::document::CrdtDoc::as_any`]:
    /// this trait has no generic "set my own state" method because the
    /// shape of a presence/cursor payload is application-defined. Callers
    /// downcast to the concrete store type to publish local state, then
    /// call [`EphemeralHandle::notify_changed`](crate::repo::EphemeralHandle::notify_changed).
    fn as_any(&self) -> &dyn std::any::Any;
}
