//! Error taxonomy for the synchronizer core.
//!
//! Every variant here is non-fatal to the program loop: handlers log and
//! continue rather than propagate, except `Timeout`, which is returned to
//! callers waiting on [`crate::repo::DocHandle::wait_for_sync`].

use crate::channel::ChannelId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("wire frame malformed: {0}")]
    Decode(#[from] crate::wire::codec::WireError),

    #[error("message received on channel {channel:?} in an illegal state: {detail}")]
    StateViolation { channel: ChannelId, detail: String },

    #[error("rule denied message for doc {doc_id} on channel {channel:?}")]
    PermissionDenied { channel: ChannelId, doc_id: String },

    #[error("document {0} is not present locally")]
    DocumentMissing(String),

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("ephemeral store refused bytes for {doc_id}/{namespace}: {detail}")]
    EphemeralApplyFailure {
        doc_id: String,
        namespace: String,
        detail: String,
    },
}
