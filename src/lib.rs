//! `synchronizer-core`: a transport-agnostic, message-driven synchronizer
//! for local-first CRDT documents.
//!
//! The crate never interprets CRDT content or version-vector bytes itself
//! (those come from whatever `CrdtDoc` implementation the embedding
//! application supplies); it only owns channel/peer/document bookkeeping,
//! the directory/sync/ephemeral-gossip protocols running over those
//! channels, and the pluggable [`Adapter`](adapter::Adapter) transport
//! boundary.
//!
//! Entry point: [`Repo`](repo::Repo). Everything else is reachable through
//! it or through a custom [`Adapter`](adapter::Adapter)/
//! [`CrdtDoc`](document::CrdtDoc)/[`EphemeralStore`](ephemeral::EphemeralStore)
//! implementation.

pub mod adapter;
pub mod channel;
pub mod config;
pub mod document;
pub mod ephemeral;
pub mod error;
pub mod executor;
pub mod identity;
pub mod peer;
pub mod program;
pub mod repo;
pub mod rules;
pub mod testkit;
pub mod wire;

pub use adapter::{Adapter, AdapterEvent};
pub use config::SynchronizerConfig;
pub use document::{CrdtDoc, SubscriptionToken};
pub use ephemeral::EphemeralStore;
pub use error::SyncError;
pub use identity::{PeerKind, RepoIdentity};
pub use repo::{DocHandle, EphemeralHandle, ReadyState, ReadyStatus, Repo, RepoConfig};
pub use rules::{RuleCtx, RuleFn, Rules};
pub use wire::{DocId, Namespace, VersionVector};
