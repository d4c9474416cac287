//! Transport abstraction: `Adapter` owns channels and moves envelopes in
//! and out; `AdapterManager` multiplexes across adapters (spec §4.2).
//!
//! Grounded in `s2s.rs::S2sManager` (peer map, generation counters, a
//! single ordered outbound task per connection) and `connection/mod.rs`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::channel::{ChannelId, ChannelKind};
use crate::error::SyncError;
use crate::wire::{ChannelMsg, Envelope};

/// Events an adapter raises asynchronously; consumed by whatever owns the
/// `AdapterManager` (the Repo's dispatch loop) and turned into
/// `synchronizer/*` messages.
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    ChannelOpen { channel_id: ChannelId, kind: ChannelKind, adapter_id: String, known_peer_id: Option<String> },
    ChannelClose { channel_id: ChannelId },
    Receive { from_channel_id: ChannelId, message: ChannelMsg },
}

/// Uniform transport abstraction (spec §4.2). Implementors must guarantee
/// at-most-once delivery per frame and FIFO ordering within one channel
/// (spec §6).
#[async_trait]
pub trait Adapter: Send + Sync {
    fn adapter_id(&self) -> &str;
    fn adapter_type(&self) -> &str;

    async fn start(&self, events: mpsc::UnboundedSender<AdapterEvent>);
    async fn stop(&self);
    async fn flush(&self);

    fn channels(&self) -> Vec<(ChannelId, ChannelKind)>;

    /// Sends an envelope addressed to a channel in `Pending` state
    /// (handshake traffic); returns the number of channels it actually
    /// reached.
    async fn send_establishment(&self, channel_id: ChannelId, msg: ChannelMsg) -> usize;

    /// Sends an envelope to one or more `Established` channels; dropped
    /// for any target that is not currently `Established`. Returns the
    /// number of channels it actually reached.
    async fn send(&self, channel_ids: &[ChannelId], msg: ChannelMsg) -> usize;
}

/// Multiplexes sends and shutdown across every registered adapter
/// (spec §4.2). Holds no model state of its own — all channel/peer
/// bookkeeping lives in the Synchronizer Program.
pub struct AdapterManager {
    adapters: HashMap<String, Arc<dyn Adapter>>,
    events_tx: mpsc::UnboundedSender<AdapterEvent>,
}

impl AdapterManager {
    pub fn new(events_tx: mpsc::UnboundedSender<AdapterEvent>) -> Self {
        Self { adapters: HashMap::new(), events_tx }
    }

    pub async fn add_adapter(&mut self, adapter: Arc<dyn Adapter>) {
        let id = adapter.adapter_id().to_string();
        adapter.start(self.events_tx.clone()).await;
        self.adapters.insert(id, adapter);
    }

    /// Stops the adapter and removes it. Callers are responsible for
    /// reclaiming its channels/peers from the Synchronizer's own
    /// registries (spec §4.2's `on_reset` callback) — the manager itself
    /// tracks no channel ownership.
    pub async fn remove_adapter(&mut self, adapter_id: &str) -> Option<Arc<dyn Adapter>> {
        if let Some(adapter) = self.adapters.remove(adapter_id) {
            adapter.stop().await;
            Some(adapter)
        } else {
            None
        }
    }

    fn adapter_for_channel(&self, channel_id: ChannelId) -> Option<&Arc<dyn Adapter>> {
        self.adapters
            .values()
            .find(|a| a.channels().iter().any(|(id, _)| *id == channel_id))
    }

    pub async fn send_establishment(&self, channel_id: ChannelId, msg: ChannelMsg) -> Result<usize, SyncError> {
        match self.adapter_for_channel(channel_id) {
            Some(adapter) => Ok(adapter.send_establishment(channel_id, msg).await),
            None => Err(SyncError::StateViolation {
                channel: channel_id,
                detail: "no adapter owns this channel".into(),
            }),
        }
    }

    pub async fn send(&self, envelope: Envelope) -> usize {
        match envelope {
            Envelope::Establishment { to, msg } => match self.adapter_for_channel(to) {
                Some(adapter) => adapter.send_establishment(to, msg).await,
                None => 0,
            },
            Envelope::Established { to, msg } => {
                let mut total = 0;
                let mut by_adapter: HashMap<String, Vec<ChannelId>> = HashMap::new();
                for channel_id in to {
                    if let Some(adapter) = self.adapter_for_channel(channel_id) {
                        by_adapter
                            .entry(adapter.adapter_id().to_string())
                            .or_default()
                            .push(channel_id);
                    }
                }
                for (adapter_id, channel_ids) in by_adapter {
                    if let Some(adapter) = self.adapters.get(&adapter_id) {
                        total += adapter.send(&channel_ids, msg.clone()).await;
                    }
                }
                total
            }
        }
    }

    pub async fn flush(&self) {
        for adapter in self.adapters.values() {
            adapter.flush().await;
        }
    }

    pub async fn shutdown(&mut self) {
        self.flush().await;
        let ids: Vec<String> = self.adapters.keys().cloned().collect();
        for id in ids {
            self.remove_adapter(&id).await;
        }
    }

    pub fn adapter_ids(&self) -> impl Iterator<Item = &String> {
        self.adapters.keys()
    }
}
