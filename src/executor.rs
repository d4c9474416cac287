//! Command Executor: the side-effecting half of the Elm loop (spec §4.5,
//! §5). Holds no lock on the model — it only ever sees the `Cmd` values
//! `update` handed it, plus a dispatch handle for re-entering the queue.
//!
//! Grounded on `s2s.rs`'s single ordered-broadcast task: one executor
//! drains commands in order, so `cmd/send-message` ordering per channel
//! matches the FIFO guarantee in spec §5 without a lock around the model.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::Level;

use crate::adapter::AdapterManager;
use crate::program::{Cmd, Msg};
use crate::wire::{ChannelMsg, DocId, EphemeralEntry};

pub struct Executor {
    adapters: AdapterManager,
    dispatch_tx: mpsc::UnboundedSender<Msg>,
}

impl Executor {
    pub fn new(adapters: AdapterManager, dispatch_tx: mpsc::UnboundedSender<Msg>) -> Self {
        Self { adapters, dispatch_tx }
    }

    pub fn adapters_mut(&mut self) -> &mut AdapterManager {
        &mut self.adapters
    }

    /// Runs every command produced by one `update` call, in order. Nested
    /// `Cmd::Batch`es are flattened depth-first rather than recursed into,
    /// so this never needs to box a recursive async call.
    pub async fn run(&mut self, cmds: Vec<Cmd>) {
        let mut stack: Vec<Cmd> = cmds.into_iter().rev().collect();
        while let Some(cmd) = stack.pop() {
            if let Cmd::Batch(inner) = cmd {
                stack.extend(inner.into_iter().rev());
                continue;
            }
            self.execute_one(cmd).await;
        }
    }

    async fn execute_one(&mut self, cmd: Cmd) {
        match cmd {
            Cmd::Batch(_) => unreachable!("flattened in run()"),
            Cmd::Dispatch(msg) => {
                if self.dispatch_tx.send(msg).is_err() {
                    tracing::warn!("dispatch queue closed, dropping re-entrant message");
                }
            }
            Cmd::Log { level, message } => log_at(level, &message),
            Cmd::SendMessage(envelope) => {
                let sent = self.adapters.send(envelope).await;
                if sent == 0 {
                    tracing::debug!("send reached no channels");
                }
            }
            Cmd::SendEstablishmentMessage { channel_id, msg } => {
                if let Err(err) = self.adapters.send_establishment(channel_id, msg).await {
                    tracing::warn!(%err, "establishment send failed");
                }
            }
            Cmd::SubscribeDoc { doc_id, doc } => {
                let tx = self.dispatch_tx.clone();
                let callback_doc_id = doc_id.clone();
                let token = doc.subscribe_local_updates(Box::new(move || {
                    let _ = tx.send(Msg::LocalDocChange { doc_id: callback_doc_id.clone() });
                }));
                let _ = self.dispatch_tx.send(Msg::DocSubscribed { doc_id, token });
            }
            Cmd::UnsubscribeDoc { doc, token } => doc.unsubscribe(token),
            Cmd::ApplyEphemeral { doc_id, namespace, store, data } => {
                if let Err(err) = store.apply(&data) {
                    tracing::warn!(%doc_id, %namespace, %err, "ephemeral apply failed");
                }
            }
            Cmd::BroadcastEphemeralNamespace { our_peer_id, doc_id, namespace, store, hops_remaining, to } => {
                store.touch();
                let data = store.encode_all();
                let msg = ChannelMsg::Ephemeral {
                    doc_id,
                    hops_remaining,
                    stores: vec![EphemeralEntry { peer_id: our_peer_id, namespace, data }],
                };
                self.adapters.send(crate::wire::Envelope::Established { to, msg }).await;
            }
            Cmd::BroadcastEphemeralBatch { our_peer_id, hops_remaining, entries, to } => {
                let mut per_doc: HashMap<DocId, Vec<EphemeralEntry>> = HashMap::new();
                for (doc_id, namespace, store) in entries {
                    store.touch();
                    let data = store.encode_all();
                    per_doc
                        .entry(doc_id)
                        .or_default()
                        .push(EphemeralEntry { peer_id: our_peer_id.clone(), namespace, data });
                }
                let messages: Vec<ChannelMsg> = per_doc
                    .into_iter()
                    .map(|(doc_id, stores)| ChannelMsg::Ephemeral { doc_id, hops_remaining, stores })
                    .collect();
                if messages.is_empty() {
                    return;
                }
                let msg = if messages.len() == 1 {
                    messages.into_iter().next().expect("len checked above")
                } else {
                    ChannelMsg::Batch { messages }
                };
                self.adapters.send(crate::wire::Envelope::Established { to, msg }).await;
            }
        }
    }
}

fn log_at(level: Level, message: &str) {
    match level {
        Level::ERROR => tracing::error!("{message}"),
        Level::WARN => tracing::warn!("{message}"),
        Level::INFO => tracing::info!("{message}"),
        Level::DEBUG => tracing::debug!("{message}"),
        Level::TRACE => tracing::trace!("{message}"),
    }
}
