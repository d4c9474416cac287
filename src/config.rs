//! Construction-time options, grouped the way `ServerConfig` groups
//! `freeq-server`'s startup flags — except there is no CLI parser here:
//! this is a library, and the values below are set by the embedding
//! application, not parsed from `argv`.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SynchronizerConfig {
    /// Interval between `synchronizer/heartbeat` ticks. Default 5s (spec §4.5).
    pub heartbeat_interval: Duration,
    /// How long a peer may stay `Pending` awareness of a doc before the
    /// heartbeat re-issues a `sync-request`. Default 30s (spec §4.5.6).
    pub pending_sync_timeout: Duration,
    /// How long a channel may stay in `ChannelState::Pending` before it is
    /// closed for failing to complete the handshake. Default 30s (spec §5).
    pub handshake_timeout: Duration,
    /// Default ephemeral gossip hop budget for network-kind channels.
    /// Storage channels always get 0 regardless of this value (spec §4.5.5).
    pub ephemeral_hops_network: u8,
    /// Maximum bound on the pending-channel message buffer before the
    /// channel is reset (spec §4.4).
    pub pending_buffer_capacity: usize,
    /// Suggested maximum size, in bytes, of a single `update` frame before
    /// a caller should fragment at a higher layer (spec §9, open question;
    /// resolved here at the suggested 1 MiB).
    pub max_frame_size: usize,
}

impl Default for SynchronizerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            pending_sync_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(30),
            ephemeral_hops_network: 1,
            pending_buffer_capacity: 64,
            max_frame_size: 1024 * 1024,
        }
    }
}
