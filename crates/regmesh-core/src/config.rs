//! Mesh engine timing and cache-sizing knobs.
//!
//! Every timer and cache in the engine reads its bound from [`MeshConfig`]
//! so deployments on slow links (or tests that want short windows) can tune
//! behavior without touching protocol code. The defaults match a 250 kbps
//! radio on a small mesh.

use serde::{Deserialize, Serialize};

/// Tunable parameters for a mesh node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// How long a join waits unopposed before the node declares itself joined (ms)
    pub join_accept_ms: u64,
    /// Lower bound of the randomized JOIN retransmit interval (ms)
    pub join_retx_min_ms: u64,
    /// Upper bound of the randomized JOIN retransmit interval (ms)
    pub join_retx_max_ms: u64,
    /// Lower bound of the randomized gap between flood/response re-emissions (ms)
    pub repeat_min_ms: u64,
    /// Upper bound of the randomized gap between flood/response re-emissions (ms)
    pub repeat_max_ms: u64,
    /// How long a ping collects PONG responses before completing (ms)
    pub ping_timeout_ms: u64,
    /// How long a register operation waits for a response before failing (ms)
    pub op_timeout_ms: u64,
    /// Lower bound of the randomized gap between request retransmits (ms)
    pub request_retry_min_ms: u64,
    /// Upper bound of the randomized gap between request retransmits (ms)
    pub request_retry_max_ms: u64,
    /// Retransmits of an unanswered request before giving up to the timeout
    pub max_request_repeats: u8,
    /// Hop count at which a packet is no longer re-flooded (4-bit field, max 15)
    pub max_hop_count: u8,
    /// Frames the flood repeater will hold for relay
    pub flood_cache_size: usize,
    /// Response descriptors held for re-emission
    pub response_cache_size: usize,
    /// Times each cached response is re-sent before eviction
    pub response_repeats: u8,
    /// Request tuples remembered for duplicate suppression
    pub handled_cache_size: usize,
    /// Sequence-number distance past which a dedup entry is considered stale
    pub dedup_expiry_window: u8,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            join_accept_ms: 1000,
            join_retx_min_ms: 100,
            join_retx_max_ms: 400,
            repeat_min_ms: 10,
            repeat_max_ms: 50,
            ping_timeout_ms: 1000,
            op_timeout_ms: 1000,
            request_retry_min_ms: 100,
            request_retry_max_ms: 400,
            max_request_repeats: 3,
            max_hop_count: 15,
            flood_cache_size: 3,
            response_cache_size: 4,
            response_repeats: 3,
            handled_cache_size: 8,
            dedup_expiry_window: 2,
        }
    }
}

impl MeshConfig {
    /// Configuration with every window shrunk for simulated-air tests.
    ///
    /// Keeps the same ordering relationships as the defaults (join accept
    /// longer than a retransmit interval, op timeout longer than a retry)
    /// while letting a polled test loop converge in a few milliseconds.
    pub fn fast() -> Self {
        Self {
            join_accept_ms: 20,
            join_retx_min_ms: 4,
            join_retx_max_ms: 8,
            repeat_min_ms: 1,
            repeat_max_ms: 2,
            ping_timeout_ms: 25,
            op_timeout_ms: 40,
            request_retry_min_ms: 8,
            request_retry_max_ms: 12,
            ..Self::default()
        }
    }
}
