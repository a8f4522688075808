//! Runtime configuration for endpoints.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default bound on each connection's outbound queue, in messages.
pub const DEFAULT_SEND_QUEUE_CAPACITY: usize = 1024;

/// Default upper bound accepted for a stream frame payload, in bytes.
pub const DEFAULT_MAX_FRAME_LEN: u32 = 1024 * 1024;

/// Policy applied when a datagram connection's outbound queue is full.
///
/// Stream connections never drop: a full queue suspends the sender instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    /// Discard the oldest queued message to make room for the new one.
    DropOldest,
    /// Discard the message being sent and keep the queue as is.
    DropNewest,
}

/// Tunables shared by every connection an endpoint admits.
///
/// All fields have serde defaults, so a partial config file deserializes
/// with the remaining fields at their documented defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// Outbound queue bound per connection, in messages.
    ///
    /// Values below 1 are treated as 1.
    pub send_queue_capacity: usize,
    /// What to do when a datagram connection's outbound queue is full.
    pub drop_policy_udp: DropPolicy,
    /// Whether to disable Nagle's algorithm on stream sockets.
    pub tcp_no_delay: bool,
    /// How long a datagram peer may stay silent before it is considered
    /// lost and its connection is closed. `None` disables the timeout.
    pub peer_idle_timeout_udp: Option<Duration>,
    /// Largest stream frame payload this endpoint will read or write.
    pub max_frame_len: u32,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            send_queue_capacity: DEFAULT_SEND_QUEUE_CAPACITY,
            drop_policy_udp: DropPolicy::DropOldest,
            tcp_no_delay: true,
            peer_idle_timeout_udp: None,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl NetConfig {
    /// Outbound queue capacity with the lower bound of 1 applied.
    pub(crate) fn effective_send_queue_capacity(&self) -> usize {
        self.send_queue_capacity.max(1)
    }
}
