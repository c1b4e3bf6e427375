//! WebSocket transport limits.

use serde::{Deserialize, Serialize};

/// Limits applied to each socket.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransportSettings {
    /// Outbound frames queued ahead of the writer task.
    pub outbound_buffer: usize,
    /// Largest inbound message accepted, in bytes.
    pub max_message_size: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            outbound_buffer: 1024,
            max_message_size: 16 * 1024 * 1024,
        }
    }
}
