//! Session manager timing and reconnection policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Liveness and reconnection knobs for a session manager.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// Period of the liveness probe while connected.
    pub liveness_interval_ms: u64,
    /// How long the probe may take before the connection is declared dead.
    pub liveness_timeout_ms: u64,
    /// Delay before the first reconnect attempt after a drop.
    pub first_reconnect_delay_ms: u64,
    /// Delay before every later attempt.
    pub reconnect_delay_ms: u64,
    /// Consecutive failed cycles before the session gives up.
    pub max_reconnect_attempts: u32,
    /// Re-send active subscriptions when a failed session is revived.
    pub replay_subscriptions: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            liveness_interval_ms: 10_000,
            liveness_timeout_ms: 5_000,
            first_reconnect_delay_ms: 0,
            reconnect_delay_ms: 30_000,
            max_reconnect_attempts: 100,
            replay_subscriptions: true,
        }
    }
}

impl SessionSettings {
    /// [`Self::liveness_interval_ms`] as a `Duration`.
    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms)
    }

    /// [`Self::liveness_timeout_ms`] as a `Duration`.
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    /// Delay for the given 1-based attempt number.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            Duration::from_millis(self.first_reconnect_delay_ms)
        } else {
            Duration::from_millis(self.reconnect_delay_ms)
        }
    }
}
