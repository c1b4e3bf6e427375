//! Settings type definitions.
//!
//! Field names are camelCase on disk. Every struct is `#[serde(default)]`,
//! so a partial file only overrides what it names.

mod logging;
mod session;
mod transport;

pub use logging::*;
pub use session::*;
pub use transport::*;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
///
/// ```json
/// {
///   "session": { "reconnectDelayMs": 10000 },
///   "logging": { "level": "info" }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
    /// Session manager timing and reconnection policy.
    pub session: SessionSettings,
    /// WebSocket transport limits.
    pub transport: TransportSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl ClientSettings {
    /// Check constraints that span fields.
    pub fn validate(&self) -> Result<()> {
        let s = &self.session;
        if s.liveness_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "session.livenessIntervalMs must be positive".into(),
            ));
        }
        if s.liveness_timeout_ms >= s.liveness_interval_ms {
            return Err(SettingsError::InvalidValue(format!(
                "session.livenessTimeoutMs ({}) must be shorter than session.livenessIntervalMs ({})",
                s.liveness_timeout_ms, s.liveness_interval_ms
            )));
        }
        if s.max_reconnect_attempts == 0 {
            return Err(SettingsError::InvalidValue(
                "session.maxReconnectAttempts must be at least 1".into(),
            ));
        }
        if self.transport.outbound_buffer == 0 {
            return Err(SettingsError::InvalidValue(
                "transport.outboundBuffer must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
