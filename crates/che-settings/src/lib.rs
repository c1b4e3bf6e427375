//! # che-settings
//!
//! Configuration for the dashboard client, loaded from three layers (lowest
//! to highest priority):
//!
//! 1. **Compiled defaults**: [`ClientSettings::default()`]
//! 2. **User file**: `~/.che/client.json`, deep-merged over the defaults
//! 3. **Environment**: `CHE_*` overrides
//!
//! ```no_run
//! let settings = che_settings::get_settings();
//! println!("liveness every {:?}", settings.session.liveness_interval());
//! ```

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;

use std::sync::OnceLock;

static SETTINGS: OnceLock<ClientSettings> = OnceLock::new();

/// The process-wide settings.
///
/// Loaded on first access. A missing file yields defaults; an unreadable or
/// invalid one is logged and also yields defaults.
pub fn get_settings() -> &'static ClientSettings {
    SETTINGS.get_or_init(|| {
        load_settings().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to load settings, using defaults");
            ClientSettings::default()
        })
    })
}

/// Install explicit settings before the first [`get_settings`] call.
///
/// Hands the value back if the global was already initialized.
#[allow(clippy::result_large_err)]
pub fn init_settings(settings: ClientSettings) -> std::result::Result<(), ClientSettings> {
    SETTINGS.set(settings)
}
