//! Layered settings loading.
//!
//! Defaults are serialized to JSON, the user file is deep-merged over them,
//! the result is deserialized, and finally `CHE_*` variables are applied.
//!
//! Merge rules: objects merge per key, arrays and scalars are replaced, and
//! `null` in the user file leaves the default in place.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::ClientSettings;

/// `~/.che/client.json`, or `$CHE_SETTINGS_PATH` when set.
pub fn settings_path() -> PathBuf {
    if let Some(p) = std::env::var_os("CHE_SETTINGS_PATH").filter(|p| !p.is_empty()) {
        return PathBuf::from(p);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".che").join("client.json")
}

/// Load from [`settings_path`] with environment overrides.
pub fn load_settings() -> Result<ClientSettings> {
    load_settings_from_path(&settings_path())
}

/// Load from `path` with environment overrides.
///
/// A missing file yields defaults; malformed JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<ClientSettings> {
    let mut settings = read_file_layer(path)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

fn read_file_layer(path: &Path) -> Result<ClientSettings> {
    let defaults = serde_json::to_value(ClientSettings::default())?;
    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };
    Ok(serde_json::from_value(merged)?)
}

/// Recursively merge `source` over `target`.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `CHE_*` variables from the process environment.
pub fn apply_env_overrides(settings: &mut ClientSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`.
///
/// Values that fail to parse or fall outside their range are logged and
/// ignored.
pub fn apply_overrides<F>(settings: &mut ClientSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    // ── session ─────────────────────────────────────────────────────
    if let Some(v) = env.u64("CHE_LIVENESS_INTERVAL_MS", 100, 3_600_000) {
        settings.session.liveness_interval_ms = v;
    }
    if let Some(v) = env.u64("CHE_LIVENESS_TIMEOUT_MS", 50, 3_600_000) {
        settings.session.liveness_timeout_ms = v;
    }
    if let Some(v) = env.u64("CHE_FIRST_RECONNECT_DELAY_MS", 0, 3_600_000) {
        settings.session.first_reconnect_delay_ms = v;
    }
    if let Some(v) = env.u64("CHE_RECONNECT_DELAY_MS", 0, 3_600_000) {
        settings.session.reconnect_delay_ms = v;
    }
    if let Some(v) = env.u32("CHE_MAX_RECONNECT_ATTEMPTS", 1, 1_000_000) {
        settings.session.max_reconnect_attempts = v;
    }
    if let Some(v) = env.bool("CHE_REPLAY_SUBSCRIPTIONS") {
        settings.session.replay_subscriptions = v;
    }

    // ── transport ───────────────────────────────────────────────────
    if let Some(v) = env.usize("CHE_OUTBOUND_BUFFER", 1, 1_000_000) {
        settings.transport.outbound_buffer = v;
    }
    if let Some(v) = env.usize("CHE_MAX_MESSAGE_SIZE", 1024, 1 << 30) {
        settings.transport.max_message_size = v;
    }

    // ── logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("CHE_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("CHE_LOG_JSON") {
        settings.logging.json = v;
    }
}

// ── Pure parsers ────────────────────────────────────────────────────────────

/// `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`, case-insensitive.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a `u32` in `min..=max`.
pub fn parse_u32_range(val: &str, min: u32, max: u32) -> Option<u32> {
    let n: u32 = val.parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

/// Parse a `u64` in `min..=max`.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

/// Parse a `usize` in `min..=max`.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

// ── Readers ─────────────────────────────────────────────────────────────────

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, name: &str, kind: &str, parse: impl FnOnce(&str) -> Option<T>) -> Option<T> {
        let val = (self.lookup)(name)?;
        let result = parse(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, kind, "invalid env var, ignoring");
        }
        result
    }

    fn bool(&self, name: &str) -> Option<bool> {
        self.parsed(name, "bool", parse_bool)
    }

    fn u32(&self, name: &str, min: u32, max: u32) -> Option<u32> {
        self.parsed(name, "u32", |v| parse_u32_range(v, min, max))
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        self.parsed(name, "u64", |v| parse_u64_range(v, min, max))
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        self.parsed(name, "usize", |v| parse_usize_range(v, min, max))
    }
}
