//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`FragmentSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `FRAGMENT_*` environment overrides (highest priority)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::FragmentSettings;

/// Base directory for settings and databases (`~/.fragment`).
pub fn fragment_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".fragment")
}

/// Default settings file (`~/.fragment/settings.json`).
pub fn settings_path() -> PathBuf {
    fragment_home().join("settings.json")
}

/// Resolve a configured path: absolute paths are kept, relative ones are
/// placed under [`fragment_home`].
pub fn resolve_path(configured: &str) -> PathBuf {
    let path = Path::new(configured);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        fragment_home().join(path)
    }
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<FragmentSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<FragmentSettings> {
    let defaults = serde_json::to_value(FragmentSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let user: Value = serde_json::from_str(&content).map_err(|source| SettingsError::Syntax {
            path: path.to_path_buf(),
            source,
        })?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: FragmentSettings = serde_json::from_value(merged)?;
    apply_overrides(&mut settings, |name| std::env::var(name).ok());
    settings.validate();
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
///
/// Objects merge per key, everything else is replaced by `source`, and
/// nulls in `source` keep the target value.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply overrides from an environment-like lookup. Invalid values are
/// logged and ignored.
pub fn apply_overrides<F>(settings: &mut FragmentSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let read = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

    if let Some(v) = read("FRAGMENT_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read("FRAGMENT_PORT") {
        match parse_u64_range(&v, 0, u64::from(u16::MAX)) {
            Some(port) => settings.server.port = port as u16,
            None => warn_invalid("FRAGMENT_PORT", &v),
        }
    }
    if let Some(v) = read("FRAGMENT_DB") {
        settings.database.path = v;
    }
    if let Some(v) = read("FRAGMENT_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read("FRAGMENT_LOG_TO_SQLITE") {
        match parse_bool(&v) {
            Some(b) => settings.logging.log_to_sqlite = b,
            None => warn_invalid("FRAGMENT_LOG_TO_SQLITE", &v),
        }
    }
    if let Some(v) = read("FRAGMENT_COOLDOWN_SECS") {
        match parse_u64_range(&v, 0, 3600) {
            Some(secs) => settings.controller.cooldown_secs = secs,
            None => warn_invalid("FRAGMENT_COOLDOWN_SECS", &v),
        }
    }
    if let Some(v) = read("FRAGMENT_LIVENESS_SECS") {
        match parse_u64_range(&v, 1, 7 * 24 * 3600) {
            Some(secs) => settings.controller.liveness_timeout_secs = secs,
            None => warn_invalid("FRAGMENT_LIVENESS_SECS", &v),
        }
    }
}

fn warn_invalid(key: &str, value: &str) {
    tracing::warn!(key, value, "invalid env override, ignoring");
}

/// Parse a boolean: `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
