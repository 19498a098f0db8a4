//! Builds [`SdbSettings`] from compiled defaults, the user file and the
//! process environment.
//!
//! Loading flow:
//! 1. Start with compiled [`SdbSettings::default()`]
//! 2. If `~/.sdb/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `SDB_*` environment variable overrides (highest priority)
//!
//! When the file layer is merged, nested objects merge key by key. Any other
//! value in the file replaces the default outright, except `null`, which
//! leaves the default alone.

use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::SdbSettings;

/// Resolve the path to the settings file (`~/.sdb/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".sdb").join("settings.json")
}

/// Load `~/.sdb/settings.json` and apply `SDB_*` overrides.
pub fn load_settings() -> Result<SdbSettings> {
    load_settings_from_path(&settings_path())
}

/// Load the file at `path` and apply `SDB_*` overrides.
///
/// A missing file yields defaults; a file with invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<SdbSettings> {
    let mut settings = load_file_layer(path)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

fn load_file_layer(path: &Path) -> Result<SdbSettings> {
    let defaults = serde_json::to_value(SdbSettings::default())?;
    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let user: Value =
            serde_json::from_str(&content).map_err(|source| SettingsError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };
    Ok(serde_json::from_value(merged)?)
}

/// Merge `source` over `target`, recursing into objects.
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

/// Apply `SDB_*` overrides from the process environment.
pub fn apply_env_overrides(settings: &mut SdbSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply `SDB_*` overrides read through `lookup`.
///
/// A value that does not parse, or falls outside its range, is logged and
/// skipped; the lower layer stays in effect.
pub fn apply_overrides(settings: &mut SdbSettings, lookup: impl Fn(&str) -> Option<String>) {
    let env = Overrides { lookup };

    let conn = &mut settings.connection;
    env.millis("SDB_PING_INTERVAL_MS", 100..=3_600_000, &mut conn.ping_interval_ms);
    env.millis("SDB_PING_TIMEOUT_MS", 100..=600_000, &mut conn.ping_timeout_ms);

    let reconnect = &mut settings.reconnect;
    env.flag("SDB_RECONNECT_ENABLED", &mut reconnect.enabled);
    env.millis(
        "SDB_RECONNECT_INITIAL_DELAY_MS",
        1..=600_000,
        &mut reconnect.initial_delay_ms,
    );
    env.millis(
        "SDB_RECONNECT_MAX_DELAY_MS",
        1..=3_600_000,
        &mut reconnect.max_delay_ms,
    );

    if let Some(level) = (env.lookup)("SDB_LOG_LEVEL").filter(|v| !v.is_empty()) {
        settings.log_level = level;
    }
}

struct Overrides<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Overrides<F> {
    fn flag(&self, name: &str, slot: &mut bool) {
        let Some(raw) = (self.lookup)(name) else {
            return;
        };
        match parse_flag(&raw) {
            Some(v) => *slot = v,
            None => warn!(var = name, value = %raw, "expected a boolean, override skipped"),
        }
    }

    fn millis(&self, name: &str, range: RangeInclusive<u64>, slot: &mut u64) {
        let Some(raw) = (self.lookup)(name) else {
            return;
        };
        match parse_millis(&raw, &range) {
            Some(v) => *slot = v,
            None => warn!(
                var = name,
                value = %raw,
                min = *range.start(),
                max = *range.end(),
                "milliseconds out of range, override skipped"
            ),
        }
    }
}

/// `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`, any case.
pub fn parse_flag(raw: &str) -> Option<bool> {
    let raw = raw.trim();
    ["true", "1", "yes", "on"]
        .iter()
        .any(|t| raw.eq_ignore_ascii_case(t))
        .then_some(true)
        .or_else(|| {
            ["false", "0", "no", "off"]
                .iter()
                .any(|f| raw.eq_ignore_ascii_case(f))
                .then_some(false)
        })
}

/// A whole number of milliseconds inside `range`.
pub fn parse_millis(raw: &str, range: &RangeInclusive<u64>) -> Option<u64> {
    raw.trim().parse().ok().filter(|n| range.contains(n))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
