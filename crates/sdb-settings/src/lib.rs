//! # sdb-settings
//!
//! Layered configuration for the sdb connection runtime.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`SdbSettings::default()`]
//! 2. **User file**: `~/.sdb/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `SDB_*` overrides (highest priority)

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;

use std::sync::OnceLock;

static SETTINGS: OnceLock<SdbSettings> = OnceLock::new();

/// The process-wide settings.
///
/// Loaded on first call; falls back to compiled defaults when the file
/// cannot be read.
pub fn get_settings() -> &'static SdbSettings {
    SETTINGS.get_or_init(|| load_settings().unwrap_or_default())
}

/// Install settings before the first [`get_settings`] call.
///
/// Returns the settings back if the global was already initialized.
pub fn init_settings(settings: SdbSettings) -> std::result::Result<(), SdbSettings> {
    SETTINGS.set(settings)
}
