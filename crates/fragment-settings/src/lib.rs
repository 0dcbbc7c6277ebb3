//! # fragment-settings
//!
//! Layered configuration for the fragment daemon.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`FragmentSettings::default()`]
//! 2. **User file**: `~/.fragment/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `FRAGMENT_*` overrides
//!
//! There is no global instance: the binary loads settings once and hands
//! the pieces each component needs to its constructor.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_overrides, deep_merge, fragment_home, load_settings, load_settings_from_path,
    resolve_path, settings_path,
};
pub use types::*;
