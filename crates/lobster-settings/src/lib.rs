//! # lobster-settings
//!
//! Configuration management with layered sources for g3lobster.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`LobsterSettings::default()`]
//! 2. **Settings file**: a JSON file (deep-merged over defaults)
//! 3. **Environment variables**: `LOBSTER_*` overrides (highest priority)
//!
//! Relative directories in the loaded settings are resolved against the
//! settings file's parent directory. The loaded value is passed explicitly to
//! every component that needs it; there is no global instance.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings_from_path};
pub use types::*;
