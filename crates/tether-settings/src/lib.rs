//! # tether-settings
//!
//! Configuration for the tether daemon, loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`TetherSettings::default()`]
//! 2. **User file**: `~/.tether/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `TETHER_*` overrides (highest priority)
//!
//! Relative paths inside the settings (plugin directory, database files) are
//! resolved against the tether home directory, see [`tether_home`].
//!
//! # Usage
//!
//! ```no_run
//! use tether_settings::load_settings;
//!
//! let settings = load_settings().unwrap_or_default();
//! println!("plugins live in {}", settings.plugins_dir().display());
//! ```

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, deep_merge, load_settings, load_settings_from_path, parse_bool,
    settings_path, tether_home,
};
pub use types::*;
