//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` and `#[serde(default)]`,
//! so a settings file only needs the keys it changes.

mod plugins;
mod runtime;
mod sessions;

pub use plugins::*;
pub use runtime::*;
pub use sessions::*;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};
use crate::loader::tether_home;

/// Root settings type.
///
/// ```json
/// {
///   "sessions": { "maxRetries": 8 },
///   "plugins": { "dir": "/srv/tether/plugins", "defaultPrefixes": ["!"] },
///   "pairing": { "method": "phone", "phone": "15550001111" }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TetherSettings {
    /// Reconnect policy for interactive sessions.
    pub sessions: SessionSettings,
    /// Background restoration of persisted sessions.
    pub sync: SyncSettings,
    pub plugins: PluginSettings,
    pub pairing: PairingSettings,
    pub gateway: GatewaySettings,
    pub database: DatabaseSettings,
    pub logging: LoggingSettings,
}

impl TetherSettings {
    /// Reject combinations the runtime cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.sessions.max_delay_ms < self.sessions.base_delay_ms {
            return Err(SettingsError::InvalidValue(format!(
                "sessions.maxDelayMs ({}) is below sessions.baseDelayMs ({})",
                self.sessions.max_delay_ms, self.sessions.base_delay_ms
            )));
        }
        if self.plugins.debounce_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "plugins.debounceMs must be positive".into(),
            ));
        }
        if let Some(bad) = self
            .plugins
            .default_prefixes
            .iter()
            .find(|p| p.chars().count() != 1)
        {
            return Err(SettingsError::InvalidValue(format!(
                "plugins.defaultPrefixes entries must be single characters, got {bad:?}"
            )));
        }
        if self.pairing.method == Some(PairingMethodSetting::Phone)
            && self.pairing.phone.as_deref().is_none_or(str::is_empty)
        {
            return Err(SettingsError::InvalidValue(
                "pairing.method is \"phone\" but pairing.phone is not set".into(),
            ));
        }
        Ok(())
    }

    pub fn plugins_dir(&self) -> PathBuf {
        resolve(&self.plugins.dir)
    }

    pub fn database_path(&self) -> PathBuf {
        resolve(&self.database.path)
    }

    pub fn log_database_path(&self) -> PathBuf {
        resolve(&self.logging.database)
    }
}

/// Absolute paths pass through; relative ones are anchored at the tether home.
fn resolve(path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        tether_home().join(p)
    }
}
