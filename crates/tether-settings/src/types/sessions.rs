//! Session lifecycle, sync and pairing settings.

use serde::{Deserialize, Serialize};

/// Reconnect policy for sessions started by the operator.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// Reconnect attempts before a session is declared dead.
    pub max_retries: u32,
    /// Backoff base: attempt `n` waits `base * 2^(n-1)` ms.
    pub base_delay_ms: u64,
    /// Backoff ceiling.
    pub max_delay_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
        }
    }
}

/// Background restoration of persisted sessions.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncSettings {
    pub enabled: bool,
    /// Retry ceiling for restored sessions.
    pub max_retries: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 2,
        }
    }
}

/// How an interactive pairing offer is answered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PairingMethodSetting {
    Qr,
    Phone,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PairingSettings {
    /// Unset means "ask on stdin the first time".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<PairingMethodSetting>,
    /// Phone number (digits only) used for numeric pairing codes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}
