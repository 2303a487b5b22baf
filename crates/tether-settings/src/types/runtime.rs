//! Gateway, database and logging settings.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Protocol gateway the WebSocket transport talks to.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewaySettings {
    pub url: String,
    pub connect_timeout_ms: u64,
    /// Timeout for request/response frames (pairing codes, sends, logout).
    pub request_timeout_ms: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8787/ws".to_string(),
            connect_timeout_ms: 20_000,
            request_timeout_ms: 15_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseSettings {
    /// Credential/key store (relative to the tether home unless absolute).
    pub path: String,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: "database/tether.db".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level filter (`RUST_LOG` wins when set).
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Persist WARN and above to the log database.
    pub persist: bool,
    /// Log database (relative to the tether home unless absolute).
    pub database: String,
    /// Per-module level overrides, e.g. `{"tether_plugins": "debug"}`.
    pub modules: BTreeMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            persist: true,
            database: "database/logs.db".to_string(),
            modules: BTreeMap::new(),
        }
    }
}
