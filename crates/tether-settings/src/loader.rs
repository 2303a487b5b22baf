//! Settings loading with deep merge and environment variable overrides.
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::{PairingMethodSetting, TetherSettings};

/// Tether home directory: `$TETHER_HOME`, else `~/.tether`.
pub fn tether_home() -> PathBuf {
    if let Some(home) = read_env_string("TETHER_HOME") {
        return PathBuf::from(home);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".tether")
}

/// Resolve the path to the settings file (`~/.tether/settings.json`).
pub fn settings_path() -> PathBuf {
    tether_home().join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<TetherSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON or an invalid combination of
/// values is an error.
pub fn load_settings_from_path(path: &Path) -> Result<TetherSettings> {
    let defaults = serde_json::to_value(TetherSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: TetherSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
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

/// Apply `TETHER_*` environment variable overrides.
///
/// Invalid values are ignored with a warning (file/default value wins).
pub fn apply_env_overrides(settings: &mut TetherSettings) {
    // ── Sessions ────────────────────────────────────────────────────
    if let Some(v) = read_env_u64("TETHER_MAX_RETRIES", 0, 1000) {
        settings.sessions.max_retries = u32::try_from(v).unwrap_or(u32::MAX);
    }
    if let Some(v) = read_env_u64("TETHER_BASE_DELAY_MS", 1, 3_600_000) {
        settings.sessions.base_delay_ms = v;
    }
    if let Some(v) = read_env_u64("TETHER_MAX_DELAY_MS", 1, 3_600_000) {
        settings.sessions.max_delay_ms = v;
    }

    // ── Sync ────────────────────────────────────────────────────────
    if let Some(v) = read_env_bool("TETHER_SYNC_ENABLED") {
        settings.sync.enabled = v;
    }
    if let Some(v) = read_env_u64("TETHER_SYNC_MAX_RETRIES", 0, 1000) {
        settings.sync.max_retries = u32::try_from(v).unwrap_or(u32::MAX);
    }

    // ── Plugins ─────────────────────────────────────────────────────
    if let Some(v) = read_env_string("TETHER_PLUGINS_DIR") {
        settings.plugins.dir = v;
    }
    if let Some(v) = read_env_bool("TETHER_HOT_RELOAD") {
        settings.plugins.hot_reload = v;
    }
    if let Some(v) = read_env_u64("TETHER_DEBOUNCE_MS", 1, 60_000) {
        settings.plugins.debounce_ms = v;
    }
    if let Some(v) = read_env_u64("TETHER_SCRIPT_TIMEOUT_MS", 100, 3_600_000) {
        settings.plugins.script_timeout_ms = v;
    }

    // ── Pairing ─────────────────────────────────────────────────────
    if let Some(v) = read_env_string("TETHER_PAIRING_METHOD") {
        match parse_pairing_method(&v) {
            Some(method) => settings.pairing.method = Some(method),
            None => tracing::warn!(key = "TETHER_PAIRING_METHOD", value = %v, "invalid pairing method env var, ignoring"),
        }
    }
    if let Some(v) = read_env_string("TETHER_PAIRING_PHONE") {
        settings.pairing.phone = Some(v);
    }

    // ── Gateway / database / logging ────────────────────────────────
    if let Some(v) = read_env_string("TETHER_GATEWAY_URL") {
        settings.gateway.url = v;
    }
    if let Some(v) = read_env_string("TETHER_DB_PATH") {
        settings.database.path = v;
    }
    if let Some(v) = read_env_string("TETHER_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_env_bool("TETHER_LOG_JSON") {
        settings.logging.json = v;
    }
    if let Some(v) = read_env_bool("TETHER_LOG_PERSIST") {
        settings.logging.persist = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_pairing_method(val: &str) -> Option<PairingMethodSetting> {
    match val.to_lowercase().as_str() {
        "qr" => Some(PairingMethodSetting::Qr),
        "phone" | "code" => Some(PairingMethodSetting::Phone),
        _ => None,
    }
}

// ── Env var readers ─────────────────────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SettingsError;

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"plugins": {"dir": "plugins", "debounceMs": 300}});
        let source = serde_json::json!({"plugins": {"debounceMs": 50}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["plugins"]["debounceMs"], 50);
        assert_eq!(merged["plugins"]["dir"], "plugins");
    }

    #[test]
    fn merge_array_replace() {
        let target = serde_json::json!({"defaultPrefixes": ["!", "/", "."]});
        let source = serde_json::json!({"defaultPrefixes": ["#"]});
        let merged = deep_merge(target, source);
        assert_eq!(merged["defaultPrefixes"], serde_json::json!(["#"]));
    }

    #[test]
    fn merge_null_preserves_target() {
        let target = serde_json::json!({"a": 1, "b": 2});
        let source = serde_json::json!({"a": null});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 2);
    }

    #[test]
    fn merge_primitive_replaces_object() {
        let target = serde_json::json!({"a": {"nested": true}});
        let source = serde_json::json!({"a": 42});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 42);
    }

    // ── load_settings_from_path ─────────────────────────────────────

    #[test]
    fn load_missing_file_returns_defaults() {
        let settings = load_settings_from_path(Path::new("/nonexistent/settings.json")).unwrap();
        assert_eq!(settings.sessions.max_retries, 5);
    }

    #[test]
    fn load_partial_json_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r##"{"sync": {"maxRetries": 4}, "plugins": {"defaultPrefixes": ["#"]}}"##,
        )
        .unwrap();

        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.sync.max_retries, 4);
        assert!(settings.sync.enabled);
        assert_eq!(settings.plugins.default_prefixes, vec!["#"]);
        assert_eq!(settings.plugins.debounce_ms, 300);
    }

    #[test]
    fn load_invalid_json_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not valid json").unwrap();

        let result = load_settings_from_path(&path);
        assert!(matches!(result, Err(SettingsError::Json(_))));
    }

    #[test]
    fn load_invalid_combination_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"plugins": {"debounceMs": 0}}"#).unwrap();

        let result = load_settings_from_path(&path);
        assert!(matches!(result, Err(SettingsError::InvalidValue(_))));
    }

    // ── parsing ─────────────────────────────────────────────────────

    #[test]
    fn parse_bool_variants() {
        for v in ["true", "1", "YES", "on"] {
            assert_eq!(parse_bool(v), Some(true), "{v}");
        }
        for v in ["false", "0", "no", "OFF"] {
            assert_eq!(parse_bool(v), Some(false), "{v}");
        }
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn parse_u64_range_bounds() {
        assert_eq!(parse_u64_range("5", 1, 10), Some(5));
        assert_eq!(parse_u64_range("0", 1, 10), None);
        assert_eq!(parse_u64_range("11", 1, 10), None);
        assert_eq!(parse_u64_range("-1", 0, 10), None);
    }

    #[test]
    fn parse_pairing_methods() {
        assert_eq!(parse_pairing_method("QR"), Some(PairingMethodSetting::Qr));
        assert_eq!(parse_pairing_method("code"), Some(PairingMethodSetting::Phone));
        assert_eq!(parse_pairing_method("carrier pigeon"), None);
    }
}
