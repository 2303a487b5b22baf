use serde::{Deserialize, Serialize};

/// Plugin discovery, matching defaults and hot reload.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PluginSettings {
    /// Plugin root (relative to the tether home unless absolute).
    pub dir: String,
    /// Watch the plugin root and reload changed files.
    pub hot_reload: bool,
    /// Per-file quiet period before a change is processed.
    pub debounce_ms: u64,
    /// Event used when a plugin declares none (or none recognized).
    pub default_event: String,
    /// Prefix characters accepted when a plugin does not declare its own.
    pub default_prefixes: Vec<String>,
    /// Wall-clock limit for one script plugin invocation.
    pub script_timeout_ms: u64,
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self {
            dir: "plugins".to_string(),
            hot_reload: true,
            debounce_ms: 300,
            default_event: "messages.upsert".to_string(),
            default_prefixes: vec!["!".into(), "/".into(), ".".into()],
            script_timeout_ms: 30_000,
        }
    }
}

impl PluginSettings {
    /// Default prefixes as characters (multi-character entries are skipped).
    pub fn default_prefix_chars(&self) -> Vec<char> {
        self.default_prefixes
            .iter()
            .filter_map(|p| {
                let mut chars = p.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => Some(c),
                    _ => None,
                }
            })
            .collect()
    }
}
