//! Plugin discovery and manifest loading.
//!
//! Plugin files are JSON manifests under the plugin root. Each top-level key is
//! an export; an export is callable when it names a catalog `handler` or a
//! script `command`:
//!
//! ```json
//! {
//!   "default": { "handler": "ping", "match": ["ping"] },
//!   "shout": { "command": ["./shout.sh"], "match": [{ "pattern": "^shout (.+)", "flags": "i" }], "prefix": false }
//! }
//! ```
//!
//! A manifest with `handler` or `command` at the top level is a lone default
//! export. Top-level `match`, `prefix`, `events` and `enabled` keys are metadata
//! for a callable default export.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value};
use tether_core::events::ProtocolEvent;
use tether_core::ids::PluginId;
use tether_settings::PluginSettings;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::catalog::HandlerCatalog;
use crate::error::PluginError;
use crate::matcher::{Matcher, PrefixPolicy, Trigger};
use crate::plugin::{Plugin, PluginHandler};
use crate::script::ScriptHandler;

const MANIFEST_EXTENSION: &str = "json";
const DECLARATION_SUFFIX: &str = ".schema.json";
const PRIVATE_MARKER: char = '_';
const DEFAULT_EXPORT: &str = "default";
const METADATA_KEYS: &[&str] = &["match", "prefix", "events", "enabled"];

/// Defaults applied to every loaded plugin.
#[derive(Clone, Debug)]
pub struct LoaderConfig {
    pub default_event: ProtocolEvent,
    pub default_prefixes: Vec<char>,
    pub script_timeout: Duration,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self::from_settings(&PluginSettings::default())
    }
}

impl LoaderConfig {
    pub fn from_settings(settings: &PluginSettings) -> Self {
        let default_event = settings.default_event.parse().unwrap_or_else(|_| {
            warn!(
                event = %settings.default_event,
                "unknown default plugin event, using messages.upsert"
            );
            ProtocolEvent::MessagesUpsert
        });
        Self {
            default_event,
            default_prefixes: settings.default_prefix_chars(),
            script_timeout: Duration::from_millis(settings.script_timeout_ms),
        }
    }
}

/// Plugins from one discovery pass, plus the files that failed to load.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub plugins: Vec<Plugin>,
    pub failures: Vec<(PathBuf, PluginError)>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ExportSpec {
    handler: Option<String>,
    command: Option<CommandSpec>,
    #[serde(rename = "match")]
    triggers: Option<Value>,
    prefix: Option<Value>,
    events: Option<Value>,
    enabled: Option<bool>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CommandSpec {
    Line(String),
    Argv(Vec<String>),
}

impl CommandSpec {
    fn into_argv(self) -> Vec<String> {
        match self {
            Self::Line(line) => line.split_whitespace().map(str::to_string).collect(),
            Self::Argv(argv) => argv,
        }
    }
}

fn is_callable(entry: &Map<String, Value>) -> bool {
    entry.contains_key("handler") || entry.contains_key("command")
}

pub struct PluginLoader {
    root: PathBuf,
    catalog: Arc<HandlerCatalog>,
    config: LoaderConfig,
}

impl PluginLoader {
    pub fn new(root: impl Into<PathBuf>, catalog: Arc<HandlerCatalog>, config: LoaderConfig) -> Self {
        let root = root.into();
        // Watcher events carry canonical paths.
        let root = std::fs::canonicalize(&root).unwrap_or(root);
        Self {
            root,
            catalog,
            config,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    fn relative<'a>(&self, path: &'a Path) -> Option<&'a Path> {
        path.strip_prefix(&self.root).ok()
    }

    /// Whether `path` is a plugin source file: a `.json` manifest under the
    /// root, not private (`_name`), not a declaration (`.schema.json`), not hidden.
    pub fn is_eligible(&self, path: &Path) -> bool {
        let Some(rel) = self.relative(path) else {
            return false;
        };
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        if name.starts_with(PRIVATE_MARKER) || name.ends_with(DECLARATION_SUFFIX) {
            return false;
        }
        if path.extension().and_then(|e| e.to_str()) != Some(MANIFEST_EXTENSION) {
            return false;
        }
        !rel.components().any(|c| match c {
            Component::Normal(part) => part.to_str().is_some_and(|p| p.starts_with('.')),
            _ => true,
        })
    }

    /// Eligible files under the root, sorted.
    pub fn discover(&self) -> Vec<PathBuf> {
        if !self.root.is_dir() {
            debug!(root = %self.root.display(), "plugin root missing");
            return Vec::new();
        }
        let root = self.root.clone();
        let mut files: Vec<PathBuf> = WalkDir::new(&self.root)
            .follow_links(true)
            .into_iter()
            .filter_entry(move |entry| {
                entry.path() == root
                    || !entry.file_name().to_str().is_some_and(|n| n.starts_with('.'))
            })
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(error = %e, "failed to read plugin directory entry");
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file())
            .map(walkdir::DirEntry::into_path)
            .filter(|path| self.is_eligible(path))
            .collect();
        files.sort();
        debug!(count = files.len(), "discovered plugin files");
        files
    }

    /// Discover and load every file. Failures are collected, never fatal.
    pub async fn load_all(&self) -> LoadReport {
        let mut report = LoadReport::default();
        for path in self.discover() {
            match self.load_file(&path).await {
                Ok(plugins) => report.plugins.extend(plugins),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to load plugin file");
                    report.failures.push((path, e));
                }
            }
        }
        report
    }

    /// Relative path without extension, `/`-separated.
    pub fn id_base(&self, path: &Path) -> Option<String> {
        let rel = self.relative(path)?.with_extension("");
        let parts: Vec<&str> = rel
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => part.to_str(),
                _ => None,
            })
            .collect();
        (!parts.is_empty()).then(|| parts.join("/"))
    }

    /// First directory under the root, `None` for files directly in it.
    pub fn group(&self, path: &Path) -> Option<String> {
        let rel = self.relative(path)?;
        let mut components = rel.components();
        let first = components.next()?;
        components.next()?;
        match first {
            Component::Normal(dir) => dir.to_str().map(str::to_string),
            _ => None,
        }
    }

    /// Read and parse one manifest from disk, always re-reading the file.
    pub async fn load_file(&self, path: &Path) -> Result<Vec<Plugin>, PluginError> {
        if !self.is_eligible(path) {
            return Err(PluginError::Ineligible(path.to_path_buf()));
        }
        let raw = tokio::fs::read(path).await.map_err(PluginError::io(path))?;
        let modified = tokio::fs::metadata(path)
            .await
            .and_then(|m| m.modified())
            .ok();
        let manifest: Value = serde_json::from_slice(&raw)
            .map_err(|e| PluginError::manifest(path, e.to_string()))?;
        let mut plugins = self.parse_manifest(path, manifest)?;
        for plugin in &mut plugins {
            plugin.modified = modified;
        }
        debug!(path = %path.display(), count = plugins.len(), "loaded plugin file");
        Ok(plugins)
    }

    fn parse_manifest(&self, path: &Path, manifest: Value) -> Result<Vec<Plugin>, PluginError> {
        let Value::Object(mut manifest) = manifest else {
            return Err(PluginError::manifest(path, "manifest must be a JSON object"));
        };
        let id_base = self
            .id_base(path)
            .ok_or_else(|| PluginError::manifest(path, "path outside plugin root"))?;

        if is_callable(&manifest) {
            let mut lone = Map::new();
            lone.insert(DEFAULT_EXPORT.to_string(), Value::Object(manifest));
            manifest = lone;
        }

        let mut exports: Vec<(String, Map<String, Value>)> = Vec::new();
        let mut metadata = Map::new();
        for (name, value) in manifest {
            match value {
                Value::Object(entry) if is_callable(&entry) => exports.push((name, entry)),
                value if METADATA_KEYS.contains(&name.as_str()) => {
                    metadata.insert(name, value);
                }
                _ => debug!(path = %path.display(), export = %name, "skipping non-callable export"),
            }
        }

        if !metadata.is_empty() {
            match exports.iter_mut().find(|(name, _)| name == DEFAULT_EXPORT) {
                Some((_, default)) => {
                    for (key, value) in metadata {
                        default.entry(key).or_insert(value);
                    }
                }
                None => debug!(path = %path.display(), "metadata without a callable default export"),
            }
        }

        let mut plugins = Vec::with_capacity(exports.len());
        for (name, entry) in exports {
            if let Some(plugin) = self.build_plugin(path, &id_base, &name, entry)? {
                plugins.push(plugin);
            }
        }
        Ok(plugins)
    }

    fn build_plugin(
        &self,
        path: &Path,
        id_base: &str,
        export: &str,
        entry: Map<String, Value>,
    ) -> Result<Option<Plugin>, PluginError> {
        let spec: ExportSpec = serde_json::from_value(Value::Object(entry))
            .map_err(|e| PluginError::manifest(path, format!("export {export}: {e}")))?;
        let id = PluginId::new(id_base, export);
        if spec.enabled == Some(false) {
            debug!(plugin_id = %id, "plugin disabled");
            return Ok(None);
        }

        let handler = self.resolve_handler(path, export, spec.handler, spec.command)?;
        let triggers = parse_triggers(path, spec.triggers.as_ref())?;
        let policy = parse_prefix(path, spec.prefix.as_ref())?;
        let events = self.parse_events(&id, spec.events.as_ref());
        let matcher = Matcher::compile(triggers, &policy, &self.config.default_prefixes);

        let mut plugin = Plugin::new(id, handler, events)
            .with_matcher(matcher)
            .with_source(path)
            .with_group(self.group(path));
        plugin.description = spec.description;
        Ok(Some(plugin))
    }

    fn resolve_handler(
        &self,
        path: &Path,
        export: &str,
        handler: Option<String>,
        command: Option<CommandSpec>,
    ) -> Result<Arc<dyn PluginHandler>, PluginError> {
        match (handler, command) {
            (Some(_), Some(_)) => Err(PluginError::manifest(
                path,
                format!("export {export} declares both handler and command"),
            )),
            (Some(name), None) => {
                self.catalog
                    .get(&name)
                    .ok_or_else(|| PluginError::UnknownHandler {
                        name,
                        path: path.to_path_buf(),
                    })
            }
            (None, Some(command)) => {
                let cwd = path.parent().unwrap_or(&self.root).to_path_buf();
                let script = ScriptHandler::new(command.into_argv(), cwd, self.config.script_timeout)?;
                Ok(Arc::new(script))
            }
            (None, None) => Err(PluginError::manifest(
                path,
                format!("export {export} is not callable"),
            )),
        }
    }

    fn parse_events(&self, id: &PluginId, events: Option<&Value>) -> Vec<ProtocolEvent> {
        let names: Vec<&str> = match events {
            Some(Value::String(name)) => vec![name.as_str()],
            Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        };
        let mut parsed = Vec::new();
        for name in names {
            match name.parse::<ProtocolEvent>() {
                Ok(event) if !parsed.contains(&event) => parsed.push(event),
                Ok(_) => {}
                Err(_) => warn!(plugin_id = %id, event = name, "ignoring unknown event"),
            }
        }
        if parsed.is_empty() {
            parsed.push(self.config.default_event);
        }
        parsed
    }
}

fn parse_triggers(path: &Path, value: Option<&Value>) -> Result<Vec<Trigger>, PluginError> {
    let items: Vec<&Value> = match value {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(items)) => items.iter().collect(),
        Some(single) => vec![single],
    };
    items
        .into_iter()
        .map(|item| match item {
            Value::String(s) => Trigger::parse(s),
            Value::Object(obj) => {
                let pattern = obj
                    .get("pattern")
                    .and_then(Value::as_str)
                    .ok_or_else(|| PluginError::manifest(path, "pattern trigger without `pattern`"))?;
                let flags = obj.get("flags").and_then(Value::as_str).unwrap_or_default();
                Trigger::pattern(pattern, flags)
            }
            other => Err(PluginError::manifest(path, format!("invalid trigger {other}"))),
        })
        .collect()
}

fn parse_prefix(path: &Path, value: Option<&Value>) -> Result<PrefixPolicy, PluginError> {
    match value {
        None | Some(Value::Null | Value::Bool(true)) => Ok(PrefixPolicy::Default),
        Some(Value::Bool(false)) => Ok(PrefixPolicy::None),
        Some(Value::String(chars)) => Ok(PrefixPolicy::Explicit(chars.chars().collect())),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                let s = item.as_str().unwrap_or_default();
                let mut chars = s.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => Ok(c),
                    _ => Err(PluginError::manifest(
                        path,
                        format!("prefix entries must be single characters, got {item}"),
                    )),
                }
            })
            .collect::<Result<Vec<_>, _>>()
            .map(PrefixPolicy::Explicit),
        Some(other) => Err(PluginError::manifest(path, format!("invalid prefix {other}"))),
    }
}
