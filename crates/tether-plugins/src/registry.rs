//! Process-wide plugin table with per-event buckets and reference counts.
//!
//! Every mutation runs under one write lock and is followed by a resync of all
//! live [`Dispatcher`]s, so each socket subscribes to exactly the events some
//! plugin currently wants.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tether_core::events::ProtocolEvent;
use tether_core::ids::PluginId;
use tracing::{debug, info};

use crate::dispatcher::Dispatcher;
use crate::plugin::Plugin;

/// Plugins for one event, split by whether they carry a matcher.
#[derive(Clone, Debug, Default)]
pub struct Bucket {
    pub unconditional: Vec<Arc<Plugin>>,
    pub conditioned: Vec<Arc<Plugin>>,
}

impl Bucket {
    pub fn is_empty(&self) -> bool {
        self.unconditional.is_empty() && self.conditioned.is_empty()
    }
}

#[derive(Default)]
struct EventSlot {
    bucket: Bucket,
    refs: usize,
}

#[derive(Default)]
struct RegistryState {
    plugins: BTreeMap<PluginId, Arc<Plugin>>,
    events: HashMap<ProtocolEvent, EventSlot>,
    generation: u64,
}

impl RegistryState {
    fn install(&mut self, mut plugin: Plugin) -> Arc<Plugin> {
        if self.plugins.contains_key(&plugin.id) {
            debug!(plugin_id = %plugin.id, "superseding plugin with the same id");
            self.uninstall(&plugin.id);
        }
        self.generation += 1;
        plugin.version = self.generation;
        let mut seen = HashSet::with_capacity(plugin.events.len());
        plugin.events.retain(|event| seen.insert(*event));
        let plugin = Arc::new(plugin);
        for event in &plugin.events {
            let slot = self.events.entry(*event).or_default();
            if plugin.is_conditioned() {
                slot.bucket.conditioned.push(Arc::clone(&plugin));
            } else {
                slot.bucket.unconditional.push(Arc::clone(&plugin));
            }
            slot.refs += 1;
        }
        self.plugins.insert(plugin.id.clone(), Arc::clone(&plugin));
        plugin
    }

    fn uninstall(&mut self, id: &PluginId) -> Option<Arc<Plugin>> {
        let plugin = self.plugins.remove(id)?;
        for event in &plugin.events {
            if let Some(slot) = self.events.get_mut(event) {
                let list = if plugin.is_conditioned() {
                    &mut slot.bucket.conditioned
                } else {
                    &mut slot.bucket.unconditional
                };
                list.retain(|p| p.id != *id);
                slot.refs = slot.refs.saturating_sub(1);
            }
        }
        Some(plugin)
    }

    /// Ids whose source is `path` or lives under it.
    fn ids_from(&self, path: &Path) -> Vec<PluginId> {
        self.plugins
            .values()
            .filter(|p| p.source.starts_with(path))
            .map(|p| p.id.clone())
            .collect()
    }
}

/// Outcome of [`PluginRegistry::replace_file`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Replaced {
    pub removed: usize,
    pub installed: usize,
}

#[derive(Default)]
pub struct PluginRegistry {
    state: RwLock<RegistryState>,
    instances: Mutex<Vec<Weak<Dispatcher>>>,
}

impl PluginRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Install one plugin. Disabled plugins are ignored.
    pub fn register(&self, plugin: Plugin) -> Option<Arc<Plugin>> {
        if !plugin.enabled {
            debug!(plugin_id = %plugin.id, "not registering disabled plugin");
            return None;
        }
        let installed = self.state.write().install(plugin);
        debug!(plugin_id = %installed.id, version = installed.version, "plugin registered");
        self.resync_instances();
        Some(installed)
    }

    /// Install a batch under one lock. Returns how many were installed.
    pub fn register_all(&self, plugins: Vec<Plugin>) -> usize {
        let installed = {
            let mut state = self.state.write();
            plugins
                .into_iter()
                .filter(|p| p.enabled)
                .map(|p| state.install(p))
                .count()
        };
        info!(installed, "plugins registered");
        self.resync_instances();
        installed
    }

    pub fn unregister(&self, id: &PluginId) -> bool {
        let removed = self.state.write().uninstall(id).is_some();
        if removed {
            self.resync_instances();
        }
        removed
    }

    /// Atomically swap every plugin loaded from `path` for `plugins`.
    pub fn replace_file(&self, path: &Path, plugins: Vec<Plugin>) -> Replaced {
        let outcome = {
            let mut state = self.state.write();
            let stale = state.ids_from(path);
            for id in &stale {
                state.uninstall(id);
            }
            let installed = plugins
                .into_iter()
                .filter(|p| p.enabled)
                .map(|p| state.install(p))
                .count();
            Replaced {
                removed: stale.len(),
                installed,
            }
        };
        info!(
            path = %path.display(),
            removed = outcome.removed,
            installed = outcome.installed,
            "plugin file reloaded"
        );
        self.resync_instances();
        outcome
    }

    /// Drop every plugin whose source is `path` (or lies under it, for directories).
    pub fn remove_file(&self, path: &Path) -> usize {
        let removed = {
            let mut state = self.state.write();
            let ids = state.ids_from(path);
            for id in &ids {
                state.uninstall(id);
            }
            ids.len()
        };
        if removed > 0 {
            info!(path = %path.display(), removed, "plugins unloaded");
            self.resync_instances();
        }
        removed
    }

    /// Remove everything.
    pub fn clear(&self) -> usize {
        let removed = {
            let mut state = self.state.write();
            let ids: Vec<PluginId> = state.plugins.keys().cloned().collect();
            for id in &ids {
                state.uninstall(id);
            }
            ids.len()
        };
        self.resync_instances();
        removed
    }

    pub fn get(&self, id: &PluginId) -> Option<Arc<Plugin>> {
        self.state.read().plugins.get(id).cloned()
    }

    /// All plugins, ordered by id.
    pub fn snapshot(&self) -> Vec<Arc<Plugin>> {
        self.state.read().plugins.values().cloned().collect()
    }

    /// Events with at least one interested plugin.
    pub fn active_events(&self) -> Vec<ProtocolEvent> {
        let state = self.state.read();
        let mut events: Vec<ProtocolEvent> = state
            .events
            .iter()
            .filter(|(_, slot)| slot.refs > 0)
            .map(|(event, _)| *event)
            .collect();
        events.sort();
        events
    }

    /// Live reference count for `event`.
    pub fn event_count(&self, event: ProtocolEvent) -> usize {
        self.state.read().events.get(&event).map_or(0, |slot| slot.refs)
    }

    pub fn plugin_count(&self) -> usize {
        self.state.read().plugins.len()
    }

    pub fn generation(&self) -> u64 {
        self.state.read().generation
    }

    pub fn bucket(&self, event: ProtocolEvent) -> Bucket {
        self.state
            .read()
            .events
            .get(&event)
            .map(|slot| slot.bucket.clone())
            .unwrap_or_default()
    }

    /// Distinct source files currently contributing plugins.
    pub fn sources(&self) -> BTreeSet<PathBuf> {
        self.state
            .read()
            .plugins
            .values()
            .map(|p| p.source.clone())
            .collect()
    }

    pub fn has_sources_under(&self, path: &Path) -> bool {
        self.state
            .read()
            .plugins
            .values()
            .any(|p| p.source.starts_with(path))
    }

    /// Number of live dispatcher instances.
    pub fn instance_count(&self) -> usize {
        let mut instances = self.instances.lock();
        instances.retain(|w| w.strong_count() > 0);
        instances
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|d| d.is_alive())
            .count()
    }

    pub(crate) fn attach(&self, dispatcher: &Arc<Dispatcher>) {
        self.instances.lock().push(Arc::downgrade(dispatcher));
    }

    pub(crate) fn detach(&self, dispatcher: &Dispatcher) {
        let remaining = {
            let mut instances = self.instances.lock();
            instances.retain(|w| {
                w.upgrade()
                    .is_some_and(|d| !std::ptr::eq(Arc::as_ptr(&d), dispatcher) && d.is_alive())
            });
            instances.len()
        };
        if remaining == 0 {
            info!("last dispatcher released");
        }
    }

    /// Resynchronize every live instance, pruning dead ones.
    fn resync_instances(&self) {
        let live: Vec<Arc<Dispatcher>> = {
            let mut instances = self.instances.lock();
            let mut live = Vec::with_capacity(instances.len());
            instances.retain(|w| match w.upgrade() {
                Some(d) if d.is_alive() => {
                    live.push(d);
                    true
                }
                _ => false,
            });
            live
        };
        for dispatcher in live {
            dispatcher.resync();
        }
    }
}
