//! Hot reload of plugin files.
//!
//! Filesystem notifications are debounced per path; once a path goes quiet it
//! is processed under that file's lock. A path that no longer exists unloads
//! its plugins. Otherwise the file is loaded in isolation and only a clean load
//! replaces the previous registrations.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::PluginError;
use crate::loader::PluginLoader;
use crate::registry::{PluginRegistry, Replaced};

/// What processing one coalesced notification did.
#[derive(Debug)]
pub enum ReloadOutcome {
    Replaced(Replaced),
    Removed(usize),
    /// Load failed; the registry was not touched.
    Failed(PluginError),
    Skipped,
}

pub struct HotReloader {
    registry: Arc<PluginRegistry>,
    loader: Arc<PluginLoader>,
    debounce: Duration,
    locks: DashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>,
    pending: Mutex<HashMap<PathBuf, (u64, JoinHandle<()>)>>,
    next_timer: AtomicU64,
    watcher: Mutex<Option<RecommendedWatcher>>,
    cancel: CancellationToken,
    this: Weak<HotReloader>,
}

impl HotReloader {
    pub fn new(registry: Arc<PluginRegistry>, loader: Arc<PluginLoader>, debounce: Duration) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            registry,
            loader,
            debounce,
            locks: DashMap::new(),
            pending: Mutex::new(HashMap::new()),
            next_timer: AtomicU64::new(0),
            watcher: Mutex::new(None),
            cancel: CancellationToken::new(),
            this: this.clone(),
        })
    }

    /// Start watching the plugin root. Must be called from within a tokio runtime.
    pub fn watch(&self) -> Result<(), PluginError> {
        let root = self.loader.root().to_path_buf();
        let (fs_tx, mut fs_rx) = mpsc::unbounded_channel::<notify::Result<notify::Event>>();
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = fs_tx.send(res);
        })?;
        watcher.watch(&root, RecursiveMode::Recursive)?;
        *self.watcher.lock() = Some(watcher);

        let this = self.this.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                let result = tokio::select! {
                    () = cancel.cancelled() => break,
                    result = fs_rx.recv() => result,
                };
                let Some(result) = result else { break };
                let Some(reloader) = this.upgrade() else { break };
                match result {
                    Ok(event) => reloader.on_fs_event(event),
                    Err(e) => warn!(error = %e, "plugin watcher error"),
                }
            }
            debug!("plugin watcher stopped");
        });
        info!(root = %root.display(), debounce = ?self.debounce, "watching plugins");
        Ok(())
    }

    /// Stop watching and drop pending timers. In-flight loads finish.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.watcher.lock().take();
        for (_, (_, handle)) in self.pending.lock().drain() {
            handle.abort();
        }
    }

    fn on_fs_event(&self, event: notify::Event) {
        if !matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
        ) {
            return;
        }
        for path in event.paths {
            if path.is_dir() {
                // A directory moved or copied in brings its files with it.
                for entry in WalkDir::new(&path).into_iter().filter_map(Result::ok) {
                    if entry.file_type().is_file() && self.loader.is_eligible(entry.path()) {
                        self.schedule(entry.into_path());
                    }
                }
            } else if self.loader.is_eligible(&path) || self.registry.has_sources_under(&path) {
                self.schedule(path);
            }
        }
    }

    /// (Re)start the debounce timer for `path`.
    pub fn schedule(&self, path: PathBuf) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        if self.cancel.is_cancelled() {
            return;
        }
        let timer = self.next_timer.fetch_add(1, Ordering::Relaxed);
        let debounce = self.debounce;
        let key = path.clone();

        let mut pending = self.pending.lock();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            {
                let mut pending = this.pending.lock();
                if pending.get(&path).is_some_and(|(t, _)| *t == timer) {
                    pending.remove(&path);
                }
            }
            this.process(&path).await;
        });
        if let Some((_, previous)) = pending.insert(key, (timer, handle)) {
            previous.abort();
        }
    }

    /// Number of paths waiting out their debounce window.
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Process one path now, under its file lock.
    pub async fn process(&self, path: &Path) -> ReloadOutcome {
        let lock = Arc::clone(self.locks.entry(path.to_path_buf()).or_default().value());
        let outcome = {
            let _guard = lock.lock().await;
            self.reload(path).await
        };
        if matches!(outcome, ReloadOutcome::Removed(_)) {
            // Last holder of a vanished path drops its lock entry.
            drop(lock);
            self.locks.remove_if(path, |_, lock| Arc::strong_count(lock) == 1);
        }
        outcome
    }

    async fn reload(&self, path: &Path) -> ReloadOutcome {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            let removed = self.registry.remove_file(path);
            debug!(path = %path.display(), removed, "plugin source gone");
            return ReloadOutcome::Removed(removed);
        }
        if !self.loader.is_eligible(path) {
            return ReloadOutcome::Skipped;
        }
        match self.loader.load_file(path).await {
            Ok(plugins) => ReloadOutcome::Replaced(self.registry.replace_file(path, plugins)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "plugin reload failed, keeping previous version");
                ReloadOutcome::Failed(e)
            }
        }
    }

    #[cfg(test)]
    fn locked_paths(&self) -> usize {
        self.locks.len()
    }
}

impl Drop for HotReloader {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    use tether_core::events::ProtocolEvent;
    use tether_core::ids::{PluginId, SessionId};
    use tether_core::mock::MockSocket;
    use tether_core::transport::Socket;

    use crate::catalog::HandlerCatalog;
    use crate::dispatcher::Dispatcher;
    use crate::loader::LoaderConfig;

    const DEBOUNCE: Duration = Duration::from_millis(300);

    struct Fixture {
        _dir: tempfile::TempDir,
        registry: Arc<PluginRegistry>,
        loader: Arc<PluginLoader>,
        reloader: Arc<HotReloader>,
    }

    impl Fixture {
        async fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let registry = PluginRegistry::new();
            let loader = Arc::new(PluginLoader::new(
                dir.path(),
                Arc::new(HandlerCatalog::with_builtins()),
                LoaderConfig::default(),
            ));
            let reloader = HotReloader::new(Arc::clone(&registry), Arc::clone(&loader), DEBOUNCE);
            Self {
                _dir: dir,
                registry,
                loader,
                reloader,
            }
        }

        fn write(&self, rel: &str, body: &str) -> PathBuf {
            let path = self.loader.root().join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, body).unwrap();
            path
        }

        async fn load_initial(&self) {
            let report = self.loader.load_all().await;
            assert!(report.failures.is_empty());
            self.registry.register_all(report.plugins);
        }

        async fn settle(&self) {
            for _ in 0..200 {
                if self.reloader.pending() == 0 {
                    // Give the processing task a chance to finish after the timer fired.
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    if self.reloader.pending() == 0 {
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            panic!("reload never settled");
        }
    }

    const TWO_EXPORTS: &str = r#"{
        "default": { "handler": "ping", "match": "ping" },
        "calls": { "handler": "echo", "events": "call" }
    }"#;

    #[tokio::test(start_paused = true)]
    async fn shrinking_a_file_unsubscribes_dead_events() {
        let fx = Fixture::new().await;
        let path = fx.write("fun/multi.json", TWO_EXPORTS);
        fx.load_initial().await;

        let mock = Arc::new(MockSocket::new(SessionId::new(1)));
        let socket: Arc<dyn Socket> = mock.clone();
        let _dispatcher = Dispatcher::attach(Arc::clone(&fx.registry), socket);
        assert_eq!(
            mock.subscribed_events(),
            vec![ProtocolEvent::MessagesUpsert, ProtocolEvent::Call]
        );

        fx.write("fun/multi.json", r#"{ "default": { "handler": "ping", "match": "ping" } }"#);
        fx.reloader.schedule(path.clone());
        fx.settle().await;

        let from_file: Vec<_> = fx
            .registry
            .snapshot()
            .into_iter()
            .filter(|p| p.source == path)
            .collect();
        assert_eq!(from_file.len(), 1);
        assert_eq!(from_file[0].id.as_str(), "fun/multi#default");
        assert_eq!(mock.subscribed_events(), vec![ProtocolEvent::MessagesUpsert]);
        assert_eq!(fx.registry.event_count(ProtocolEvent::Call), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_notifications_coalesce() {
        let fx = Fixture::new().await;
        let path = fx.write("ping.json", r#"{ "handler": "ping" }"#);
        fx.load_initial().await;
        let before = fx.registry.generation();

        fx.reloader.schedule(path.clone());
        tokio::time::sleep(Duration::from_millis(200)).await;
        fx.reloader.schedule(path.clone());
        tokio::time::sleep(Duration::from_millis(200)).await;
        // 400ms after the first notification, the restarted timer is still pending.
        assert_eq!(fx.reloader.pending(), 1);
        assert_eq!(fx.registry.generation(), before);
        fx.reloader.schedule(path);
        fx.settle().await;

        assert_eq!(fx.registry.generation(), before + 1);
        assert_eq!(fx.registry.plugin_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reload_keeps_previous_plugins() {
        let fx = Fixture::new().await;
        let path = fx.write("ping.json", r#"{ "handler": "ping", "match": "ping" }"#);
        fx.load_initial().await;
        let version = fx.registry.snapshot()[0].version;

        fx.write("ping.json", r#"{ "handler": "does-not-exist" }"#);
        let outcome = fx.reloader.process(&path).await;
        assert!(matches!(outcome, ReloadOutcome::Failed(PluginError::UnknownHandler { .. })));

        let plugins = fx.registry.snapshot();
        assert_eq!(plugins.len(), 1);
        assert_eq!(plugins[0].version, version);
    }

    #[tokio::test(start_paused = true)]
    async fn unlink_removes_file_plugins() {
        let fx = Fixture::new().await;
        let path = fx.write("multi.json", TWO_EXPORTS);
        fx.write("other.json", r#"{ "handler": "ping" }"#);
        fx.load_initial().await;
        assert_eq!(fx.registry.plugin_count(), 3);

        fs::remove_file(&path).unwrap();
        fx.reloader.schedule(path);
        fx.settle().await;
        assert_eq!(fx.registry.plugin_count(), 1);
        assert_eq!(fx.registry.event_count(ProtocolEvent::Call), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn lock_table_forgets_deleted_files() {
        let fx = Fixture::new().await;
        let kept = fx.write("kept.json", r#"{ "handler": "ping" }"#);
        fx.load_initial().await;
        assert!(matches!(fx.reloader.process(&kept).await, ReloadOutcome::Replaced(_)));
        assert_eq!(fx.reloader.locked_paths(), 1);

        for i in 0..5 {
            let path = fx.write(&format!("tmp{i}.json"), r#"{ "handler": "ping" }"#);
            fx.reloader.process(&path).await;
            fs::remove_file(&path).unwrap();
            assert!(matches!(fx.reloader.process(&path).await, ReloadOutcome::Removed(1)));
        }
        assert_eq!(fx.reloader.locked_paths(), 1);
        assert_eq!(fx.registry.plugin_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn new_file_is_picked_up() {
        let fx = Fixture::new().await;
        let path = fx.write("admin/new.json", r#"{ "handler": "ping", "match": ["ping"] }"#);
        match fx.reloader.process(&path).await {
            ReloadOutcome::Replaced(r) => assert_eq!(r, Replaced { removed: 0, installed: 1 }),
            other => panic!("unexpected {other:?}"),
        }
        let plugin = fx.registry.snapshot().pop().unwrap();
        assert_eq!(plugin.group.as_deref(), Some("admin"));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_drops_pending_timers() {
        let fx = Fixture::new().await;
        let path = fx.write("ping.json", r#"{ "handler": "ping" }"#);
        fx.reloader.schedule(path.clone());
        assert_eq!(fx.reloader.pending(), 1);
        fx.reloader.stop();
        assert_eq!(fx.reloader.pending(), 0);
        fx.reloader.schedule(path);
        assert_eq!(fx.reloader.pending(), 0);
        tokio::time::sleep(DEBOUNCE * 2).await;
        assert_eq!(fx.registry.plugin_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn filesystem_changes_trigger_reload() {
        let fx = Fixture::new().await;
        fx.reloader.watch().unwrap();
        fx.write("live.json", r#"{ "handler": "ping", "match": "ping" }"#);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while fx.registry.plugin_count() == 0 {
            assert!(tokio::time::Instant::now() < deadline, "watcher never loaded the file");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(fx.registry.get(&PluginId::from_raw("live#default")).is_some());
        fx.reloader.stop();
    }
}
