//! Process-scoped session state: live clients, the session registry and the
//! collaborators every client shares.
//!
//! Clients hold an `Arc` back to the hub; the cycle is broken when a client
//! ends its lifecycle (terminal close or `disconnect`) and by [`SessionHub::shutdown`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tether_core::errors::ConnectionError;
use tether_core::ids::SessionId;
use tether_core::store::StoreError;
use tether_core::transport::{Socket, Transport, TransportConfig};
use tether_plugins::PluginRegistry;
use tether_settings::{SessionSettings, SyncSettings, TetherSettings};
use tether_store::SessionStore;
use tracing::{debug, info};

use crate::client::Client;
use crate::options::ClientOptions;
use crate::pairing::PairingPrompt;
use crate::registry::SessionRegistry;
use crate::sync::{self, SyncReport};

#[derive(Clone, Debug, Default)]
pub struct HubConfig {
    pub sessions: SessionSettings,
    pub sync: SyncSettings,
    pub transport: TransportConfig,
}

impl HubConfig {
    pub fn from_settings(settings: &TetherSettings) -> Self {
        Self {
            sessions: settings.sessions.clone(),
            sync: settings.sync.clone(),
            transport: TransportConfig {
                connect_timeout: Duration::from_millis(settings.gateway.connect_timeout_ms),
                ..TransportConfig::default()
            },
        }
    }
}

/// Resets an [`AtomicBool`] claimed with [`FlagGuard::try_acquire`] on drop.
pub(crate) struct FlagGuard<'a>(&'a AtomicBool);

impl<'a> FlagGuard<'a> {
    pub(crate) fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub(crate) struct HubInner {
    pub(crate) sessions: SessionRegistry,
    /// Every client with a lifecycle in progress, registered or not.
    pub(crate) clients: DashMap<SessionId, Arc<Client>>,
    pub(crate) store: SessionStore,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) plugins: Arc<PluginRegistry>,
    pub(crate) prompt: Arc<dyn PairingPrompt>,
    pub(crate) config: HubConfig,
    /// Only one interactive pairing prompt across all sessions.
    pub(crate) configuring: AtomicBool,
    pub(crate) syncing: AtomicBool,
}

impl HubInner {
    pub(crate) async fn connect(
        self: &Arc<Self>,
        id: SessionId,
        options: ClientOptions,
    ) -> Result<Connected, ConnectionError> {
        let client = match self.sessions.get(id) {
            Some(registered) => registered,
            None => Arc::clone(
                self.clients
                    .entry(id)
                    .or_insert_with(|| Client::new(id, options, Arc::clone(self)))
                    .value(),
            ),
        };
        let socket = client.connect().await?;
        Ok(Connected { socket, client })
    }

    /// Put `client` back in the live table. `false` when another client owns its id.
    pub(crate) fn adopt(&self, client: &Arc<Client>) -> bool {
        let stored = self
            .clients
            .entry(client.id())
            .or_insert_with(|| Arc::clone(client));
        Arc::ptr_eq(stored.value(), client)
    }

    /// Drop `client` from the live table if it is still the one stored for its id.
    pub(crate) fn forget(&self, client: &Client) {
        let removed = self
            .clients
            .remove_if(&client.id(), |_, stored| std::ptr::eq(Arc::as_ptr(stored), client));
        if removed.is_some() {
            debug!(session_id = %client.id(), "client released");
        }
    }

    pub(crate) fn is_live(&self, id: SessionId) -> bool {
        self.sessions.contains(id) || self.clients.contains_key(&id)
    }
}

/// Result of a successful [`SessionHub::connect`].
#[derive(Clone)]
pub struct Connected {
    pub socket: Arc<dyn Socket>,
    pub client: Arc<Client>,
}

impl std::fmt::Debug for Connected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connected")
            .field("session_id", &self.client.id())
            .field("state", &self.client.state())
            .finish()
    }
}

/// Entry point for running sessions.
#[derive(Clone)]
pub struct SessionHub {
    inner: Arc<HubInner>,
}

impl SessionHub {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: SessionStore,
        plugins: Arc<PluginRegistry>,
        prompt: Arc<dyn PairingPrompt>,
        config: HubConfig,
    ) -> Self {
        Self {
            inner: Arc::new(HubInner {
                sessions: SessionRegistry::new(),
                clients: DashMap::new(),
                store,
                transport,
                plugins,
                prompt,
                config,
                configuring: AtomicBool::new(false),
                syncing: AtomicBool::new(false),
            }),
        }
    }

    /// Options seeded from the hub's session settings.
    pub fn default_options(&self) -> ClientOptions {
        ClientOptions::from_settings(&self.inner.config.sessions)
    }

    /// Connect `id`, reusing its client when one is already live. `options`
    /// only apply when a new client is created.
    pub async fn connect(
        &self,
        id: SessionId,
        options: ClientOptions,
    ) -> Result<Connected, ConnectionError> {
        self.inner.connect(id, options).await
    }

    pub async fn disconnect(&self, id: SessionId) -> bool {
        let client = self.client(id);
        match client {
            Some(client) => {
                client.disconnect().await;
                true
            }
            None => false,
        }
    }

    /// Log out `id`. Sessions without a live client only lose their persisted state.
    pub async fn logout(&self, id: SessionId) {
        match self.client(id) {
            Some(client) => client.logout().await,
            None => {
                if let Err(e) = self.inner.store.delete_session(id).await {
                    tracing::warn!(session_id = %id, error = %e, "failed to delete session");
                }
            }
        }
    }

    /// Live client for `id`, registered or still connecting.
    pub fn client(&self, id: SessionId) -> Option<Arc<Client>> {
        self.inner
            .clients
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .or_else(|| self.inner.sessions.get(id))
    }

    /// Connected sessions, ascending.
    pub fn list_sessions(&self) -> Vec<SessionId> {
        self.inner.sessions.list()
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.sessions
    }

    pub async fn session_exists(&self, id: SessionId) -> Result<bool, StoreError> {
        self.inner.store.session_exists(id).await
    }

    pub async fn persisted_sessions(&self) -> Result<Vec<SessionId>, StoreError> {
        self.inner.store.session_ids().await
    }

    pub async fn new_session_id(&self) -> Result<SessionId, StoreError> {
        self.inner.store.allocate_session_id().await
    }

    pub fn plugins(&self) -> &Arc<PluginRegistry> {
        &self.inner.plugins
    }

    /// Restore every persisted session except `initiator` and live ones.
    /// `None` if a sweep is already running.
    pub async fn sync_sessions(&self, initiator: SessionId) -> Option<SyncReport> {
        sync::sync_sessions(&self.inner, initiator).await
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.syncing.load(Ordering::Acquire)
    }

    /// Disconnect every live client.
    pub async fn shutdown(&self) {
        let mut clients: Vec<Arc<Client>> = self
            .inner
            .clients
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for client in self.inner.sessions.drain() {
            if !clients.iter().any(|c| Arc::ptr_eq(c, &client)) {
                clients.push(client);
            }
        }
        let count = clients.len();
        futures::future::join_all(clients.iter().map(|client| client.disconnect())).await;
        self.inner.clients.clear();
        info!(count, "session hub shut down");
    }
}
