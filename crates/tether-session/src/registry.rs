use std::sync::Arc;

use dashmap::DashMap;
use tether_core::ids::SessionId;
use tracing::debug;

use crate::client::Client;

/// Live sessions, keyed by id. A client registers itself on open and
/// unregisters on any close; at most one client per id.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Client>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, client: Arc<Client>) {
        let id = client.id();
        if self.sessions.insert(id, client).is_some() {
            debug!(session_id = %id, "session re-registered");
        }
    }

    /// Remove `id` only if it is still registered to `client`.
    pub(crate) fn unregister(&self, id: SessionId, client: &Client) -> bool {
        self.sessions
            .remove_if(&id, |_, registered| std::ptr::eq(Arc::as_ptr(registered), client))
            .is_some()
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Client>> {
        self.sessions.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    /// Registered ids, ascending.
    pub fn list(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.iter().map(|entry| *entry.key()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub(crate) fn drain(&self) -> Vec<Arc<Client>> {
        let ids = self.list();
        ids.into_iter()
            .filter_map(|id| self.sessions.remove(&id).map(|(_, client)| client))
            .collect()
    }
}
