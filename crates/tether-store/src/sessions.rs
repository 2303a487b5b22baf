use std::collections::BTreeSet;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tether_core::ids::SessionId;
use tether_core::store::{BatchOp, KeyStore, StoreError};
use tracing::{debug, instrument, warn};

const SESSION_PREFIX: &str = "session:";
const SESSION_COUNTER: &str = "session";
const CREDS_SUFFIX: &str = ":creds";

/// Session-scoped view over a [`KeyStore`].
///
/// Layout: `session:<id>:creds` holds the credential blob; any other key under
/// `session:<id>:` belongs to that session and is removed with it.
#[derive(Clone)]
pub struct SessionStore {
    store: Arc<dyn KeyStore>,
}

impl SessionStore {
    pub fn new(store: Arc<dyn KeyStore>) -> Self {
        Self { store }
    }

    pub fn key_store(&self) -> &Arc<dyn KeyStore> {
        &self.store
    }

    fn creds_key(id: SessionId) -> String {
        format!("{SESSION_PREFIX}{id}{CREDS_SUFFIX}")
    }

    fn session_prefix(id: SessionId) -> String {
        format!("{SESSION_PREFIX}{id}:")
    }

    /// Key for a session-owned auxiliary value.
    pub fn session_key(id: SessionId, name: &str) -> String {
        format!("{SESSION_PREFIX}{id}:{name}")
    }

    pub async fn credentials(&self, id: SessionId) -> Result<Option<Value>, StoreError> {
        self.store.get(&Self::creds_key(id)).await
    }

    #[instrument(skip(self, credentials), fields(session_id = %id))]
    pub async fn save_credentials(&self, id: SessionId, credentials: Value) -> Result<(), StoreError> {
        self.store.put(&Self::creds_key(id), credentials).await?;
        debug!("credentials saved");
        Ok(())
    }

    /// Remove every key belonging to the session. Returns the number removed.
    #[instrument(skip(self), fields(session_id = %id))]
    pub async fn delete_session(&self, id: SessionId) -> Result<usize, StoreError> {
        let keys: Vec<String> = self
            .store
            .scan_prefix(&Self::session_prefix(id))
            .await?
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        let removed = keys.len();
        if removed > 0 {
            self.store
                .batch(keys.into_iter().map(BatchOp::Remove).collect())
                .await?;
        }
        debug!(removed, "session deleted");
        Ok(removed)
    }

    /// Every session that has persisted credentials, ascending.
    pub async fn session_ids(&self) -> Result<Vec<SessionId>, StoreError> {
        let ids: BTreeSet<SessionId> = self
            .store
            .scan_prefix(SESSION_PREFIX)
            .await?
            .into_iter()
            .filter_map(|(key, _)| {
                key.strip_prefix(SESSION_PREFIX)?
                    .strip_suffix(CREDS_SUFFIX)?
                    .parse()
                    .ok()
            })
            .collect();
        Ok(ids.into_iter().collect())
    }

    pub async fn session_exists(&self, id: SessionId) -> Result<bool, StoreError> {
        Ok(self.credentials(id).await?.is_some())
    }

    /// Allocate a fresh id that no persisted session uses yet.
    pub async fn allocate_session_id(&self) -> Result<SessionId, StoreError> {
        loop {
            let id = SessionId::new(self.store.next_id(SESSION_COUNTER).await?);
            if !self.session_exists(id).await? {
                return Ok(id);
            }
        }
    }

    /// Read and decode a value. Backend and decode failures are logged and read as absent.
    pub async fn read_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = match self.store.get(key).await {
            Ok(value) => value?,
            Err(e) => {
                warn!(key, error = %e, "failed to read stored value");
                return None;
            }
        };
        match serde_json::from_value(value) {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                warn!(key, error = %e, "failed to decode stored value, treating as missing");
                None
            }
        }
    }
}
