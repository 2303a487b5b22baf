use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("backend error: {0}")]
    Backend(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid key: {0}")]
    InvalidKey(String),
}

/// One write inside an atomic [`KeyStore::batch`].
#[derive(Clone, Debug, PartialEq)]
pub enum BatchOp {
    Put(String, Value),
    Remove(String),
}

/// Persistence collaborator: an ordered key-value store of JSON blobs.
#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    async fn put(&self, key: &str, value: Value) -> Result<(), StoreError>;

    /// Returns whether the key existed.
    async fn remove(&self, key: &str) -> Result<bool, StoreError>;

    /// All entries whose key starts with `prefix`, in key order.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>, StoreError>;

    /// Apply every op or none.
    async fn batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError>;

    /// Atomically allocate the next value of a named counter (starting at 1).
    async fn next_id(&self, counter: &str) -> Result<u64, StoreError>;
}

/// In-memory [`KeyStore`].
#[derive(Default)]
pub struct MemoryKeyStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    entries: BTreeMap<String, Value>,
    counters: HashMap<String, u64>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.inner.lock().entries.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Value) -> Result<(), StoreError> {
        if key.is_empty() {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        self.inner.lock().entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.inner.lock().entries.remove(key).is_some())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
        if let Some(BatchOp::Put(key, _)) = ops
            .iter()
            .find(|op| matches!(op, BatchOp::Put(k, _) if k.is_empty()))
        {
            return Err(StoreError::InvalidKey(key.clone()));
        }
        let mut inner = self.inner.lock();
        for op in ops {
            match op {
                BatchOp::Put(key, value) => {
                    inner.entries.insert(key, value);
                }
                BatchOp::Remove(key) => {
                    inner.entries.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn next_id(&self, counter: &str) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock();
        let next = inner.counters.entry(counter.to_string()).or_insert(0);
        *next += 1;
        Ok(*next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn put_get_remove() {
        let store = MemoryKeyStore::new();
        store.put("a", json!(1)).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(json!(1)));
        assert!(store.remove("a").await.unwrap());
        assert!(!store.remove("a").await.unwrap());
        assert!(store.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_key_rejected() {
        let store = MemoryKeyStore::new();
        assert!(matches!(
            store.put("", json!(1)).await,
            Err(StoreError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn scan_prefix_is_ordered_and_bounded() {
        let store = MemoryKeyStore::new();
        store.put("session:2:creds", json!(2)).await.unwrap();
        store.put("session:1:creds", json!(1)).await.unwrap();
        store.put("sessionx", json!(0)).await.unwrap();
        store.put("other", json!(0)).await.unwrap();

        let keys: Vec<_> = store
            .scan_prefix("session:")
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["session:1:creds", "session:2:creds"]);
    }

    #[tokio::test]
    async fn batch_is_all_or_nothing() {
        let store = MemoryKeyStore::new();
        store.put("keep", json!(true)).await.unwrap();
        let result = store
            .batch(vec![
                BatchOp::Remove("keep".into()),
                BatchOp::Put(String::new(), json!(1)),
            ])
            .await;
        assert!(result.is_err());
        assert_eq!(store.get("keep").await.unwrap(), Some(json!(true)));

        store
            .batch(vec![
                BatchOp::Remove("keep".into()),
                BatchOp::Put("new".into(), json!(1)),
            ])
            .await
            .unwrap();
        assert!(store.get("keep").await.unwrap().is_none());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn counters_are_independent() {
        let store = MemoryKeyStore::new();
        assert_eq!(store.next_id("session").await.unwrap(), 1);
        assert_eq!(store.next_id("session").await.unwrap(), 2);
        assert_eq!(store.next_id("other").await.unwrap(), 1);
    }
}
