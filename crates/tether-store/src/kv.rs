use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use tether_core::store::{BatchOp, KeyStore, StoreError};

use crate::database::{db_err, Database};

/// [`KeyStore`] backed by the `kv` and `counters` tables.
#[derive(Clone)]
pub struct SqliteKeyStore {
    db: Database,
}

impl SqliteKeyStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Database::open(path).map(Self::new)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Database::in_memory().map(Self::new)
    }
}

fn decode(key: &str, raw: &str) -> Result<Value, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Backend(format!("corrupt value at {key}: {e}")))
}

/// Upper bound for a prefix range scan (`prefix` with its last char bumped).
fn prefix_end(prefix: &str) -> Option<String> {
    let mut chars: Vec<char> = prefix.chars().collect();
    while let Some(last) = chars.pop() {
        if let Some(next) = char::from_u32(u32::from(last) + 1) {
            chars.push(next);
            return Some(chars.into_iter().collect());
        }
    }
    None
}

#[async_trait]
impl KeyStore for SqliteKeyStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let raw: Option<String> = self.db.with_conn(|conn| {
            conn.query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()
            .map_err(db_err("get"))
        })?;
        raw.map(|r| decode(key, &r)).transpose()
    }

    async fn put(&self, key: &str, value: Value) -> Result<(), StoreError> {
        if key.is_empty() {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        let raw = serde_json::to_string(&value)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, raw, Utc::now().to_rfc3339()],
            )
            .map_err(db_err("put"))?;
            Ok(())
        })
    }

    async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let n = conn
                .execute("DELETE FROM kv WHERE key = ?1", [key])
                .map_err(db_err("remove"))?;
            Ok(n > 0)
        })
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>, StoreError> {
        let end = prefix_end(prefix);
        let rows: Vec<(String, String)> = self.db.with_conn(|conn| {
            let mut stmt = match end {
                Some(_) => conn.prepare(
                    "SELECT key, value FROM kv WHERE key >= ?1 AND key < ?2 ORDER BY key",
                ),
                None => conn.prepare("SELECT key, value FROM kv WHERE key >= ?1 ORDER BY key"),
            }
            .map_err(db_err("scan"))?;
            let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<(String, String)> {
                Ok((row.get(0)?, row.get(1)?))
            };
            let rows = match &end {
                Some(end) => stmt.query_map(params![prefix, end], map_row),
                None => stmt.query_map(params![prefix], map_row),
            }
            .map_err(db_err("scan"))?;
            rows.collect::<Result<_, _>>().map_err(db_err("scan"))
        })?;
        rows.into_iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, raw)| {
                let value = decode(&k, &raw)?;
                Ok((k, value))
            })
            .collect()
    }

    async fn batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
        let mut encoded = Vec::with_capacity(ops.len());
        for op in ops {
            match op {
                BatchOp::Put(key, _) if key.is_empty() => {
                    return Err(StoreError::InvalidKey(key));
                }
                BatchOp::Put(key, value) => {
                    encoded.push((key, Some(serde_json::to_string(&value)?)));
                }
                BatchOp::Remove(key) => encoded.push((key, None)),
            }
        }
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            let tx = conn.transaction().map_err(db_err("begin"))?;
            for (key, raw) in &encoded {
                let applied = match raw {
                    Some(raw) => tx.execute(
                        "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
                         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                        params![key, raw, now],
                    ),
                    None => tx.execute("DELETE FROM kv WHERE key = ?1", [key]),
                };
                applied.map_err(db_err("batch"))?;
            }
            tx.commit().map_err(db_err("commit"))
        })
    }

    async fn next_id(&self, counter: &str) -> Result<u64, StoreError> {
        self.db.with_conn(|conn| {
            let value: i64 = conn
                .query_row(
                    "INSERT INTO counters (name, value) VALUES (?1, 1)
                     ON CONFLICT(name) DO UPDATE SET value = value + 1
                     RETURNING value",
                    [counter],
                    |row| row.get(0),
                )
                .map_err(db_err("next_id"))?;
            u64::try_from(value).map_err(|_| StoreError::Backend(format!("negative counter {counter}")))
        })
    }
}
