pub mod database;
pub mod kv;
pub mod schema;
pub mod sessions;

pub use database::Database;
pub use kv::SqliteKeyStore;
pub use sessions::SessionStore;
pub use tether_core::store::{BatchOp, KeyStore, MemoryKeyStore, StoreError};
