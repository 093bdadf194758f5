//! Durable local key-value store.
//!
//! Values are JSON text. The cache persists entries here and the feature
//! flags and router binding live here too.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

pub use memory::MemoryKvStore;
pub use sqlite::SqliteKvStore;

#[derive(Debug, Error)]
pub enum KvError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("key-value store unavailable: {0}")]
    Unavailable(String),
}

pub type KvResult<T> = Result<T, KvError>;

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get_raw(&self, key: &str) -> KvResult<Option<String>>;

    async fn set_raw(&self, key: &str, value: String) -> KvResult<()>;

    async fn delete(&self, key: &str) -> KvResult<()>;

    /// Every stored key starting with `prefix`.
    async fn keys_with_prefix(&self, prefix: &str) -> KvResult<Vec<String>>;
}

/// Typed read; a value that no longer parses is reported as an error.
pub async fn get_json<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> KvResult<Option<T>> {
    match store.get_raw(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

pub async fn set_json<T: Serialize + ?Sized>(store: &dyn KeyValueStore, key: &str, value: &T) -> KvResult<()> {
    let raw = serde_json::to_string(value)?;
    store.set_raw(key, raw).await
}
