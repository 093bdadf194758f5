use super::{KeyValueStore, KvError, KvResult};
use async_trait::async_trait;
use std::{
    collections::BTreeMap,
    sync::{
        Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

/// Process-local store. Can be switched into a failing mode to exercise the
/// best-effort persistence paths.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: Mutex<BTreeMap<String, String>>,
    failing: AtomicBool,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with `KvError::Unavailable`.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .map(|entries| entries.len())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn guard(&self) -> KvResult<std::sync::MutexGuard<'_, BTreeMap<String, String>>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(KvError::Unavailable("memory store set to fail".into()));
        }
        self.entries
            .lock()
            .map_err(|_| KvError::Unavailable("memory store lock poisoned".into()))
    }
}

#[async_trait]
impl KeyValueStore for MemoryKvStore {
    async fn get_raw(&self, key: &str) -> KvResult<Option<String>> {
        Ok(self.guard()?.get(key).cloned())
    }

    async fn set_raw(&self, key: &str, value: String) -> KvResult<()> {
        self.guard()?.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> KvResult<()> {
        self.guard()?.remove(key);
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> KvResult<Vec<String>> {
        Ok(self
            .guard()?
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }
}
