//! src/services/shard_cache.rs
//!
//! ShardCache: two-tier read-through cache (process memory, then the durable
//! key-value store) in front of the remote backend, for the master index and
//! per-shard manifests. The cache never fails: backend or parse errors are
//! logged and surface as `None`, and durable writes go through the
//! best-effort [`PersistQueue`].

use crate::{
    backend::ContainerBackend,
    kv::{KeyValueStore, get_json},
    models::{
        MASTER_INDEX_FILE, MasterIndex, SHARD_MANIFEST_FILE, ShardInfo, ShardManifest, ShardPolicy,
        now_millis,
    },
    services::persist_queue::{DEFAULT_QUEUE_CAPACITY, PersistQueue, PersistStats},
};
use futures::{FutureExt, StreamExt, stream};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;
use tracing::{debug, warn};

const KEY_PREFIX: &str = "shard-cache:";
const MANIFEST_KEY_PREFIX: &str = "shard-cache:manifest:";
const MASTER_INDEX_KEY: &str = "shard-cache:master-index";

/// A cached value with its expiry, as stored in both tiers.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry<T> {
    pub data: T,
    pub cached_at: i64,
    pub expires_at: i64,
}

impl<T> CacheEntry<T> {
    fn is_fresh(&self, now: i64) -> bool {
        self.expires_at > now
    }
}

/// Introspection snapshot returned by [`ShardCache::get_cache_stats`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub manifest_entries: usize,
    pub fresh_manifest_entries: usize,
    pub master_index_cached: bool,
    pub persistence: PersistStats,
}

pub struct ShardCache {
    backend: Arc<dyn ContainerBackend>,
    kv: Arc<dyn KeyValueStore>,
    persist: PersistQueue,
    ttl_millis: i64,
    concurrency: usize,
    manifests: RwLock<HashMap<String, CacheEntry<ShardManifest>>>,
    master: RwLock<Option<CacheEntry<MasterIndex>>>,
}

fn manifest_key(shard_id: &str) -> String {
    format!("{}{}", MANIFEST_KEY_PREFIX, shard_id)
}

impl ShardCache {
    pub fn new(backend: Arc<dyn ContainerBackend>, kv: Arc<dyn KeyValueStore>, policy: &ShardPolicy) -> Self {
        Self {
            persist: PersistQueue::spawn(kv.clone(), DEFAULT_QUEUE_CAPACITY),
            backend,
            kv,
            ttl_millis: policy.cache_ttl_millis(),
            concurrency: policy.effective_concurrency(),
            manifests: RwLock::new(HashMap::new()),
            master: RwLock::new(None),
        }
    }

    fn entry<T>(&self, data: T) -> CacheEntry<T> {
        let now = now_millis();
        CacheEntry {
            data,
            cached_at: now,
            expires_at: now + self.ttl_millis,
        }
    }

    fn persist_entry<T: Serialize>(&self, key: String, entry: &CacheEntry<T>) {
        match serde_json::to_string(entry) {
            Ok(raw) => self.persist.enqueue_set(key, raw),
            Err(err) => warn!("failed to serialize cache entry `{}`: {}", key, err),
        }
    }

    /// Durable-tier lookup; unreadable or expired entries count as misses.
    async fn durable_lookup<T: DeserializeOwned>(&self, key: &str) -> Option<CacheEntry<T>> {
        match get_json::<CacheEntry<T>>(self.kv.as_ref(), key).await {
            Ok(Some(entry)) if entry.is_fresh(now_millis()) => Some(entry),
            Ok(_) => None,
            Err(err) => {
                warn!("durable cache read of `{}` failed: {}", key, err);
                None
            }
        }
    }

    /// Fetch and parse one JSON file from a container.
    async fn fetch_json<T: DeserializeOwned>(&self, filename: &str, container_id: &str) -> Option<T> {
        let content = match self.backend.get_file_content(filename, container_id).await {
            Ok(Some(content)) => content,
            Ok(None) => {
                debug!("{} missing from container {}", filename, container_id);
                return None;
            }
            Err(err) => {
                warn!("failed to fetch {} from container {}: {}", filename, container_id, err);
                return None;
            }
        };
        match serde_json::from_str(&content) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!("failed to parse {} from container {}: {}", filename, container_id, err);
                None
            }
        }
    }

    /// Manifest of `shard`, read through memory, durable store, then backend.
    ///
    /// `None` means "unavailable", not "empty".
    pub async fn get_shard_manifest(&self, shard: &ShardInfo, force_refresh: bool) -> Option<ShardManifest> {
        let shard_id = shard.alias.as_str();
        if !force_refresh {
            if let Some(entry) = self.manifests.read().await.get(shard_id) {
                if entry.is_fresh(now_millis()) {
                    debug!("manifest cache hit (memory) for {}", shard_id);
                    return Some(entry.data.clone());
                }
            }

            if let Some(entry) = self.durable_lookup::<ShardManifest>(&manifest_key(shard_id)).await {
                debug!("manifest cache hit (durable) for {}", shard_id);
                let data = entry.data.clone();
                self.manifests.write().await.insert(shard_id.to_string(), entry);
                return Some(data);
            }
        }

        debug!("manifest cache miss for {}, fetching from backend", shard_id);
        let manifest: ShardManifest = self.fetch_json(SHARD_MANIFEST_FILE, &shard.gist_id).await?;
        self.set_shard_manifest(shard_id, manifest.clone()).await;
        Some(manifest)
    }

    /// Write-through after a local mutation.
    pub async fn set_shard_manifest(&self, shard_id: &str, manifest: ShardManifest) {
        let entry = self.entry(manifest);
        self.persist_entry(manifest_key(shard_id), &entry);
        self.manifests.write().await.insert(shard_id.to_string(), entry);
    }

    pub async fn invalidate_shard_manifest(&self, shard_id: &str) {
        self.manifests.write().await.remove(shard_id);
        self.persist.enqueue_delete(manifest_key(shard_id));
        self.persist.flush().await;
    }

    /// Master index, same three-tier strategy as manifests.
    pub async fn get_master_index(&self, master_gist_id: &str, force_refresh: bool) -> Option<MasterIndex> {
        if !force_refresh {
            if let Some(entry) = self.master.read().await.as_ref() {
                if entry.is_fresh(now_millis()) {
                    debug!("master index cache hit (memory)");
                    return Some(entry.data.clone());
                }
            }

            if let Some(entry) = self.durable_lookup::<MasterIndex>(MASTER_INDEX_KEY).await {
                debug!("master index cache hit (durable)");
                let data = entry.data.clone();
                *self.master.write().await = Some(entry);
                return Some(data);
            }
        }

        debug!("master index cache miss, fetching from {}", master_gist_id);
        let index: MasterIndex = self.fetch_json(MASTER_INDEX_FILE, master_gist_id).await?;
        self.set_master_index(index.clone()).await;
        Some(index)
    }

    pub async fn set_master_index(&self, index: MasterIndex) {
        let entry = self.entry(index);
        self.persist_entry(MASTER_INDEX_KEY.to_string(), &entry);
        *self.master.write().await = Some(entry);
    }

    pub async fn invalidate_master_index(&self) {
        *self.master.write().await = None;
        self.persist.enqueue_delete(MASTER_INDEX_KEY);
        self.persist.flush().await;
    }

    /// Warm manifests for `shards`, `concurrency` requests at a time.
    /// Returns how many manifests are now available.
    pub async fn preload_all_shard_manifests(&self, shards: &[ShardInfo]) -> usize {
        let mut loaded = 0;
        for batch in shards.chunks(self.concurrency) {
            let results: Vec<bool> = stream::iter(batch)
                .map(|shard| async move { self.get_shard_manifest(shard, false).await.is_some() })
                .buffer_unordered(self.concurrency)
                .collect::<Vec<_>>()
                .boxed()
                .await;
            loaded += results.into_iter().filter(|ok| *ok).count();
        }
        debug!("preloaded {}/{} shard manifests", loaded, shards.len());
        loaded
    }

    /// Remove expired entries from both tiers. Returns how many were removed.
    pub async fn cleanup_expired_cache(&self) -> usize {
        let now = now_millis();
        let mut removed = 0;

        {
            let mut manifests = self.manifests.write().await;
            let before = manifests.len();
            manifests.retain(|_, entry| entry.is_fresh(now));
            removed += before - manifests.len();
        }
        {
            let mut master = self.master.write().await;
            if master.as_ref().is_some_and(|entry| !entry.is_fresh(now)) {
                *master = None;
                removed += 1;
            }
        }

        // Durable entries queued before the sweep must be visible to it.
        self.persist.flush().await;
        match self.kv.keys_with_prefix(KEY_PREFIX).await {
            Ok(keys) => {
                for key in keys {
                    match get_json::<CacheEntry<serde_json::Value>>(self.kv.as_ref(), &key).await {
                        Ok(Some(entry)) if entry.is_fresh(now) => {}
                        Ok(Some(_)) | Err(_) => {
                            self.persist.enqueue_delete(key);
                            removed += 1;
                        }
                        Ok(None) => {}
                    }
                }
            }
            Err(err) => warn!("durable cache sweep failed: {}", err),
        }
        self.persist.flush().await;

        if removed > 0 {
            debug!("removed {} expired cache entries", removed);
        }
        removed
    }

    /// Push expiry forward by one TTL, for one manifest or for everything.
    pub async fn extend_cache_ttl(&self, shard_id: Option<&str>) {
        match shard_id {
            Some(shard_id) => {
                let mut manifests = self.manifests.write().await;
                if let Some(entry) = manifests.get_mut(shard_id) {
                    entry.expires_at += self.ttl_millis;
                    self.persist_entry(manifest_key(shard_id), entry);
                }
            }
            None => {
                let mut manifests = self.manifests.write().await;
                for (shard_id, entry) in manifests.iter_mut() {
                    entry.expires_at += self.ttl_millis;
                    self.persist_entry(manifest_key(shard_id), entry);
                }
                let mut master = self.master.write().await;
                if let Some(entry) = master.as_mut() {
                    entry.expires_at += self.ttl_millis;
                    self.persist_entry(MASTER_INDEX_KEY.to_string(), entry);
                }
            }
        }
    }

    /// Drop every cached entry in both tiers.
    pub async fn clear_all(&self) {
        self.manifests.write().await.clear();
        *self.master.write().await = None;
        self.persist.flush().await;
        match self.kv.keys_with_prefix(KEY_PREFIX).await {
            Ok(keys) => {
                for key in keys {
                    self.persist.enqueue_delete(key);
                }
            }
            Err(err) => warn!("failed to list durable cache keys: {}", err),
        }
        self.persist.flush().await;
    }

    pub async fn get_cache_stats(&self) -> CacheStats {
        let now = now_millis();
        let manifests = self.manifests.read().await;
        CacheStats {
            manifest_entries: manifests.len(),
            fresh_manifest_entries: manifests.values().filter(|entry| entry.is_fresh(now)).count(),
            master_index_cached: self.is_master_index_cached().await,
            persistence: self.persist.stats(),
        }
    }

    /// True when a fresh manifest for `shard_id` is held in memory.
    pub async fn is_cached(&self, shard_id: &str) -> bool {
        self.manifests
            .read()
            .await
            .get(shard_id)
            .is_some_and(|entry| entry.is_fresh(now_millis()))
    }

    pub async fn is_master_index_cached(&self) -> bool {
        self.master
            .read()
            .await
            .as_ref()
            .is_some_and(|entry| entry.is_fresh(now_millis()))
    }

    /// Wait for queued durable writes; used before shutdown and by tests.
    pub async fn flush(&self) {
        self.persist.flush().await;
    }

    pub fn persist_stats(&self) -> PersistStats {
        self.persist.stats()
    }
}
