//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use bytes::Bytes;
use gist_shard_store::{
    ShardedMediaStore, StoreOptions,
    backend::{FileMap, MemoryBackend},
    kv::MemoryKvStore,
    models::{MasterIndex, MediaType, ShardInfo, ShardPolicy},
    services::{legacy_store::LegacyMediaStore, shard_sync::MediaUpload},
};
use std::sync::Arc;

pub const MASTER: &str = "master-gist";

pub struct Fixture {
    pub backend: Arc<MemoryBackend>,
    pub kv: Arc<MemoryKvStore>,
    pub policy: ShardPolicy,
    pub store: Arc<ShardedMediaStore>,
}

impl Fixture {
    pub fn new(policy: ShardPolicy) -> Self {
        let backend = Arc::new(MemoryBackend::new());
        backend.insert_container(MASTER, "legacy media store", FileMap::new());
        let kv = Arc::new(MemoryKvStore::new());
        let store = build_store(&backend, &kv, &policy);
        Self {
            backend,
            kv,
            policy,
            store,
        }
    }

    /// A second store instance over the same backend and key-value store,
    /// as after a process restart.
    pub fn reopen(&self) -> Arc<ShardedMediaStore> {
        build_store(&self.backend, &self.kv, &self.policy)
    }

    /// Fill the master container through the legacy store.
    pub async fn seed_legacy(&self, count: usize) -> Vec<String> {
        let legacy = LegacyMediaStore::new(self.backend.clone(), self.policy.clone());
        let items: Vec<MediaUpload> = (0..count)
            .map(|n| upload(&format!("https://cdn.example/legacy/{:04}.png", n), format!("legacy-{}", n).as_bytes()))
            .collect();
        let urls = items.iter().map(|item| item.url.clone()).collect();
        let result = legacy.upload_media(MASTER, items, None).await;
        assert!(result.success, "seeding failed: {:?}", result.details);
        urls
    }

    pub async fn index(&self) -> MasterIndex {
        self.store
            .router()
            .master_index()
            .await
            .expect("index readable")
            .expect("index present")
    }

    pub async fn shard(&self, alias: &str) -> ShardInfo {
        self.index()
            .await
            .shards
            .get(alias)
            .cloned()
            .unwrap_or_else(|| panic!("shard {} not registered", alias))
    }
}

fn build_store(backend: &Arc<MemoryBackend>, kv: &Arc<MemoryKvStore>, policy: &ShardPolicy) -> Arc<ShardedMediaStore> {
    Arc::new(ShardedMediaStore::new(
        backend.clone(),
        kv.clone(),
        StoreOptions {
            policy: policy.clone(),
            app_version: "test".to_string(),
            device_id: "device-test".to_string(),
        },
    ))
}

pub fn policy_with_file_limit(file_limit: u32) -> ShardPolicy {
    ShardPolicy {
        file_limit,
        ..ShardPolicy::default()
    }
}

pub fn upload(url: &str, body: &[u8]) -> MediaUpload {
    MediaUpload {
        url: url.to_string(),
        media_type: MediaType::Image,
        mime_type: "image/png".to_string(),
        content: Bytes::copy_from_slice(body),
    }
}

pub fn numbered_uploads(prefix: &str, count: usize, body: &[u8]) -> Vec<MediaUpload> {
    (0..count)
        .map(|n| upload(&format!("https://cdn.example/{}/{}.png", prefix, n), body))
        .collect()
}

/// Sharded store on [`MASTER`], ready for uploads.
pub async fn sharded_fixture(policy: ShardPolicy) -> Fixture {
    let fixture = Fixture::new(policy);
    fixture
        .store
        .setup_shard_system(MASTER)
        .await
        .expect("setup succeeds");
    fixture
}
