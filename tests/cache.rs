mod common;

use common::MASTER;
use gist_shard_store::{
    backend::{FileMap, MemoryBackend},
    kv::MemoryKvStore,
    models::{
        MASTER_INDEX_FILE, SHARD_MANIFEST_FILE, ShardPolicy, create_empty_master_index, create_shard_info,
        create_shard_manifest,
    },
    services::shard_cache::ShardCache,
};
use std::{sync::Arc, time::Duration};

fn backend_with_index() -> Arc<MemoryBackend> {
    let backend = Arc::new(MemoryBackend::new());
    let index = serde_json::to_string(&create_empty_master_index("test")).unwrap();
    backend.insert_container(MASTER, "master", FileMap::from([(MASTER_INDEX_FILE.to_string(), index)]));
    let manifest = serde_json::to_string(&create_shard_manifest("media-1", MASTER)).unwrap();
    backend.insert_container("shard-1", "shard", FileMap::from([(SHARD_MANIFEST_FILE.to_string(), manifest)]));
    backend
}

#[tokio::test]
async fn master_index_is_fetched_once_within_ttl() {
    let backend = backend_with_index();
    let cache = ShardCache::new(backend.clone(), Arc::new(MemoryKvStore::new()), &ShardPolicy::default());

    let before = backend.read_count();
    assert!(cache.get_master_index(MASTER, false).await.is_some());
    assert!(cache.get_master_index(MASTER, false).await.is_some());
    assert_eq!(backend.read_count() - before, 1);
    assert!(cache.is_master_index_cached().await);

    cache.invalidate_master_index().await;
    assert!(!cache.is_master_index_cached().await);
    assert!(cache.get_master_index(MASTER, false).await.is_some());
    assert_eq!(backend.read_count() - before, 2);
}

#[tokio::test]
async fn durable_tier_serves_a_fresh_process() {
    let backend = backend_with_index();
    let kv = Arc::new(MemoryKvStore::new());
    let policy = ShardPolicy::default();

    let first = ShardCache::new(backend.clone(), kv.clone(), &policy);
    assert!(first.get_master_index(MASTER, false).await.is_some());
    first.flush().await;

    let second = ShardCache::new(backend.clone(), kv.clone(), &policy);
    let before = backend.read_count();
    assert!(second.get_master_index(MASTER, false).await.is_some());
    assert_eq!(backend.read_count(), before);

    // A forced refresh always goes to the backend.
    assert!(second.get_master_index(MASTER, true).await.is_some());
    assert_eq!(backend.read_count(), before + 1);
}

#[tokio::test]
async fn expired_entries_are_refetched_and_swept() {
    let backend = backend_with_index();
    let policy = ShardPolicy {
        cache_ttl: Duration::ZERO,
        ..ShardPolicy::default()
    };
    let cache = ShardCache::new(backend.clone(), Arc::new(MemoryKvStore::new()), &policy);
    let shard = create_shard_info("shard-1", "media-1", 1);

    let before = backend.read_count();
    assert!(cache.get_shard_manifest(&shard, false).await.is_some());
    assert!(cache.get_shard_manifest(&shard, false).await.is_some());
    assert_eq!(backend.read_count() - before, 2);
    assert!(!cache.is_cached("media-1").await);

    assert!(cache.cleanup_expired_cache().await >= 1);
    assert_eq!(cache.get_cache_stats().await.manifest_entries, 0);
}

#[tokio::test]
async fn missing_or_broken_files_are_cache_misses() {
    let backend = backend_with_index();
    backend.insert_container(
        "shard-2",
        "broken",
        FileMap::from([(SHARD_MANIFEST_FILE.to_string(), "{not json".to_string())]),
    );
    let cache = ShardCache::new(backend.clone(), Arc::new(MemoryKvStore::new()), &ShardPolicy::default());

    let broken = create_shard_info("shard-2", "media-2", 2);
    assert!(cache.get_shard_manifest(&broken, false).await.is_none());
    let gone = create_shard_info("shard-9", "media-9", 9);
    assert!(cache.get_shard_manifest(&gone, false).await.is_none());

    backend.fail_container(MASTER);
    assert!(cache.get_master_index(MASTER, false).await.is_none());
}

#[tokio::test]
async fn preload_warms_every_reachable_manifest() {
    let backend = backend_with_index();
    let cache = ShardCache::new(backend.clone(), Arc::new(MemoryKvStore::new()), &ShardPolicy::default());
    let shards = vec![
        create_shard_info("shard-1", "media-1", 1),
        create_shard_info("missing", "media-2", 2),
    ];

    assert_eq!(cache.preload_all_shard_manifests(&shards).await, 1);
    assert!(cache.is_cached("media-1").await);

    cache.clear_all().await;
    assert!(!cache.is_cached("media-1").await);
}

#[tokio::test]
async fn failing_durable_store_is_counted_not_fatal() {
    let backend = backend_with_index();
    let kv = Arc::new(MemoryKvStore::new());
    kv.set_failing(true);
    let cache = ShardCache::new(backend.clone(), kv.clone(), &ShardPolicy::default());

    assert!(cache.get_master_index(MASTER, false).await.is_some());
    cache.flush().await;
    assert!(cache.persist_stats().failed >= 1);
    assert!(cache.is_master_index_cached().await);
}

#[tokio::test]
async fn extending_ttl_keeps_entries_alive() {
    let backend = backend_with_index();
    let policy = ShardPolicy {
        cache_ttl: Duration::from_millis(200),
        ..ShardPolicy::default()
    };
    let cache = ShardCache::new(backend.clone(), Arc::new(MemoryKvStore::new()), &policy);
    let shard = create_shard_info("shard-1", "media-1", 1);
    assert!(cache.get_shard_manifest(&shard, false).await.is_some());

    tokio::time::sleep(Duration::from_millis(150)).await;
    cache.extend_cache_ttl(Some("media-1")).await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(cache.is_cached("media-1").await);
}

#[tokio::test]
async fn invalidated_manifest_is_fetched_again() {
    let backend = backend_with_index();
    let cache = ShardCache::new(backend.clone(), Arc::new(MemoryKvStore::new()), &ShardPolicy::default());
    let shard = create_shard_info("shard-1", "media-1", 1);

    assert!(cache.get_shard_manifest(&shard, false).await.is_some());
    assert!(cache.is_cached("media-1").await);
    cache.invalidate_shard_manifest("media-1").await;
    assert!(!cache.is_cached("media-1").await);

    let before = backend.read_count();
    assert!(cache.get_shard_manifest(&shard, false).await.is_some());
    assert_eq!(backend.read_count(), before + 1);
}
