//! src/services/sharded_store.rs
//!
//! ShardedMediaStore: the one API callers use. A persisted feature flag
//! selects between the sharded stack and the legacy single-container store.
//! Every operation checks `sharding enabled && master bound` first; when that
//! fails it falls back to the legacy store if a master container is bound,
//! and otherwise returns an empty result instead of an error.

use crate::{
    backend::ContainerBackend,
    errors::ShardResult,
    kv::KeyValueStore,
    models::{MasterIndex, ShardInfo, ShardPolicy, policy::MIGRATION_THRESHOLD},
    services::{
        feature_flags::FeatureFlags,
        legacy_store::LegacyMediaStore,
        shard_cache::{CacheStats, ShardCache},
        shard_manager::{ShardManager, ShardStats},
        shard_migration::{
            MigrationAnalysis, MigrationProgressFn, MigrationResult, MigrationState, ReconcileReport,
            RollbackResult, ShardMigrationService, VerificationReport,
        },
        shard_router::ShardRouter,
        shard_sync::{MediaUpload, ProgressFn, ShardDownload, ShardSyncResult, ShardSyncService},
    },
};
use std::{collections::BTreeSet, sync::Arc, time::Duration};
use tracing::{info, warn};
use uuid::Uuid;

/// Construction options for [`ShardedMediaStore`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub policy: ShardPolicy,
    pub app_version: String,

    /// Recorded in manifests as `syncedFromDevice`.
    pub device_id: String,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            policy: ShardPolicy::default(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            device_id: Uuid::new_v4().to_string(),
        }
    }
}

/// Which implementation serves a call.
enum Mode {
    Sharded,
    Legacy(String),
    Disabled,
}

pub struct ShardedMediaStore {
    backend: Arc<dyn ContainerBackend>,
    kv: Arc<dyn KeyValueStore>,
    app_version: String,
    flags: Arc<FeatureFlags>,
    cache: Arc<ShardCache>,
    router: Arc<ShardRouter>,
    sync: Arc<ShardSyncService>,
    legacy: Arc<LegacyMediaStore>,
    manager: ShardManager,
    migration: ShardMigrationService,
}

impl ShardedMediaStore {
    pub fn new(backend: Arc<dyn ContainerBackend>, kv: Arc<dyn KeyValueStore>, options: StoreOptions) -> Self {
        let StoreOptions {
            policy,
            app_version,
            device_id,
        } = options;

        let flags = Arc::new(FeatureFlags::new(kv.clone()));
        let cache = Arc::new(ShardCache::new(backend.clone(), kv.clone(), &policy));
        let router = Arc::new(ShardRouter::new(backend.clone(), cache.clone(), kv.clone(), policy.clone()));
        let sync = Arc::new(ShardSyncService::new(
            router.clone(),
            cache.clone(),
            backend.clone(),
            device_id.clone(),
        ));
        let legacy = Arc::new(LegacyMediaStore::new(backend.clone(), policy));
        let manager = ShardManager::new(router.clone());
        let migration = ShardMigrationService::new(
            router.clone(),
            sync.clone(),
            backend.clone(),
            legacy.clone(),
            flags.clone(),
            app_version.clone(),
            device_id,
        );

        Self {
            backend,
            kv,
            app_version,
            flags,
            cache,
            router,
            sync,
            legacy,
            manager,
            migration,
        }
    }

    /// Load the persisted flag and master binding.
    pub async fn initialize(&self) {
        let enabled = self.flags.load().await;
        self.router.initialize().await;
        info!(
            "media store initialized (sharding {}, master {:?})",
            if enabled { "enabled" } else { "disabled" },
            self.router.master_gist_id().await
        );
    }

    /// Bind a master container without enabling sharding (legacy mode).
    pub async fn bind_master_container(&self, master_gist_id: &str) -> ShardResult<()> {
        if self.router.master_gist_id().await.as_deref() == Some(master_gist_id) {
            return Ok(());
        }
        self.router.set_master_gist_id(master_gist_id).await
    }

    /// First-run setup: bind, load or create the index, persist, enable.
    pub async fn setup_shard_system(&self, master_gist_id: &str) -> ShardResult<MasterIndex> {
        self.router.set_master_gist_id(master_gist_id).await?;
        let index = match self.router.load_master_index_from_remote().await? {
            Some(index) => {
                info!("found existing master index with {} shards", index.shards.len());
                index
            }
            None => self.router.initialize_master_index(&self.app_version).await?,
        };
        self.router.persist_master_index().await?;
        self.flags.set_sharding_enabled(true).await?;
        info!("shard system set up on master container {}", master_gist_id);
        Ok(index)
    }

    pub async fn is_sharding_active(&self) -> bool {
        self.flags.sharding_enabled() && self.router.is_configured().await
    }

    async fn mode(&self) -> Mode {
        if self.is_sharding_active().await {
            return Mode::Sharded;
        }
        match self.router.master_gist_id().await {
            Some(master_gist_id) => Mode::Legacy(master_gist_id),
            None => Mode::Disabled,
        }
    }

    pub async fn upload_media(&self, items: Vec<MediaUpload>, on_progress: Option<ProgressFn<'_>>) -> ShardSyncResult {
        match self.mode().await {
            Mode::Sharded => self.sync.upload_media(items, on_progress).await,
            Mode::Legacy(master) => self.legacy.upload_media(&master, items, on_progress).await,
            Mode::Disabled => ShardSyncResult::empty(),
        }
    }

    pub async fn download_media(&self, urls: &[String], on_progress: Option<ProgressFn<'_>>) -> ShardDownload {
        match self.mode().await {
            Mode::Sharded => self.sync.download_media(urls, on_progress).await,
            Mode::Legacy(master) => self.legacy.download_media(&master, urls, on_progress).await,
            Mode::Disabled => ShardDownload {
                result: ShardSyncResult::empty(),
                media: Vec::new(),
            },
        }
    }

    pub async fn get_synced_urls(&self) -> BTreeSet<String> {
        let urls = match self.mode().await {
            Mode::Sharded => self.sync.get_synced_urls().await,
            Mode::Legacy(master) => self.legacy.get_synced_urls(&master).await,
            Mode::Disabled => Ok(BTreeSet::new()),
        };
        urls.unwrap_or_else(|err| {
            warn!("failed to list synced urls: {}", err);
            BTreeSet::new()
        })
    }

    pub async fn soft_delete_media(&self, urls: &[String], deleted_by: &str) -> ShardSyncResult {
        match self.mode().await {
            Mode::Sharded => self.sync.soft_delete_media(urls, deleted_by).await,
            Mode::Legacy(master) => self.legacy.soft_delete_media(&master, urls, deleted_by).await,
            Mode::Disabled => ShardSyncResult::empty(),
        }
    }

    pub async fn restore_media(&self, url: &str) -> bool {
        match self.mode().await {
            Mode::Sharded => self.sync.restore_media(url).await,
            Mode::Legacy(master) => self.legacy.restore_media(&master, url).await,
            Mode::Disabled => false,
        }
    }

    pub async fn cleanup_expired_tombstones(&self) -> usize {
        match self.mode().await {
            Mode::Sharded => self.sync.cleanup_expired_tombstones().await,
            Mode::Legacy(master) => self.legacy.cleanup_expired(&master).await,
            Mode::Disabled => 0,
        }
    }

    pub async fn get_shard_stats(&self) -> ShardStats {
        if !self.is_sharding_active().await {
            return ShardStats::default();
        }
        self.manager.get_shard_stats().await
    }

    pub async fn archive_shard(&self, alias: &str) -> ShardResult<ShardInfo> {
        self.manager.archive_shard(alias).await
    }

    /// True while on the legacy store and its live media count reached
    /// `threshold`.
    pub async fn should_migrate_to_sharding(&self, threshold: Option<usize>) -> bool {
        let Mode::Legacy(master) = self.mode().await else {
            return false;
        };
        match self.legacy.load_manifest(&master).await {
            Ok(manifest) => manifest.live_entries().count() >= threshold.unwrap_or(MIGRATION_THRESHOLD),
            Err(err) => {
                warn!("cannot evaluate migration need: {}", err);
                false
            }
        }
    }

    pub async fn analyze_migration(&self, master_gist_id: &str) -> ShardResult<MigrationAnalysis> {
        self.migration.analyze_migration(master_gist_id).await
    }

    pub async fn migrate(&self, master_gist_id: &str, on_progress: Option<MigrationProgressFn<'_>>) -> MigrationResult {
        self.migration.migrate(master_gist_id, on_progress).await
    }

    pub async fn rollback(&self, master_gist_id: &str) -> RollbackResult {
        self.migration.rollback(master_gist_id).await
    }

    pub async fn verify_migration(&self, master_gist_id: &str) -> VerificationReport {
        self.migration.verify_migration(master_gist_id).await
    }

    pub async fn reconcile_migration(&self, master_gist_id: &str) -> ReconcileReport {
        self.migration.reconcile_migration(master_gist_id).await
    }

    pub async fn migration_state(&self) -> MigrationState {
        self.migration.get_state().await
    }

    pub async fn start_cache_warmer(&self, interval: Duration) {
        self.manager.start_cache_warmer(interval).await;
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.get_cache_stats().await
    }

    pub async fn master_gist_id(&self) -> Option<String> {
        self.router.master_gist_id().await
    }

    pub fn backend(&self) -> &Arc<dyn ContainerBackend> {
        &self.backend
    }

    pub fn kv(&self) -> &Arc<dyn KeyValueStore> {
        &self.kv
    }

    pub fn router(&self) -> &Arc<ShardRouter> {
        &self.router
    }

    /// Stop background work and drain pending cache writes. Idempotent.
    pub async fn destroy(&self) {
        self.manager.destroy().await;
        self.cache.flush().await;
    }
}
