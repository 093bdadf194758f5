//! src/services/shard_router.rs
//!
//! ShardRouter: single authority for "which shard does file X live in / go
//! into" and owner of the master index lifecycle.
//!
//! The router keeps the working copy of the master index behind a tokio
//! mutex. Every read-modify-write (allocation, placement, tombstoning,
//! restore) runs under that lock, so two allocations in one process can never
//! both pick the last free slot of a shard. Mutations are written through to
//! the cache; writing the index back to the master container is an explicit
//! [`ShardRouter::persist_master_index`] call.

use crate::{
    backend::{ContainerBackend, FileMap},
    errors::{ShardError, ShardResult},
    kv::{KeyValueStore, get_json, set_json},
    models::{
        AllocationTarget, FileIndexEntry, MASTER_INDEX_FILE, MasterIndex, MediaTombstone, MediaType,
        SHARD_MANIFEST_FILE, ShardInfo, ShardPolicy, ShardStatus, create_empty_master_index,
        create_media_tombstone, create_shard_info, create_shard_manifest, generate_shard_alias,
        now_millis, plan_allocation, shard_has_capacity, tombstone::is_tombstone_expired_at,
        update_master_index_stats,
    },
    services::shard_cache::ShardCache,
};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info, warn};

const MASTER_GIST_KEY: &str = "shard-router:master-gist-id";

/// A file to be placed into a shard.
#[derive(Debug, Clone)]
pub struct PlacementRequest {
    pub url: String,
    pub filename: String,
    pub size: u64,
    pub media_type: MediaType,
    pub checksum: Option<String>,
}

/// Result of [`ShardRouter::place_file`]; keeps enough state to undo it.
#[derive(Debug, Clone)]
pub struct Placement {
    pub shard: ShardInfo,
    pub entry: FileIndexEntry,

    /// Entry replaced by a re-sync, if the URL was already tracked.
    pub previous: Option<FileIndexEntry>,

    /// Tombstones on the target shard superseded by this upload.
    pub consumed_tombstones: Vec<MediaTombstone>,

    /// Tombstones on other shards, as they were before this upload expired them.
    pub expired_tombstones: Vec<MediaTombstone>,
}

/// Per-URL outcome of [`ShardRouter::tombstone_files`].
#[derive(Debug, Clone)]
pub enum TombstoneOutcome {
    Deleted(MediaTombstone),
    NotTracked,
}

pub struct ShardRouter {
    backend: Arc<dyn ContainerBackend>,
    cache: Arc<ShardCache>,
    kv: Arc<dyn KeyValueStore>,
    policy: ShardPolicy,
    master_gist_id: RwLock<Option<String>>,
    index: Mutex<Option<MasterIndex>>,
}

impl ShardRouter {
    pub fn new(
        backend: Arc<dyn ContainerBackend>,
        cache: Arc<ShardCache>,
        kv: Arc<dyn KeyValueStore>,
        policy: ShardPolicy,
    ) -> Self {
        Self {
            backend,
            cache,
            kv,
            policy,
            master_gist_id: RwLock::new(None),
            index: Mutex::new(None),
        }
    }

    pub fn policy(&self) -> &ShardPolicy {
        &self.policy
    }

    pub fn cache(&self) -> &Arc<ShardCache> {
        &self.cache
    }

    /// Load the persisted master container binding and prime the cache.
    pub async fn initialize(&self) {
        let stored = match get_json::<String>(self.kv.as_ref(), MASTER_GIST_KEY).await {
            Ok(stored) => stored,
            Err(err) => {
                warn!("failed to read master container binding: {}", err);
                None
            }
        };
        let Some(master_gist_id) = stored else {
            debug!("shard router has no master container binding yet");
            return;
        };

        *self.master_gist_id.write().await = Some(master_gist_id.clone());
        if let Some(index) = self.cache.get_master_index(&master_gist_id, false).await {
            info!(
                "shard router initialized: {} shards, {} files",
                index.shards.len(),
                index.file_index.len()
            );
            *self.index.lock().await = Some(index);
        }
    }

    /// Bind this store to a master container and persist the binding.
    pub async fn set_master_gist_id(&self, master_gist_id: &str) -> ShardResult<()> {
        set_json(self.kv.as_ref(), MASTER_GIST_KEY, master_gist_id).await?;
        let mut current = self.master_gist_id.write().await;
        if current.as_deref() != Some(master_gist_id) {
            *self.index.lock().await = None;
            // Cached entries are not keyed by master; they belong to the old binding.
            self.cache.clear_all().await;
        }
        *current = Some(master_gist_id.to_string());
        info!("shard router bound to master container {}", master_gist_id);
        Ok(())
    }

    pub async fn master_gist_id(&self) -> Option<String> {
        self.master_gist_id.read().await.clone()
    }

    pub async fn is_configured(&self) -> bool {
        self.master_gist_id.read().await.is_some()
    }

    async fn require_master_id(&self) -> ShardResult<String> {
        self.master_gist_id().await.ok_or(ShardError::NotConfigured)
    }

    /// Lock the working copy, loading it through the cache if needed.
    async fn locked_index(&self) -> ShardResult<(MutexGuard<'_, Option<MasterIndex>>, String)> {
        let master_gist_id = self.require_master_id().await?;
        let mut guard = self.index.lock().await;
        if guard.is_none() {
            *guard = self.cache.get_master_index(&master_gist_id, false).await;
        }
        if guard.is_none() {
            return Err(ShardError::MasterIndexUnavailable(master_gist_id));
        }
        Ok((guard, master_gist_id))
    }

    /// Recompute stats and write the working copy through to the cache.
    async fn commit(&self, index: &mut MasterIndex) {
        update_master_index_stats(index);
        self.cache.set_master_index(index.clone()).await;
    }

    /// Cache-bypassing fetch; replaces the working copy when found.
    pub async fn load_master_index_from_remote(&self) -> ShardResult<Option<MasterIndex>> {
        let master_gist_id = self.require_master_id().await?;
        let mut guard = self.index.lock().await;
        let fetched = self.cache.get_master_index(&master_gist_id, true).await;
        if let Some(index) = &fetched {
            *guard = Some(index.clone());
        }
        Ok(fetched)
    }

    /// Start a brand-new, empty index. Callers persist it.
    pub async fn initialize_master_index(&self, app_version: &str) -> ShardResult<MasterIndex> {
        self.require_master_id().await?;
        let mut index = create_empty_master_index(app_version);
        self.commit(&mut index).await;
        *self.index.lock().await = Some(index.clone());
        info!("initialized empty master index (app version {})", app_version);
        Ok(index)
    }

    /// Snapshot of the working copy; `None` when no index exists yet.
    pub async fn master_index(&self) -> ShardResult<Option<MasterIndex>> {
        match self.locked_index().await {
            Ok((guard, _)) => Ok(guard.clone()),
            Err(ShardError::MasterIndexUnavailable(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Registered shards in creation order; empty when nothing is loaded.
    pub async fn shards(&self) -> Vec<ShardInfo> {
        match self.master_index().await {
            Ok(Some(index)) => index.ordered_shards().into_iter().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// Apply a synchronous mutation to the index under the router lock.
    pub async fn update_index<R>(&self, mutate: impl FnOnce(&mut MasterIndex) -> R) -> ShardResult<R> {
        let (mut guard, _) = self.locked_index().await?;
        let index = guard.as_mut().ok_or(ShardError::NotConfigured)?;
        let result = mutate(index);
        self.commit(index).await;
        Ok(result)
    }

    /// Write the working copy to `master-index.json` in the master container.
    pub async fn persist_master_index(&self) -> ShardResult<()> {
        let (guard, master_gist_id) = self.locked_index().await?;
        let index = guard.as_ref().ok_or(ShardError::NotConfigured)?;
        let body = serde_json::to_string_pretty(index)?;
        self.backend
            .update_files(FileMap::from([(MASTER_INDEX_FILE.to_string(), body)]), &master_gist_id)
            .await?;
        debug!("persisted master index ({} files)", index.file_index.len());
        Ok(())
    }

    /// Remove `master-index.json` from the master container and forget the
    /// working copy.
    pub async fn delete_master_index(&self) -> ShardResult<()> {
        let master_gist_id = self.require_master_id().await?;
        self.backend
            .delete_files(&[MASTER_INDEX_FILE.to_string()], &master_gist_id)
            .await?;
        *self.index.lock().await = None;
        self.cache.invalidate_master_index().await;
        Ok(())
    }

    /// Create a new backend container and register it as the next shard.
    async fn open_shard(&self, index: &mut MasterIndex, master_gist_id: &str) -> ShardResult<ShardInfo> {
        let order = index.shards.values().map(|shard| shard.order).max().unwrap_or(0) + 1;
        let alias = generate_shard_alias(order);
        let manifest = create_shard_manifest(&alias, master_gist_id);
        let body = serde_json::to_string_pretty(&manifest)?;

        let container = self
            .backend
            .create_container(
                &format!("Media shard {}", alias),
                FileMap::from([(SHARD_MANIFEST_FILE.to_string(), body)]),
            )
            .await?;

        let shard = create_shard_info(container.id, alias.clone(), order);
        index.shards.insert(alias.clone(), shard.clone());
        self.cache.set_shard_manifest(&alias, manifest).await;
        info!("opened shard {} (container {})", alias, shard.gist_id);
        Ok(shard)
    }

    /// No shard can ever hold a file above the size limit.
    fn ensure_fits_a_shard(&self, size: u64) -> ShardResult<()> {
        if size > self.policy.size_limit {
            return Err(ShardError::FileTooLarge {
                size,
                limit: self.policy.size_limit,
            });
        }
        Ok(())
    }

    async fn allocate_locked(
        &self,
        index: &mut MasterIndex,
        master_gist_id: &str,
        file_size: u64,
    ) -> ShardResult<ShardInfo> {
        let plan = plan_allocation(index.shards.values(), file_size, &self.policy);
        for alias in &plan.saturated {
            if let Some(shard) = index.shards.get_mut(alias) {
                debug!("shard {} cannot take {} more bytes, marking full", alias, file_size);
                shard.status = ShardStatus::Full;
                shard.updated_at = now_millis();
            }
        }
        match plan.target {
            AllocationTarget::Existing(alias) => index
                .shards
                .get(&alias)
                .cloned()
                .ok_or(ShardError::UnknownShard(alias)),
            AllocationTarget::Open { .. } => self.open_shard(index, master_gist_id).await,
        }
    }

    /// First-fit shard for a new file, opening a new shard when none fits.
    pub async fn allocate_shard_for(&self, file_size: u64, media_type: MediaType) -> ShardResult<ShardInfo> {
        self.ensure_fits_a_shard(file_size)?;
        let (mut guard, master_gist_id) = self.locked_index().await?;
        let index = guard.as_mut().ok_or(ShardError::NotConfigured)?;
        let shard = self.allocate_locked(index, &master_gist_id, file_size).await?;
        debug!("allocated {} for {:?} of {} bytes", shard.alias, media_type, file_size);
        self.commit(index).await;
        Ok(shard)
    }

    /// Register an existing container as a shard (idempotent by container id).
    pub async fn register_existing_container(&self, gist_id: &str) -> ShardResult<ShardInfo> {
        self.update_index(|index| {
            if let Some(existing) = index.shard_by_gist(gist_id) {
                return existing.clone();
            }
            let order = index.shards.values().map(|shard| shard.order).max().unwrap_or(0) + 1;
            let mut shard = create_shard_info(gist_id, generate_shard_alias(order), order);
            shard.description = format!("Master container as shard {}", shard.alias);
            index.shards.insert(shard.alias.clone(), shard.clone());
            shard
        })
        .await
    }

    /// Routing record and shard for `url`; `None` if untracked.
    pub async fn resolve_entry(&self, url: &str) -> ShardResult<Option<(FileIndexEntry, ShardInfo)>> {
        let Some(index) = self.master_index().await? else {
            return Ok(None);
        };
        let Some(entry) = index.file_index.get(url) else {
            return Ok(None);
        };
        Ok(index
            .shards
            .get(&entry.shard_id)
            .map(|shard| (entry.clone(), shard.clone())))
    }

    pub async fn resolve_shard_for(&self, url: &str) -> ShardResult<Option<ShardInfo>> {
        Ok(self.resolve_entry(url).await?.map(|(_, shard)| shard))
    }

    /// Resolve-or-allocate a shard for `request` and record it in the index.
    ///
    /// Re-syncing a tracked URL keeps its shard and adjusts the byte count.
    /// A URL with a live tombstone goes back to the tombstoned shard, which
    /// supersedes the tombstone.
    pub async fn place_file(&self, request: PlacementRequest) -> ShardResult<Placement> {
        self.ensure_fits_a_shard(request.size)?;
        let (mut guard, master_gist_id) = self.locked_index().await?;
        let index = guard.as_mut().ok_or(ShardError::NotConfigured)?;
        let now = now_millis();

        if let Some(existing) = index.file_index.get(&request.url).cloned() {
            if let Some(shard) = index.shards.get_mut(&existing.shard_id) {
                shard.total_size = shard
                    .total_size
                    .saturating_sub(existing.size)
                    .saturating_add(request.size);
                shard.updated_at = now;
                let entry = FileIndexEntry {
                    shard_id: existing.shard_id.clone(),
                    filename: existing.filename.clone(),
                    size: request.size,
                    media_type: request.media_type,
                    synced_at: now,
                    checksum: request.checksum.clone(),
                };
                let shard = shard.clone();
                index.file_index.insert(request.url.clone(), entry.clone());
                self.commit(index).await;
                return Ok(Placement {
                    shard,
                    entry,
                    previous: Some(existing),
                    consumed_tombstones: Vec::new(),
                    expired_tombstones: Vec::new(),
                });
            }
            warn!(
                "{} points at unregistered shard {}, reallocating",
                request.url, existing.shard_id
            );
            index.file_index.remove(&request.url);
        }

        let tombstoned_shard = index
            .live_tombstone(&request.url)
            .map(|tombstone| tombstone.shard_id.clone())
            .filter(|alias| {
                index
                    .shards
                    .get(alias)
                    .is_some_and(|shard| shard_has_capacity(shard, request.size, &self.policy))
            });

        let target_alias = match tombstoned_shard {
            Some(alias) => alias,
            None => {
                self.allocate_locked(index, &master_gist_id, request.size)
                    .await?
                    .alias
            }
        };

        // Tombstones on other shards are superseded by this upload: they no
        // longer hide the URL and their files are purged on the next cleanup.
        let (consumed, superseded): (Vec<_>, Vec<_>) = index
            .take_tombstones(&request.url)
            .into_iter()
            .partition(|tombstone| tombstone.shard_id == target_alias);
        index.tombstones.extend(superseded.iter().cloned().map(|mut tombstone| {
            tombstone.expires_at = tombstone.expires_at.min(now);
            tombstone
        }));

        let shard = index
            .shards
            .get_mut(&target_alias)
            .ok_or_else(|| ShardError::UnknownShard(target_alias.clone()))?;
        for tombstone in &consumed {
            shard.purge_file(tombstone.size);
        }
        shard.record_file(request.size);
        shard.refresh_status(&self.policy);
        let shard = shard.clone();

        let filename = consumed
            .first()
            .map(|tombstone| tombstone.filename.clone())
            .unwrap_or(request.filename);
        let entry = FileIndexEntry {
            shard_id: target_alias,
            filename,
            size: request.size,
            media_type: request.media_type,
            synced_at: now,
            checksum: request.checksum,
        };
        index.file_index.insert(request.url, entry.clone());
        self.commit(index).await;

        Ok(Placement {
            shard,
            entry,
            previous: None,
            consumed_tombstones: consumed,
            expired_tombstones: superseded,
        })
    }

    /// Undo a placement whose content write failed.
    pub async fn revert_placement(&self, url: &str, placement: Placement) -> ShardResult<()> {
        let file_limit = self.policy.file_limit;
        self.update_index(|index| {
            let Some(shard) = index.shards.get_mut(&placement.entry.shard_id) else {
                index.file_index.remove(url);
                return;
            };
            match placement.previous {
                Some(previous) => {
                    shard.total_size = shard
                        .total_size
                        .saturating_sub(placement.entry.size)
                        .saturating_add(previous.size);
                    index.file_index.insert(url.to_string(), previous);
                }
                None => {
                    shard.forget_file(placement.entry.size);
                    for tombstone in &placement.consumed_tombstones {
                        shard.pending_purge_count = shard.pending_purge_count.saturating_add(1);
                        shard.pending_purge_size = shard.pending_purge_size.saturating_add(tombstone.size);
                    }
                    if shard.status == ShardStatus::Full && shard.file_count < file_limit {
                        shard.status = ShardStatus::Active;
                    }
                    index.file_index.remove(url);
                    index.tombstones.extend(placement.consumed_tombstones);
                    for original in &placement.expired_tombstones {
                        if let Some(tombstone) = index.tombstones.iter_mut().find(|tombstone| {
                            tombstone.url == original.url
                                && tombstone.shard_id == original.shard_id
                                && tombstone.deleted_at == original.deleted_at
                        }) {
                            tombstone.expires_at = original.expires_at;
                        }
                    }
                }
            }
        })
        .await
    }

    /// Soft-delete: replace each tracked URL's index entry with a tombstone.
    pub async fn tombstone_files(&self, urls: &[String], deleted_by: &str) -> ShardResult<Vec<(String, TombstoneOutcome)>> {
        let policy = self.policy.clone();
        self.update_index(|index| {
            urls.iter()
                .map(|url| {
                    let Some(entry) = index.file_index.remove(url) else {
                        return (url.clone(), TombstoneOutcome::NotTracked);
                    };
                    if let Some(shard) = index.shards.get_mut(&entry.shard_id) {
                        shard.tombstone_file(entry.size);
                    }
                    let tombstone = create_media_tombstone(
                        url.clone(),
                        entry.shard_id.clone(),
                        entry.filename.clone(),
                        entry.size,
                        deleted_by,
                        &policy,
                    )
                    .with_media_type(entry.media_type);
                    index.tombstones.push(tombstone.clone());
                    (url.clone(), TombstoneOutcome::Deleted(tombstone))
                })
                .collect()
        })
        .await
    }

    /// Re-add `url` from its most recent live tombstone.
    ///
    /// Returns the restored entry, or `None` when there is nothing to restore
    /// (no live tombstone, URL already tracked again, or shard gone).
    pub async fn restore_from_tombstone(&self, url: &str) -> ShardResult<Option<FileIndexEntry>> {
        let (mut guard, _) = self.locked_index().await?;
        let index = guard.as_mut().ok_or(ShardError::NotConfigured)?;
        if index.file_index.contains_key(url) {
            return Ok(None);
        }

        let now = now_millis();
        let Some(position) = index
            .tombstones
            .iter()
            .enumerate()
            .filter(|(_, tombstone)| tombstone.url == url && !is_tombstone_expired_at(tombstone, now))
            .max_by_key(|(_, tombstone)| tombstone.deleted_at)
            .map(|(position, _)| position)
        else {
            return Ok(None);
        };

        let tombstone = index.tombstones[position].clone();
        let Some(shard) = index.shards.get(&tombstone.shard_id).cloned() else {
            warn!("cannot restore {}: shard {} is gone", url, tombstone.shard_id);
            return Ok(None);
        };

        let media_type = match tombstone.media_type {
            Some(media_type) => media_type,
            None => self
                .cache
                .get_shard_manifest(&shard, false)
                .await
                .and_then(|manifest| manifest.files.get(&tombstone.filename).map(|file| file.media_type))
                .unwrap_or_default(),
        };

        index.tombstones.remove(position);
        if let Some(shard) = index.shards.get_mut(&tombstone.shard_id) {
            shard.untombstone_file(tombstone.size);
        }
        let entry = FileIndexEntry {
            shard_id: tombstone.shard_id,
            filename: tombstone.filename,
            size: tombstone.size,
            media_type,
            synced_at: now,
            checksum: None,
        };
        index.file_index.insert(url.to_string(), entry.clone());
        self.commit(index).await;
        Ok(Some(entry))
    }

    /// Snapshot of tombstones whose retention has passed.
    pub async fn expired_tombstones(&self) -> ShardResult<Vec<MediaTombstone>> {
        let now = now_millis();
        Ok(self
            .master_index()
            .await?
            .map(|index| {
                index
                    .tombstones
                    .into_iter()
                    .filter(|tombstone| is_tombstone_expired_at(tombstone, now))
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Drop a tombstone whose file has been physically removed.
    pub async fn purge_tombstone(&self, tombstone: &MediaTombstone) -> ShardResult<bool> {
        self.update_index(|index| {
            let before = index.tombstones.len();
            index.tombstones.retain(|candidate| candidate != tombstone);
            let removed = index.tombstones.len() < before;
            if removed {
                if let Some(shard) = index.shards.get_mut(&tombstone.shard_id) {
                    shard.purge_file(tombstone.size);
                }
            }
            removed
        })
        .await
    }

    /// Explicit lifecycle transition. `archived` is terminal.
    pub async fn set_shard_status(&self, alias: &str, status: ShardStatus) -> ShardResult<ShardInfo> {
        self.update_index(|index| {
            let shard = index
                .shards
                .get_mut(alias)
                .ok_or_else(|| ShardError::UnknownShard(alias.to_string()))?;
            if shard.status == ShardStatus::Archived && status != ShardStatus::Archived {
                return Err(ShardError::ShardArchived(alias.to_string()));
            }
            shard.status = status;
            shard.updated_at = now_millis();
            Ok(shard.clone())
        })
        .await?
    }

    /// Forget the working copy and cached index (after rollback).
    pub async fn reset(&self) {
        *self.index.lock().await = None;
        self.cache.invalidate_master_index().await;
    }

    pub async fn clear_local_cache(&self) {
        self.cache.clear_all().await;
    }
}
