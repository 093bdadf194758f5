//! src/services/shard_migration.rs
//!
//! ShardMigrationService: converts a legacy single-container store into the
//! sharded layout, and back.
//!
//! The master container becomes shard `media-1`, so files that stay in it
//! never move. Files that spill into later shards are copied per target shard
//! in one multi-file write and then removed from the master in one delete.
//! A copy that succeeded but whose delete failed leaves a duplicate behind;
//! [`ShardMigrationService::reconcile_migration`] finishes such moves.

use crate::{
    backend::{BackendError, ContainerBackend, FileMap},
    errors::ShardResult,
    models::{
        LegacyManifest, LegacyMediaEntry, MasterIndex, MediaType, SHARD_MANIFEST_FILE, ShardFileInfo,
        ShardInfo, now_millis, policy::MIGRATION_THRESHOLD,
    },
    services::{
        feature_flags::FeatureFlags,
        legacy_store::LegacyMediaStore,
        shard_router::{PlacementRequest, ShardRouter},
        shard_sync::{ManifestChanges, ShardSyncResult, ShardSyncService},
    },
};
use futures::{FutureExt, StreamExt, stream};
use serde::Serialize;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    #[default]
    Idle,
    Analyzing,
    CreatingIndex,
    Migrating,
    Verifying,
    Completed,
    Failed,
}

/// Progress of the current (or last) migration run.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationState {
    pub phase: MigrationPhase,
    pub total_files: usize,
    pub processed_files: usize,
    pub current_shard: Option<String>,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub error: Option<String>,
}

pub type MigrationProgressFn<'a> = &'a (dyn Fn(&MigrationState) + Send + Sync);

/// One live file listed in the legacy manifest.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyMediaFile {
    pub url: String,
    pub filename: String,
    #[serde(rename = "type")]
    pub media_type: MediaType,
    pub size: u64,
    pub mime_type: String,
    pub synced_at: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationAnalysis {
    pub needs_migration: bool,
    pub current_media_count: usize,
    pub estimated_shards: usize,
    pub total_size: u64,
    pub media_files: Vec<LegacyMediaFile>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationResult {
    pub success: bool,
    pub migrated_files: usize,
    pub created_shards: usize,
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackResult {
    pub success: bool,
    pub restored_files: usize,
    pub removed_shards: usize,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VerificationReport {
    pub valid: bool,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub moved: usize,
    pub deduplicated: usize,
    pub missing: usize,
    pub issues: Vec<String>,
}

/// A file rollback writes back into the legacy manifest.
struct RestoreRecord {
    url: String,
    filename: String,
    media_type: MediaType,
    size: u64,
    synced_at: i64,
    deleted_at: Option<i64>,
}

/// Every file a shard holds, live or tombstoned.
fn restore_records(index: &MasterIndex, alias: &str) -> Vec<RestoreRecord> {
    let mut records: Vec<RestoreRecord> = index
        .file_index
        .iter()
        .filter(|(_, entry)| entry.shard_id == alias)
        .map(|(url, entry)| RestoreRecord {
            url: url.clone(),
            filename: entry.filename.clone(),
            media_type: entry.media_type,
            size: entry.size,
            synced_at: entry.synced_at,
            deleted_at: None,
        })
        .collect();
    records.extend(
        index
            .tombstones
            .iter()
            .filter(|tombstone| tombstone.shard_id == alias && !index.file_index.contains_key(&tombstone.url))
            .map(|tombstone| RestoreRecord {
                url: tombstone.url.clone(),
                filename: tombstone.filename.clone(),
                media_type: tombstone.media_type.unwrap_or_default(),
                size: tombstone.size,
                synced_at: tombstone.deleted_at,
                deleted_at: Some(tombstone.deleted_at),
            }),
    );
    records
}

fn mime_lookup(legacy: &LegacyManifest) -> BTreeMap<&str, &str> {
    legacy
        .files
        .values()
        .map(|entry| (entry.filename.as_str(), entry.mime_type.as_str()))
        .collect()
}

pub struct ShardMigrationService {
    router: Arc<ShardRouter>,
    sync: Arc<ShardSyncService>,
    backend: Arc<dyn ContainerBackend>,
    legacy: Arc<LegacyMediaStore>,
    flags: Arc<FeatureFlags>,
    app_version: String,
    device_id: String,
    state: RwLock<MigrationState>,
}

impl ShardMigrationService {
    pub fn new(
        router: Arc<ShardRouter>,
        sync: Arc<ShardSyncService>,
        backend: Arc<dyn ContainerBackend>,
        legacy: Arc<LegacyMediaStore>,
        flags: Arc<FeatureFlags>,
        app_version: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            router,
            sync,
            backend,
            legacy,
            flags,
            app_version: app_version.into(),
            device_id: device_id.into(),
            state: RwLock::new(MigrationState::default()),
        }
    }

    pub async fn get_state(&self) -> MigrationState {
        self.state.read().await.clone()
    }

    pub async fn reset_state(&self) {
        *self.state.write().await = MigrationState::default();
    }

    async fn update_state(&self, on_progress: Option<MigrationProgressFn<'_>>, update: impl FnOnce(&mut MigrationState)) {
        let snapshot = {
            let mut state = self.state.write().await;
            update(&mut state);
            state.clone()
        };
        if let Some(callback) = on_progress {
            callback(&snapshot);
        }
    }

    async fn enter_phase(&self, phase: MigrationPhase, on_progress: Option<MigrationProgressFn<'_>>) {
        info!("migration phase: {:?}", phase);
        self.update_state(on_progress, |state| {
            state.phase = phase;
            if matches!(phase, MigrationPhase::Completed | MigrationPhase::Failed) {
                state.completed_at = Some(now_millis());
            }
        })
        .await;
    }

    /// Inspect the legacy manifest of `master_gist_id`.
    pub async fn analyze_migration(&self, master_gist_id: &str) -> ShardResult<MigrationAnalysis> {
        let manifest = self.legacy.load_manifest(master_gist_id).await?;
        let media_files: Vec<LegacyMediaFile> = manifest
            .live_entries()
            .map(|(url, entry)| LegacyMediaFile {
                url: url.clone(),
                filename: entry.filename.clone(),
                media_type: entry.media_type,
                size: entry.size,
                mime_type: entry.mime_type.clone(),
                synced_at: entry.synced_at,
            })
            .collect();

        let policy = self.router.policy();
        let current_media_count = media_files.len();
        Ok(MigrationAnalysis {
            needs_migration: current_media_count >= MIGRATION_THRESHOLD,
            current_media_count,
            estimated_shards: current_media_count.div_ceil(policy.file_limit.max(1) as usize),
            total_size: media_files.iter().map(|file| file.size).sum(),
            media_files,
        })
    }

    /// Run a full migration. Never returns early with an error; failures end
    /// the run in the `failed` phase with `error` set.
    pub async fn migrate(&self, master_gist_id: &str, on_progress: Option<MigrationProgressFn<'_>>) -> MigrationResult {
        *self.state.write().await = MigrationState {
            started_at: Some(now_millis()),
            ..MigrationState::default()
        };
        let mut result = MigrationResult::default();

        match self.run_migration(master_gist_id, on_progress, &mut result).await {
            Ok(()) => {
                result.success = true;
                self.enter_phase(MigrationPhase::Completed, on_progress).await;
                info!(
                    "migration completed: {} files across {} shards, {} warnings",
                    result.migrated_files,
                    result.created_shards,
                    result.warnings.len()
                );
            }
            Err(err) => {
                warn!("migration failed: {}", err);
                result.success = false;
                result.error = Some(err.to_string());
                let message = err.to_string();
                self.update_state(on_progress, |state| state.error = Some(message)).await;
                self.enter_phase(MigrationPhase::Failed, on_progress).await;
            }
        }
        result
    }

    async fn run_migration(
        &self,
        master_gist_id: &str,
        on_progress: Option<MigrationProgressFn<'_>>,
        result: &mut MigrationResult,
    ) -> ShardResult<()> {
        self.enter_phase(MigrationPhase::Analyzing, on_progress).await;
        let analysis = self.analyze_migration(master_gist_id).await?;
        let total_files = analysis.current_media_count;
        self.update_state(on_progress, |state| state.total_files = total_files).await;

        self.enter_phase(MigrationPhase::CreatingIndex, on_progress).await;
        self.router.set_master_gist_id(master_gist_id).await?;
        let existing = self.router.load_master_index_from_remote().await?;
        if existing.is_some() {
            info!("resuming migration with existing master index");
        } else {
            self.router.initialize_master_index(&self.app_version).await?;
        }
        let master_shard = self.router.register_existing_container(master_gist_id).await?;
        self.router.persist_master_index().await?;

        self.enter_phase(MigrationPhase::Migrating, on_progress).await;
        let already_indexed: BTreeSet<String> = self
            .router
            .master_index()
            .await?
            .map(|index| index.file_index.into_keys().collect())
            .unwrap_or_default();

        let mut changes: BTreeMap<String, (ShardInfo, ManifestChanges)> = BTreeMap::new();
        changes.insert(master_shard.alias.clone(), (master_shard.clone(), ManifestChanges::default()));

        let batch_size = self.router.policy().effective_batch_size();
        for batch in analysis.media_files.chunks(batch_size) {
            self.migrate_batch(master_gist_id, batch, &already_indexed, result, &mut changes)
                .await;
            if let Err(err) = self.router.persist_master_index().await {
                result
                    .warnings
                    .push(format!("failed to persist master index mid-migration: {}", err));
            }
            let processed = batch.len();
            self.update_state(on_progress, |state| state.processed_files += processed)
                .await;
            self.router.cache().extend_cache_ttl(None).await;
        }

        let mut scratch = ShardSyncResult::empty();
        self.sync.apply_manifest_changes(changes, &mut scratch).await;
        result.warnings.extend(scratch.errors);

        self.router.persist_master_index().await?;
        result.created_shards = self.router.shards().await.len();
        self.flags.set_sharding_enabled(true).await?;

        self.enter_phase(MigrationPhase::Verifying, on_progress).await;
        let report = self.verify_migration(master_gist_id).await;
        if !report.valid {
            warn!("migration verification reported {} issues", report.issues.len());
            result.warnings.extend(report.issues);
        }
        Ok(())
    }

    /// Place every file of `batch` and move the ones that landed outside the
    /// master container.
    async fn migrate_batch(
        &self,
        master_gist_id: &str,
        batch: &[LegacyMediaFile],
        already_indexed: &BTreeSet<String>,
        result: &mut MigrationResult,
        changes: &mut BTreeMap<String, (ShardInfo, ManifestChanges)>,
    ) {
        let mut moves: BTreeMap<String, (ShardInfo, Vec<&LegacyMediaFile>)> = BTreeMap::new();

        for file in batch {
            if already_indexed.contains(&file.url) {
                debug!("{} already indexed, skipping", file.url);
                continue;
            }
            let request = PlacementRequest {
                url: file.url.clone(),
                filename: file.filename.clone(),
                size: file.size,
                media_type: file.media_type,
                checksum: None,
            };
            match self.router.place_file(request).await {
                Ok(placement) if placement.shard.gist_id == master_gist_id => {
                    result.migrated_files += 1;
                    self.record_manifest_file(changes, &placement.shard, file, placement.entry.synced_at);
                }
                Ok(placement) => {
                    moves
                        .entry(placement.shard.alias.clone())
                        .or_insert_with(|| (placement.shard.clone(), Vec::new()))
                        .1
                        .push(file);
                }
                Err(err) => {
                    warn!("could not place {}: {}", file.url, err);
                    result.warnings.push(format!("could not place {}: {}", file.url, err));
                }
            }
        }

        for (alias, (shard, files)) in moves {
            self.update_state(None, |state| state.current_shard = Some(alias.clone()))
                .await;
            let moved = self
                .move_files(master_gist_id, &shard, &files, &mut result.warnings)
                .await;
            for file in files.iter().filter(|file| moved.contains(&file.filename)) {
                self.record_manifest_file(changes, &shard, file, now_millis());
            }
            result.migrated_files += moved.len();
        }
    }

    fn record_manifest_file(
        &self,
        changes: &mut BTreeMap<String, (ShardInfo, ManifestChanges)>,
        shard: &ShardInfo,
        file: &LegacyMediaFile,
        synced_at: i64,
    ) {
        let info = ShardFileInfo {
            url: file.url.clone(),
            media_type: file.media_type,
            size: file.size,
            mime_type: file.mime_type.clone(),
            synced_at,
            synced_from_device: self.device_id.clone(),
        };
        changes
            .entry(shard.alias.clone())
            .or_insert_with(|| (shard.clone(), ManifestChanges::default()))
            .1
            .upserts
            .push((file.filename.clone(), info));
    }

    /// Copy `files` from the master container to `shard` in one write, then
    /// delete them from the master in one request. Returns the filenames now
    /// present on `shard`.
    async fn move_files(
        &self,
        master_gist_id: &str,
        shard: &ShardInfo,
        files: &[&LegacyMediaFile],
        warnings: &mut Vec<String>,
    ) -> BTreeSet<String> {
        let filenames: Vec<String> = files.iter().map(|file| file.filename.clone()).collect();
        let payload = self.read_files(master_gist_id, &filenames, warnings).await;
        if payload.is_empty() {
            return BTreeSet::new();
        }

        let copied: BTreeSet<String> = payload.keys().cloned().collect();
        if let Err(err) = self.backend.update_files(payload, &shard.gist_id).await {
            warn!("failed to copy {} files to {}: {}", copied.len(), shard.alias, err);
            warnings.push(format!("failed to copy {} files to {}: {}", copied.len(), shard.alias, err));
            return BTreeSet::new();
        }

        let names: Vec<String> = copied.iter().cloned().collect();
        if let Err(err) = self.backend.delete_files(&names, master_gist_id).await {
            warnings.push(format!(
                "copied {} files to {} but could not remove them from the master container: {}",
                names.len(),
                shard.alias,
                err
            ));
        }
        debug!("moved {} files to {}", copied.len(), shard.alias);
        copied
    }

    /// Read `filenames` from a container with bounded concurrency. Files
    /// that cannot be read are reported in `warnings` and left out.
    async fn read_files(&self, container_id: &str, filenames: &[String], warnings: &mut Vec<String>) -> FileMap {
        let concurrency = self.router.policy().effective_concurrency();
        let backend = &self.backend;
        let reads: Vec<(&String, Result<Option<String>, BackendError>)> = stream::iter(filenames)
            .map(|filename| async move { (filename, backend.get_file_content(filename, container_id).await) })
            .buffer_unordered(concurrency)
            .collect::<Vec<_>>()
            .boxed()
            .await;

        let mut payload = FileMap::new();
        for (filename, outcome) in reads {
            match outcome {
                Ok(Some(content)) => {
                    payload.insert(filename.clone(), content);
                }
                Ok(None) => warnings.push(format!("{} missing from container {}", filename, container_id)),
                Err(err) => warnings.push(format!("failed to read {} from {}: {}", filename, container_id, err)),
            }
        }
        payload
    }

    /// Structural check of the persisted index against the backend.
    pub async fn verify_migration(&self, master_gist_id: &str) -> VerificationReport {
        let cache = self.router.cache();
        let Some(index) = cache.get_master_index(master_gist_id, true).await else {
            return VerificationReport {
                valid: false,
                issues: vec![format!("master index missing or unreadable in {}", master_gist_id)],
            };
        };

        let mut issues = Vec::new();
        for shard in index.ordered_shards() {
            match self.backend.get_container(&shard.gist_id).await {
                Ok(Some(container)) => {
                    if !container.files.contains_key(SHARD_MANIFEST_FILE) {
                        continue;
                    }
                    match cache.get_shard_manifest(shard, true).await {
                        Some(manifest) if manifest.master_gist_id != master_gist_id => issues.push(format!(
                            "manifest of shard {} belongs to master {}",
                            shard.alias, manifest.master_gist_id
                        )),
                        Some(_) => {}
                        None => issues.push(format!("manifest of shard {} is unreadable", shard.alias)),
                    }
                }
                Ok(None) | Err(BackendError::ContainerNotFound(_)) => issues.push(format!(
                    "shard {} container {} does not exist",
                    shard.alias, shard.gist_id
                )),
                Err(err) => issues.push(format!("could not check shard {}: {}", shard.alias, err)),
            }
        }

        let indexed = index.file_index.len() as u64;
        let counted = index.shard_file_count();
        if indexed != counted {
            issues.push(format!(
                "file index holds {} entries but shards count {} files",
                indexed, counted
            ));
        }
        for (url, entry) in &index.file_index {
            if !index.shards.contains_key(&entry.shard_id) {
                issues.push(format!("{} points at unregistered shard {}", url, entry.shard_id));
            }
        }

        VerificationReport {
            valid: issues.is_empty(),
            issues,
        }
    }

    /// Finish interrupted moves: copy files still only in the master
    /// container, and drop master copies already present on their shard.
    pub async fn reconcile_migration(&self, master_gist_id: &str) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let index = match self.router.master_index().await {
            Ok(Some(index)) => index,
            Ok(None) => {
                report.issues.push("no master index to reconcile".to_string());
                return report;
            }
            Err(err) => {
                report.issues.push(format!("cannot load master index: {}", err));
                return report;
            }
        };
        let master_files = match self.backend.get_container(master_gist_id).await {
            Ok(Some(container)) => container.files,
            Ok(None) => {
                report
                    .issues
                    .push(format!("master container {} does not exist", master_gist_id));
                return report;
            }
            Err(err) => {
                report.issues.push(format!("cannot list master container: {}", err));
                return report;
            }
        };
        let legacy = match self.legacy.load_manifest(master_gist_id).await {
            Ok(legacy) => legacy,
            Err(err) => {
                warn!("legacy manifest unreadable during reconcile: {}", err);
                LegacyManifest::default()
            }
        };
        let mime_types = mime_lookup(&legacy);

        let batch_size = self.router.policy().effective_batch_size();
        let mut changes: BTreeMap<String, (ShardInfo, ManifestChanges)> = BTreeMap::new();
        for shard in index.ordered_shards() {
            if shard.gist_id == master_gist_id {
                continue;
            }
            let target_files = match self.backend.get_container(&shard.gist_id).await {
                Ok(Some(container)) => container.files,
                Ok(None) => {
                    report
                        .issues
                        .push(format!("shard {} container {} does not exist", shard.alias, shard.gist_id));
                    continue;
                }
                Err(err) => {
                    report.issues.push(format!("cannot list shard {}: {}", shard.alias, err));
                    continue;
                }
            };

            let mut to_move = Vec::new();
            let mut duplicates = Vec::new();
            let mut moved_names = Vec::new();
            for (url, entry) in index.file_index.iter().filter(|(_, entry)| entry.shard_id == shard.alias) {
                let on_shard = target_files.contains_key(&entry.filename);
                let on_master = master_files.contains_key(&entry.filename);
                match (on_shard, on_master) {
                    (true, true) => duplicates.push(entry.filename.clone()),
                    (false, true) => to_move.push((url, entry)),
                    (false, false) => {
                        report.missing += 1;
                        report
                            .issues
                            .push(format!("{} missing from both {} and the master container", url, shard.alias));
                    }
                    (true, false) => {}
                }
            }

            for chunk in to_move.chunks(batch_size) {
                let filenames: Vec<String> = chunk.iter().map(|(_, entry)| entry.filename.clone()).collect();
                let payload = self.read_files(master_gist_id, &filenames, &mut report.issues).await;
                if payload.is_empty() {
                    continue;
                }
                let copied: Vec<String> = payload.keys().cloned().collect();
                if let Err(err) = self.backend.update_files(payload, &shard.gist_id).await {
                    report
                        .issues
                        .push(format!("failed to copy {} files to {}: {}", copied.len(), shard.alias, err));
                    continue;
                }
                report.moved += copied.len();
                for (url, entry) in chunk.iter().filter(|(_, entry)| copied.contains(&entry.filename)) {
                    let info = ShardFileInfo {
                        url: (*url).clone(),
                        media_type: entry.media_type,
                        size: entry.size,
                        mime_type: mime_types.get(entry.filename.as_str()).copied().unwrap_or_default().to_string(),
                        synced_at: entry.synced_at,
                        synced_from_device: self.device_id.clone(),
                    };
                    changes
                        .entry(shard.alias.clone())
                        .or_insert_with(|| (shard.clone(), ManifestChanges::default()))
                        .1
                        .upserts
                        .push((entry.filename.clone(), info));
                }
                moved_names.extend(copied);
            }

            let duplicate_count = duplicates.len();
            let mut stale = duplicates;
            stale.extend(moved_names);
            if stale.is_empty() {
                continue;
            }
            match self.backend.delete_files(&stale, master_gist_id).await {
                Ok(()) => report.deduplicated += duplicate_count,
                Err(err) => report.issues.push(format!(
                    "could not remove {} master copies of {} files: {}",
                    stale.len(),
                    shard.alias,
                    err
                )),
            }
        }

        let mut scratch = ShardSyncResult::empty();
        self.sync.apply_manifest_changes(changes, &mut scratch).await;
        report.issues.extend(scratch.errors);

        info!(
            "reconcile: {} moved, {} deduplicated, {} missing",
            report.moved, report.deduplicated, report.missing
        );
        report
    }

    /// Return every file to the master container and tear the shards down.
    ///
    /// A shard is deleted only after all of its files are back in the master
    /// container and listed in the legacy manifest. The master index is only
    /// removed when no shard had to be kept.
    pub async fn rollback(&self, master_gist_id: &str) -> RollbackResult {
        let mut result = RollbackResult::default();

        if self.router.master_gist_id().await.as_deref() != Some(master_gist_id) {
            if let Err(err) = self.router.set_master_gist_id(master_gist_id).await {
                result.warnings.push(format!("failed to bind master container: {}", err));
            }
        }
        let index = match self.router.load_master_index_from_remote().await {
            Ok(Some(index)) => Some(index),
            Ok(None) => self.router.master_index().await.ok().flatten(),
            Err(err) => {
                result.warnings.push(format!("cannot load master index: {}", err));
                None
            }
        };

        let mut legacy = match self.legacy.load_manifest(master_gist_id).await {
            Ok(legacy) => legacy,
            Err(err) => {
                result
                    .warnings
                    .push(format!("legacy manifest unreadable, rollback aborted: {}", err));
                return result;
            }
        };

        let mut kept_shards = 0;
        if let Some(index) = &index {
            for shard in index.ordered_shards() {
                let records = restore_records(index, &shard.alias);
                if shard.gist_id == master_gist_id {
                    let manifest = self.router.cache().get_shard_manifest(shard, false).await;
                    for record in records {
                        let mime_type = legacy
                            .files
                            .get(&record.url)
                            .map(|entry| entry.mime_type.clone())
                            .filter(|mime| !mime.is_empty())
                            .or_else(|| {
                                manifest
                                    .as_ref()
                                    .and_then(|manifest| manifest.files.get(&record.filename))
                                    .map(|file| file.mime_type.clone())
                            })
                            .unwrap_or_default();
                        legacy.files.insert(record.url.clone(), legacy_entry(&record, mime_type));
                    }
                    continue;
                }

                match self.restore_shard(master_gist_id, shard, &records, &mut legacy).await {
                    Ok(restored) => {
                        legacy.touch();
                        if let Err(err) = self.legacy.save_manifest(master_gist_id, &legacy).await {
                            result.warnings.push(format!(
                                "files of {} copied back but legacy manifest not saved: {}",
                                shard.alias, err
                            ));
                            kept_shards += 1;
                            continue;
                        }
                        result.restored_files += restored;
                        if let Err(err) = self.backend.delete_container(&shard.gist_id).await {
                            result
                                .warnings
                                .push(format!("failed to delete shard {}: {}", shard.alias, err));
                            continue;
                        }
                        result.removed_shards += 1;
                        let alias = shard.alias.clone();
                        if let Err(err) = self.router.update_index(|index| forget_shard(index, &alias)).await {
                            debug!("could not drop {} from working index: {}", alias, err);
                        }
                        info!("rolled back shard {} ({} files)", shard.alias, restored);
                    }
                    Err(reason) => {
                        warn!("keeping shard {}: {}", shard.alias, reason);
                        result.warnings.push(format!("kept shard {}: {}", shard.alias, reason));
                        kept_shards += 1;
                    }
                }
            }
        } else {
            result.warnings.push("no master index found, nothing to move back".to_string());
        }

        legacy.touch();
        if let Err(err) = self.legacy.save_manifest(master_gist_id, &legacy).await {
            result.warnings.push(format!("failed to save legacy manifest: {}", err));
            kept_shards += 1;
        }

        if kept_shards == 0 {
            if index.is_some() {
                if let Err(err) = self.router.delete_master_index().await {
                    result.warnings.push(format!("failed to delete master index: {}", err));
                }
            }
            if let Err(err) = self
                .backend
                .delete_files(&[SHARD_MANIFEST_FILE.to_string()], master_gist_id)
                .await
            {
                result
                    .warnings
                    .push(format!("failed to delete master shard manifest: {}", err));
            }
        } else {
            result.warnings.push(format!(
                "{} shards still hold files, master index kept for a later rollback",
                kept_shards
            ));
            if let Err(err) = self.router.persist_master_index().await {
                result.warnings.push(format!("failed to persist master index: {}", err));
            }
        }

        if let Err(err) = self.flags.set_sharding_enabled(false).await {
            result.warnings.push(format!("failed to disable sharding: {}", err));
        }
        self.router.clear_local_cache().await;
        self.router.reset().await;
        self.reset_state().await;

        result.success = result.warnings.is_empty();
        info!(
            "rollback finished: {} files restored, {} shards removed",
            result.restored_files, result.removed_shards
        );
        result
    }

    /// Copy every file of `shard` back into the master container and add
    /// them to `legacy`. On error nothing is added to `legacy`.
    async fn restore_shard(
        &self,
        master_gist_id: &str,
        shard: &ShardInfo,
        records: &[RestoreRecord],
        legacy: &mut LegacyManifest,
    ) -> Result<usize, String> {
        let master_files = match self.backend.get_container(master_gist_id).await {
            Ok(Some(container)) => container.files,
            Ok(None) => return Err(format!("master container {} does not exist", master_gist_id)),
            Err(err) => return Err(err.to_string()),
        };
        let manifest = self.router.cache().get_shard_manifest(shard, true).await;

        let batch_size = self.router.policy().effective_batch_size();
        let mut restored: Vec<&RestoreRecord> = Vec::with_capacity(records.len());
        for chunk in records.chunks(batch_size) {
            let filenames: Vec<String> = chunk.iter().map(|record| record.filename.clone()).collect();
            let mut problems = Vec::new();
            let payload = self.read_files(&shard.gist_id, &filenames, &mut problems).await;

            for record in chunk {
                if !payload.contains_key(&record.filename) && !master_files.contains_key(&record.filename) {
                    return Err(format!("{} could not be read: {}", record.url, problems.join("; ")));
                }
            }
            if !payload.is_empty() {
                self.backend
                    .update_files(payload, master_gist_id)
                    .await
                    .map_err(|err| format!("copy to master failed: {}", err))?;
            }
            restored.extend(chunk);
        }

        for record in &restored {
            let mime_type = manifest
                .as_ref()
                .and_then(|manifest| manifest.files.get(&record.filename))
                .map(|file| file.mime_type.clone())
                .or_else(|| legacy.files.get(&record.url).map(|entry| entry.mime_type.clone()))
                .unwrap_or_default();
            legacy.files.insert(record.url.clone(), legacy_entry(record, mime_type));
        }
        Ok(restored.len())
    }
}

fn legacy_entry(record: &RestoreRecord, mime_type: String) -> LegacyMediaEntry {
    LegacyMediaEntry {
        filename: record.filename.clone(),
        media_type: record.media_type,
        size: record.size,
        mime_type,
        synced_at: record.synced_at,
        deleted: record.deleted_at.is_some(),
        deleted_at: record.deleted_at,
    }
}

/// Remove a shard and everything routed to it from the index.
fn forget_shard(index: &mut MasterIndex, alias: &str) {
    index.shards.remove(alias);
    index.file_index.retain(|_, entry| entry.shard_id != alias);
    index.tombstones.retain(|tombstone| tombstone.shard_id != alias);
}
