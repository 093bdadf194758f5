//! src/services/shard_sync.rs
//!
//! ShardSyncService: moves media between callers and shards chosen by the
//! router, keeping the master index and each shard manifest consistent.
//!
//! Items are processed in batches of `batch_size`; within a batch at most
//! `concurrency` backend writes/reads are in flight. A failing item is
//! recorded in the result and never aborts the batch.

use crate::{
    backend::{BackendError, ContainerBackend, FileMap},
    errors::ShardResult,
    models::{
        MediaType, SHARD_MANIFEST_FILE, ShardFileInfo, ShardInfo, ShardManifest, create_shard_manifest,
        encoding::{content_checksum, decode_content, encode_content, encode_media_filename},
        now_millis,
    },
    services::{
        shard_cache::ShardCache,
        shard_router::{Placement, PlacementRequest, ShardRouter, TombstoneOutcome},
    },
};
use bytes::Bytes;
use futures::{FutureExt, StreamExt, stream};
use serde::Serialize;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};
use tracing::{debug, info, warn};

/// One media object handed in for upload.
#[derive(Debug, Clone)]
pub struct MediaUpload {
    pub url: String,
    pub media_type: MediaType,
    pub mime_type: String,
    pub content: Bytes,
}

/// One media object fetched from its shard.
#[derive(Debug, Clone)]
pub struct DownloadedMedia {
    pub url: String,
    pub shard_id: String,
    pub media_type: MediaType,
    pub content: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    Upload,
    Download,
    Delete,
    Restore,
    Skip,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncDetail {
    pub url: String,
    pub action: SyncAction,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of a batched sync call.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardSyncResult {
    pub success: bool,
    pub uploaded: usize,
    pub downloaded: usize,
    pub deleted: usize,
    pub skipped: usize,
    pub failed: usize,
    pub details: Vec<SyncDetail>,

    /// Store-level problems not tied to one item (e.g. index persist).
    pub errors: Vec<String>,
}

impl ShardSyncResult {
    pub(crate) fn empty() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub(crate) fn record_success(&mut self, url: &str, action: SyncAction, shard_id: &str) {
        match action {
            SyncAction::Upload => self.uploaded += 1,
            SyncAction::Download => self.downloaded += 1,
            SyncAction::Delete => self.deleted += 1,
            SyncAction::Restore | SyncAction::Skip => {}
        }
        self.details.push(SyncDetail {
            url: url.to_string(),
            action,
            success: true,
            shard_id: Some(shard_id.to_string()),
            error: None,
        });
    }

    pub(crate) fn record_failure(&mut self, url: &str, action: SyncAction, shard_id: Option<&str>, error: impl ToString) {
        self.failed += 1;
        self.details.push(SyncDetail {
            url: url.to_string(),
            action,
            success: false,
            shard_id: shard_id.map(str::to_string),
            error: Some(error.to_string()),
        });
    }

    pub(crate) fn record_skip(&mut self, url: &str, reason: &str) {
        self.skipped += 1;
        self.details.push(SyncDetail {
            url: url.to_string(),
            action: SyncAction::Skip,
            success: false,
            shard_id: None,
            error: Some(reason.to_string()),
        });
    }

    pub(crate) fn finish(mut self) -> Self {
        self.success = self.failed == 0 && self.errors.is_empty();
        self
    }
}

/// Download outcome plus the fetched payloads.
#[derive(Debug, Clone, Default)]
pub struct ShardDownload {
    pub result: ShardSyncResult,
    pub media: Vec<DownloadedMedia>,
}

/// Progress report delivered after each item.
#[derive(Debug, Clone)]
pub struct SyncProgress {
    pub completed: usize,
    pub total: usize,
    pub url: String,
}

pub type ProgressFn<'a> = &'a (dyn Fn(SyncProgress) + Send + Sync);

pub(crate) fn report(on_progress: Option<ProgressFn<'_>>, completed: usize, total: usize, url: &str) {
    if let Some(callback) = on_progress {
        callback(SyncProgress {
            completed,
            total,
            url: url.to_string(),
        });
    }
}

/// Manifest edits collected for one shard during a batch.
#[derive(Default)]
pub(crate) struct ManifestChanges {
    pub(crate) upserts: Vec<(String, ShardFileInfo)>,
    pub(crate) removals: Vec<String>,
}

pub struct ShardSyncService {
    router: Arc<ShardRouter>,
    cache: Arc<ShardCache>,
    backend: Arc<dyn ContainerBackend>,
    device_id: String,
}

impl ShardSyncService {
    pub fn new(
        router: Arc<ShardRouter>,
        cache: Arc<ShardCache>,
        backend: Arc<dyn ContainerBackend>,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            router,
            cache,
            backend,
            device_id: device_id.into(),
        }
    }

    /// Upload media into shards chosen by the router.
    pub async fn upload_media(&self, items: Vec<MediaUpload>, on_progress: Option<ProgressFn<'_>>) -> ShardSyncResult {
        let mut result = ShardSyncResult::empty();
        if items.is_empty() {
            return result;
        }

        let policy = self.router.policy().clone();
        let total = items.len();
        let mut completed = 0;

        for batch in items.chunks(policy.effective_batch_size()) {
            let mut placed: Vec<(&MediaUpload, Placement)> = Vec::with_capacity(batch.len());
            for item in batch {
                let request = PlacementRequest {
                    url: item.url.clone(),
                    filename: encode_media_filename(&item.url),
                    size: item.content.len() as u64,
                    media_type: item.media_type,
                    checksum: Some(content_checksum(&item.content)),
                };
                match self.router.place_file(request).await {
                    Ok(placement) => placed.push((item, placement)),
                    Err(err) => {
                        warn!("no shard available for {}: {}", item.url, err);
                        result.record_failure(&item.url, SyncAction::Upload, None, err);
                        completed += 1;
                        report(on_progress, completed, total, &item.url);
                    }
                }
            }

            let backend = &self.backend;
            let writes: Vec<(&MediaUpload, Placement, Result<(), BackendError>)> = stream::iter(placed)
                .map(|(item, placement)| async move {
                    let files = FileMap::from([(placement.entry.filename.clone(), encode_content(&item.content))]);
                    let outcome = backend.update_files(files, &placement.shard.gist_id).await;
                    (item, placement, outcome)
                })
                .buffer_unordered(policy.effective_concurrency())
                .collect::<Vec<_>>()
                .boxed()
                .await;

            let mut changes: BTreeMap<String, (ShardInfo, ManifestChanges)> = BTreeMap::new();
            for (item, placement, outcome) in writes {
                completed += 1;
                let alias = placement.shard.alias.clone();
                match outcome {
                    Ok(()) => {
                        let info = ShardFileInfo {
                            url: item.url.clone(),
                            media_type: item.media_type,
                            size: placement.entry.size,
                            mime_type: item.mime_type.clone(),
                            synced_at: placement.entry.synced_at,
                            synced_from_device: self.device_id.clone(),
                        };
                        changes
                            .entry(alias.clone())
                            .or_insert_with(|| (placement.shard.clone(), ManifestChanges::default()))
                            .1
                            .upserts
                            .push((placement.entry.filename.clone(), info));
                        result.record_success(&item.url, SyncAction::Upload, &alias);
                    }
                    Err(err) => {
                        warn!("upload of {} to {} failed: {}", item.url, alias, err);
                        if let Err(revert_err) = self.router.revert_placement(&item.url, placement).await {
                            warn!("failed to revert placement of {}: {}", item.url, revert_err);
                        }
                        result.record_failure(&item.url, SyncAction::Upload, Some(&alias), err);
                    }
                }
                report(on_progress, completed, total, &item.url);
            }

            self.apply_manifest_changes(changes, &mut result).await;
            if let Err(err) = self.router.persist_master_index().await {
                warn!("failed to persist master index after upload batch: {}", err);
                result.errors.push(format!("persist master index: {}", err));
            }
        }

        let result = result.finish();
        info!(
            "upload finished: {} uploaded, {} failed",
            result.uploaded, result.failed
        );
        result
    }

    /// Fetch media from the shards the index routes them to.
    pub async fn download_media(&self, urls: &[String], on_progress: Option<ProgressFn<'_>>) -> ShardDownload {
        let mut download = ShardDownload {
            result: ShardSyncResult::empty(),
            media: Vec::new(),
        };
        let policy = self.router.policy().clone();
        let total = urls.len();
        let mut completed = 0;

        for batch in urls.chunks(policy.effective_batch_size()) {
            let fetched: Vec<(&String, Result<DownloadedMedia, DownloadFailure>)> = stream::iter(batch)
                .map(|url| async move { (url, self.fetch_one(url).await) })
                .buffer_unordered(policy.effective_concurrency())
                .collect::<Vec<_>>()
                .boxed()
                .await;

            for (url, outcome) in fetched {
                completed += 1;
                match outcome {
                    Ok(media) => {
                        download
                            .result
                            .record_success(url, SyncAction::Download, &media.shard_id);
                        download.media.push(media);
                    }
                    Err(DownloadFailure::NotTracked) => {
                        download.result.record_skip(url, "not tracked in master index");
                    }
                    Err(DownloadFailure::Failed { shard_id, reason }) => {
                        warn!("download of {} failed: {}", url, reason);
                        download
                            .result
                            .record_failure(url, SyncAction::Download, shard_id.as_deref(), reason);
                    }
                }
                report(on_progress, completed, total, url);
            }
        }

        download.result = download.result.finish();
        download
    }

    async fn fetch_one(&self, url: &str) -> Result<DownloadedMedia, DownloadFailure> {
        let (entry, shard) = match self.router.resolve_entry(url).await {
            Ok(Some(resolved)) => resolved,
            Ok(None) => return Err(DownloadFailure::NotTracked),
            Err(err) => {
                return Err(DownloadFailure::Failed {
                    shard_id: None,
                    reason: err.to_string(),
                });
            }
        };
        let fail = |reason: String| DownloadFailure::Failed {
            shard_id: Some(shard.alias.clone()),
            reason,
        };

        let text = self
            .backend
            .get_file_content(&entry.filename, &shard.gist_id)
            .await
            .map_err(|err| fail(err.to_string()))?
            .ok_or_else(|| fail(format!("{} missing from shard", entry.filename)))?;
        let bytes = decode_content(&text).ok_or_else(|| fail("content is not valid base64".into()))?;

        if let Some(expected) = &entry.checksum {
            let actual = content_checksum(&bytes);
            if &actual != expected {
                return Err(fail(format!("checksum mismatch: expected {}, got {}", expected, actual)));
            }
        }

        Ok(DownloadedMedia {
            url: url.to_string(),
            shard_id: shard.alias.clone(),
            media_type: entry.media_type,
            content: Bytes::from(bytes),
        })
    }

    /// URLs present in the index and not shadowed by a live tombstone.
    pub async fn get_synced_urls(&self) -> ShardResult<BTreeSet<String>> {
        let Some(index) = self.router.master_index().await? else {
            return Ok(BTreeSet::new());
        };
        Ok(index
            .file_index
            .keys()
            .filter(|url| index.live_tombstone(url).is_none())
            .cloned()
            .collect())
    }

    /// Two-phase delete: tombstone now, purge the file after retention.
    pub async fn soft_delete_media(&self, urls: &[String], deleted_by: &str) -> ShardSyncResult {
        let mut result = ShardSyncResult::empty();
        if urls.is_empty() {
            return result;
        }

        match self.router.tombstone_files(urls, deleted_by).await {
            Ok(outcomes) => {
                for (url, outcome) in outcomes {
                    match outcome {
                        TombstoneOutcome::Deleted(tombstone) => {
                            result.record_success(&url, SyncAction::Delete, &tombstone.shard_id);
                        }
                        TombstoneOutcome::NotTracked => result.record_skip(&url, "not tracked in master index"),
                    }
                }
            }
            Err(err) => {
                for url in urls {
                    result.record_failure(url, SyncAction::Delete, None, &err);
                }
                return result.finish();
            }
        }

        if result.deleted > 0 {
            if let Err(err) = self.router.persist_master_index().await {
                warn!("failed to persist master index after soft delete: {}", err);
                result.errors.push(format!("persist master index: {}", err));
            }
        }
        result.finish()
    }

    /// Undo a soft delete while its tombstone is live.
    pub async fn restore_media(&self, url: &str) -> bool {
        match self.router.restore_from_tombstone(url).await {
            Ok(Some(entry)) => {
                info!("restored {} on {}", url, entry.shard_id);
                if let Err(err) = self.router.persist_master_index().await {
                    warn!("failed to persist master index after restore: {}", err);
                }
                true
            }
            Ok(None) => false,
            Err(err) => {
                warn!("restore of {} failed: {}", url, err);
                false
            }
        }
    }

    /// Physically remove files whose tombstones expired. Returns how many
    /// tombstones were purged.
    pub async fn cleanup_expired_tombstones(&self) -> usize {
        let expired = match self.router.expired_tombstones().await {
            Ok(expired) => expired,
            Err(err) => {
                warn!("cannot list expired tombstones: {}", err);
                return 0;
            }
        };
        if expired.is_empty() {
            return 0;
        }

        let shards: BTreeMap<String, ShardInfo> = self
            .router
            .shards()
            .await
            .into_iter()
            .map(|shard| (shard.alias.clone(), shard))
            .collect();

        let mut by_shard: BTreeMap<String, Vec<_>> = BTreeMap::new();
        for tombstone in expired {
            by_shard.entry(tombstone.shard_id.clone()).or_default().push(tombstone);
        }

        let mut purged = 0;
        let mut changes: BTreeMap<String, (ShardInfo, ManifestChanges)> = BTreeMap::new();
        for (alias, tombstones) in by_shard {
            if let Some(shard) = shards.get(&alias) {
                let filenames: Vec<String> = tombstones.iter().map(|t| t.filename.clone()).collect();
                if let Err(err) = self.backend.delete_files(&filenames, &shard.gist_id).await {
                    warn!("failed to purge {} files from {}: {}", filenames.len(), alias, err);
                    continue;
                }
                changes.insert(
                    alias.clone(),
                    (
                        shard.clone(),
                        ManifestChanges {
                            upserts: Vec::new(),
                            removals: filenames,
                        },
                    ),
                );
            } else {
                debug!("shard {} no longer registered, dropping its tombstones", alias);
            }

            for tombstone in &tombstones {
                match self.router.purge_tombstone(tombstone).await {
                    Ok(true) => purged += 1,
                    Ok(false) => {}
                    Err(err) => warn!("failed to drop tombstone for {}: {}", tombstone.url, err),
                }
            }
        }

        let mut scratch = ShardSyncResult::empty();
        self.apply_manifest_changes(changes, &mut scratch).await;
        if purged > 0 {
            if let Err(err) = self.router.persist_master_index().await {
                warn!("failed to persist master index after tombstone cleanup: {}", err);
            }
            info!("purged {} expired tombstones", purged);
        }
        purged
    }

    /// Apply collected manifest edits, one manifest write per shard.
    pub(crate) async fn apply_manifest_changes(
        &self,
        changes: BTreeMap<String, (ShardInfo, ManifestChanges)>,
        result: &mut ShardSyncResult,
    ) {
        let master_gist_id = self.router.master_gist_id().await.unwrap_or_default();
        for (alias, (shard, edits)) in changes {
            let Some(mut manifest) = self.load_manifest_for_update(&shard, &master_gist_id).await else {
                warn!("manifest of {} unavailable, skipping manifest update", alias);
                result
                    .errors
                    .push(format!("manifest of {} unavailable, not updated", alias));
                continue;
            };
            for (filename, info) in edits.upserts {
                manifest.upsert(filename, info);
            }
            for filename in &edits.removals {
                manifest.remove(filename);
            }
            manifest.updated_at = now_millis();

            if let Err(err) = self.write_manifest(&shard, manifest).await {
                warn!("failed to write manifest of {}: {}", alias, err);
                result.errors.push(format!("write manifest of {}: {}", alias, err));
            }
        }
    }

    /// Current manifest, or a fresh one if the shard has none. `None` when a
    /// manifest exists but cannot be read, so it is never clobbered.
    async fn load_manifest_for_update(&self, shard: &ShardInfo, master_gist_id: &str) -> Option<ShardManifest> {
        if let Some(manifest) = self.cache.get_shard_manifest(shard, false).await {
            return Some(manifest);
        }
        match self.backend.get_container(&shard.gist_id).await {
            Ok(Some(container)) if container.files.contains_key(SHARD_MANIFEST_FILE) => None,
            Ok(Some(_)) => Some(create_shard_manifest(&shard.alias, master_gist_id)),
            Ok(None) | Err(_) => None,
        }
    }

    async fn write_manifest(&self, shard: &ShardInfo, manifest: ShardManifest) -> ShardResult<()> {
        let body = serde_json::to_string_pretty(&manifest)?;
        self.backend
            .update_files(FileMap::from([(SHARD_MANIFEST_FILE.to_string(), body)]), &shard.gist_id)
            .await?;
        self.cache.set_shard_manifest(&shard.alias, manifest).await;
        Ok(())
    }
}

#[derive(Debug)]
enum DownloadFailure {
    NotTracked,
    Failed { shard_id: Option<String>, reason: String },
}
