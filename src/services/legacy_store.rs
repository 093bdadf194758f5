//! Single-container media store that predates sharding.
//!
//! Every media file lives directly in the master container and is listed in
//! `media-manifest.json`. Each batch is written as one multi-file update that
//! carries both the content files and the rewritten manifest, so a batch is
//! either fully visible or not at all.

use crate::{
    backend::{ContainerBackend, FileMap},
    errors::ShardResult,
    models::{
        LEGACY_MANIFEST_FILE, LegacyManifest, LegacyMediaEntry, ShardPolicy,
        encoding::{content_checksum, decode_content, encode_content, encode_media_filename},
        now_millis,
    },
    services::shard_sync::{
        DownloadedMedia, MediaUpload, ProgressFn, ShardDownload, ShardSyncResult, SyncAction, report,
    },
};
use bytes::Bytes;
use futures::{FutureExt, StreamExt, stream};
use std::{collections::BTreeSet, sync::Arc};
use tracing::{debug, info, warn};

pub struct LegacyMediaStore {
    backend: Arc<dyn ContainerBackend>,
    policy: ShardPolicy,
}

impl LegacyMediaStore {
    pub fn new(backend: Arc<dyn ContainerBackend>, policy: ShardPolicy) -> Self {
        Self { backend, policy }
    }

    /// The legacy manifest of `master_gist_id`. A container without one is an
    /// empty store; a manifest that does not parse is an error so it is never
    /// overwritten.
    pub async fn load_manifest(&self, master_gist_id: &str) -> ShardResult<LegacyManifest> {
        match self
            .backend
            .get_file_content(LEGACY_MANIFEST_FILE, master_gist_id)
            .await?
        {
            Some(content) => Ok(serde_json::from_str(&content)?),
            None => {
                debug!("no legacy manifest in {}, treating as empty", master_gist_id);
                Ok(LegacyManifest::default())
            }
        }
    }

    pub async fn save_manifest(&self, master_gist_id: &str, manifest: &LegacyManifest) -> ShardResult<()> {
        let body = serde_json::to_string_pretty(manifest)?;
        self.backend
            .update_files(FileMap::from([(LEGACY_MANIFEST_FILE.to_string(), body)]), master_gist_id)
            .await?;
        Ok(())
    }

    pub async fn upload_media(
        &self,
        master_gist_id: &str,
        items: Vec<MediaUpload>,
        on_progress: Option<ProgressFn<'_>>,
    ) -> ShardSyncResult {
        let mut result = ShardSyncResult::empty();
        if items.is_empty() {
            return result;
        }

        let mut manifest = match self.load_manifest(master_gist_id).await {
            Ok(manifest) => manifest,
            Err(err) => {
                warn!("cannot upload, legacy manifest unavailable: {}", err);
                for item in &items {
                    result.record_failure(&item.url, SyncAction::Upload, None, &err);
                }
                return result.finish();
            }
        };

        let total = items.len();
        let mut completed = 0;
        for batch in items.chunks(self.policy.effective_batch_size()) {
            let before = manifest.clone();
            let mut files = FileMap::new();
            for item in batch {
                let filename = manifest
                    .files
                    .get(&item.url)
                    .map(|entry| entry.filename.clone())
                    .unwrap_or_else(|| encode_media_filename(&item.url));
                files.insert(filename.clone(), encode_content(&item.content));
                manifest.files.insert(
                    item.url.clone(),
                    LegacyMediaEntry {
                        filename,
                        media_type: item.media_type,
                        size: item.content.len() as u64,
                        mime_type: item.mime_type.clone(),
                        synced_at: now_millis(),
                        deleted: false,
                        deleted_at: None,
                    },
                );
            }
            manifest.touch();

            let outcome = match serde_json::to_string_pretty(&manifest) {
                Ok(body) => {
                    files.insert(LEGACY_MANIFEST_FILE.to_string(), body);
                    self.backend
                        .update_files(files, master_gist_id)
                        .await
                        .map_err(|err| err.to_string())
                }
                Err(err) => Err(err.to_string()),
            };

            for item in batch {
                completed += 1;
                match &outcome {
                    Ok(()) => result.record_success(&item.url, SyncAction::Upload, master_gist_id),
                    Err(err) => result.record_failure(&item.url, SyncAction::Upload, Some(master_gist_id), err),
                }
                report(on_progress, completed, total, &item.url);
            }
            if let Err(err) = outcome {
                warn!("legacy upload batch of {} failed: {}", batch.len(), err);
                manifest = before;
            }
        }

        result.finish()
    }

    pub async fn download_media(
        &self,
        master_gist_id: &str,
        urls: &[String],
        on_progress: Option<ProgressFn<'_>>,
    ) -> ShardDownload {
        let mut download = ShardDownload {
            result: ShardSyncResult::empty(),
            media: Vec::new(),
        };
        let manifest = match self.load_manifest(master_gist_id).await {
            Ok(manifest) => manifest,
            Err(err) => {
                for url in urls {
                    download
                        .result
                        .record_failure(url, SyncAction::Download, None, &err);
                }
                download.result = download.result.finish();
                return download;
            }
        };

        let total = urls.len();
        let mut completed = 0;
        for batch in urls.chunks(self.policy.effective_batch_size()) {
            let fetched: Vec<(&String, Option<Result<DownloadedMedia, String>>)> = stream::iter(batch)
                .map(|url| {
                    let entry = manifest.files.get(url).filter(|entry| !entry.deleted);
                    async move {
                        let Some(entry) = entry else {
                            return (url, None);
                        };
                        (url, Some(self.fetch_one(master_gist_id, url, entry).await))
                    }
                })
                .buffer_unordered(self.policy.effective_concurrency())
                .collect::<Vec<_>>()
                .boxed()
                .await;

            for (url, outcome) in fetched {
                completed += 1;
                match outcome {
                    Some(Ok(media)) => {
                        download
                            .result
                            .record_success(url, SyncAction::Download, master_gist_id);
                        download.media.push(media);
                    }
                    Some(Err(reason)) => {
                        warn!("legacy download of {} failed: {}", url, reason);
                        download
                            .result
                            .record_failure(url, SyncAction::Download, Some(master_gist_id), reason);
                    }
                    None => download.result.record_skip(url, "not in legacy manifest"),
                }
                report(on_progress, completed, total, url);
            }
        }

        download.result = download.result.finish();
        download
    }

    async fn fetch_one(
        &self,
        master_gist_id: &str,
        url: &str,
        entry: &LegacyMediaEntry,
    ) -> Result<DownloadedMedia, String> {
        let text = self
            .backend
            .get_file_content(&entry.filename, master_gist_id)
            .await
            .map_err(|err| err.to_string())?
            .ok_or_else(|| format!("{} missing from master container", entry.filename))?;
        let bytes = decode_content(&text).ok_or_else(|| "content is not valid base64".to_string())?;
        debug!("fetched {} ({} bytes, md5 {})", url, bytes.len(), content_checksum(&bytes));
        Ok(DownloadedMedia {
            url: url.to_string(),
            shard_id: master_gist_id.to_string(),
            media_type: entry.media_type,
            content: Bytes::from(bytes),
        })
    }

    pub async fn get_synced_urls(&self, master_gist_id: &str) -> ShardResult<BTreeSet<String>> {
        let manifest = self.load_manifest(master_gist_id).await?;
        Ok(manifest.live_entries().map(|(url, _)| url.clone()).collect())
    }

    /// Flag entries as deleted; files stay until [`Self::cleanup_expired`].
    pub async fn soft_delete_media(&self, master_gist_id: &str, urls: &[String], deleted_by: &str) -> ShardSyncResult {
        let mut result = ShardSyncResult::empty();
        if urls.is_empty() {
            return result;
        }

        let mut manifest = match self.load_manifest(master_gist_id).await {
            Ok(manifest) => manifest,
            Err(err) => {
                for url in urls {
                    result.record_failure(url, SyncAction::Delete, None, &err);
                }
                return result.finish();
            }
        };

        let now = now_millis();
        let mut marked = Vec::new();
        for url in urls {
            match manifest.files.get_mut(url) {
                Some(entry) if !entry.deleted => {
                    entry.deleted = true;
                    entry.deleted_at = Some(now);
                    marked.push(url);
                }
                _ => result.record_skip(url, "not in legacy manifest"),
            }
        }
        if marked.is_empty() {
            return result.finish();
        }

        manifest.touch();
        match self.save_manifest(master_gist_id, &manifest).await {
            Ok(()) => {
                for url in marked {
                    result.record_success(url, SyncAction::Delete, master_gist_id);
                }
                info!("legacy soft delete of {} files by {}", result.deleted, deleted_by);
            }
            Err(err) => {
                for url in marked {
                    result.record_failure(url, SyncAction::Delete, Some(master_gist_id), &err);
                }
            }
        }
        result.finish()
    }

    /// Clear the deleted flag while the retention window is open.
    pub async fn restore_media(&self, master_gist_id: &str, url: &str) -> bool {
        let mut manifest = match self.load_manifest(master_gist_id).await {
            Ok(manifest) => manifest,
            Err(err) => {
                warn!("legacy restore of {} failed: {}", url, err);
                return false;
            }
        };
        let retention = self.policy.tombstone_retention_millis();
        let now = now_millis();
        let Some(entry) = manifest.files.get_mut(url) else {
            return false;
        };
        let recoverable = entry.deleted && entry.deleted_at.is_none_or(|deleted_at| deleted_at + retention > now);
        if !recoverable {
            return false;
        }
        entry.deleted = false;
        entry.deleted_at = None;
        manifest.touch();

        match self.save_manifest(master_gist_id, &manifest).await {
            Ok(()) => true,
            Err(err) => {
                warn!("legacy restore of {} failed: {}", url, err);
                false
            }
        }
    }

    /// Physically remove files deleted longer ago than the retention window.
    pub async fn cleanup_expired(&self, master_gist_id: &str) -> usize {
        let mut manifest = match self.load_manifest(master_gist_id).await {
            Ok(manifest) => manifest,
            Err(err) => {
                warn!("legacy cleanup skipped: {}", err);
                return 0;
            }
        };
        let cutoff = now_millis() - self.policy.tombstone_retention_millis();
        let expired: Vec<(String, String)> = manifest
            .files
            .iter()
            .filter(|(_, entry)| entry.deleted && entry.deleted_at.is_some_and(|at| at <= cutoff))
            .map(|(url, entry)| (url.clone(), entry.filename.clone()))
            .collect();
        if expired.is_empty() {
            return 0;
        }

        let filenames: Vec<String> = expired.iter().map(|(_, filename)| filename.clone()).collect();
        if let Err(err) = self.backend.delete_files(&filenames, master_gist_id).await {
            warn!("failed to purge {} legacy files: {}", filenames.len(), err);
            return 0;
        }
        for (url, _) in &expired {
            manifest.files.remove(url);
        }
        manifest.touch();
        if let Err(err) = self.save_manifest(master_gist_id, &manifest).await {
            warn!("purged files but failed to rewrite legacy manifest: {}", err);
        }
        info!("purged {} expired legacy files", expired.len());
        expired.len()
    }
}
