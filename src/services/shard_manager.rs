//! Cross-shard statistics and coarse lifecycle actions.

use crate::{
    errors::ShardResult,
    models::{ShardInfo, ShardStatus},
    services::shard_router::ShardRouter,
};
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShardDetail {
    pub alias: String,
    pub gist_id: String,
    pub status: ShardStatus,
    pub file_count: u32,
    pub total_size: u64,
    pub pending_purge_count: u32,
    pub usage_percent: f64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShardStats {
    pub total_shards: usize,
    pub active_shards: usize,
    pub full_shards: usize,
    pub archived_shards: usize,
    pub total_files: u64,
    pub total_size: u64,

    /// Mean file-limit usage across shards, in percent.
    pub average_usage: f64,

    pub shard_details: Vec<ShardDetail>,
}

struct CacheWarmer {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct ShardManager {
    router: Arc<ShardRouter>,
    warmer: Mutex<Option<CacheWarmer>>,
}

impl ShardManager {
    pub fn new(router: Arc<ShardRouter>) -> Self {
        Self {
            router,
            warmer: Mutex::new(None),
        }
    }

    /// Projection over the router's current index. Empty when none is loaded.
    pub async fn get_shard_stats(&self) -> ShardStats {
        let policy = self.router.policy().clone();
        let index = match self.router.master_index().await {
            Ok(Some(index)) => index,
            _ => return ShardStats::default(),
        };

        let shards: Vec<&ShardInfo> = index.ordered_shards();
        let count_status = |status: ShardStatus| shards.iter().filter(|s| s.status == status).count();
        let shard_details: Vec<ShardDetail> = shards
            .iter()
            .map(|shard| ShardDetail {
                alias: shard.alias.clone(),
                gist_id: shard.gist_id.clone(),
                status: shard.status,
                file_count: shard.file_count,
                total_size: shard.total_size,
                pending_purge_count: shard.pending_purge_count,
                usage_percent: shard.usage_percent(&policy),
            })
            .collect();
        let average_usage = if shard_details.is_empty() {
            0.0
        } else {
            shard_details.iter().map(|d| d.usage_percent).sum::<f64>() / shard_details.len() as f64
        };

        ShardStats {
            total_shards: shards.len(),
            active_shards: count_status(ShardStatus::Active),
            full_shards: count_status(ShardStatus::Full),
            archived_shards: count_status(ShardStatus::Archived),
            total_files: index.file_index.len() as u64,
            total_size: shards.iter().map(|shard| shard.total_size).sum(),
            average_usage,
            shard_details,
        }
    }

    /// Retire a shard. Its files stay readable; it never receives new ones.
    pub async fn archive_shard(&self, alias: &str) -> ShardResult<ShardInfo> {
        let shard = self.router.set_shard_status(alias, ShardStatus::Archived).await?;
        self.router.persist_master_index().await?;
        info!("archived shard {}", alias);
        Ok(shard)
    }

    /// Periodically sweep expired cache entries and re-warm manifests.
    /// Replaces a warmer that is already running.
    pub async fn start_cache_warmer(&self, interval: Duration) {
        let mut slot = self.warmer.lock().await;
        if let Some(previous) = slot.take() {
            previous.token.cancel();
        }

        let token = CancellationToken::new();
        let child = token.clone();
        let router = self.router.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => {
                        let cache = router.cache();
                        let removed = cache.cleanup_expired_cache().await;
                        let shards = router.shards().await;
                        let loaded = cache.preload_all_shard_manifests(&shards).await;
                        debug!("cache warmer: removed {}, warmed {} manifests", removed, loaded);
                    }
                }
            }
        });
        *slot = Some(CacheWarmer { token, handle });
    }

    /// Stop background work. Safe to call more than once.
    pub async fn destroy(&self) {
        if let Some(warmer) = self.warmer.lock().await.take() {
            warmer.token.cancel();
            let _ = warmer.handle.await;
            debug!("shard manager cache warmer stopped");
        }
    }
}
