//! Defines routes for the media store admin API.
//!
//! ## Structure
//! - **Health**
//!   - `GET  /healthz`, `GET /readyz`
//!
//! - **Media**
//!   - `POST /media/upload` - upload base64 items
//!   - `POST /media/download` - fetch by URL
//!   - `GET  /media/urls` - live synced URLs
//!   - `POST /media/delete` - soft delete
//!   - `POST /media/restore` - undo a soft delete
//!   - `POST /media/tombstones/cleanup` - purge expired tombstones
//!
//! - **Shards**
//!   - `GET  /shards/stats`, `GET /shards/cache`
//!   - `POST /shards/setup` - first-run setup on a master container
//!   - `POST /shards/{alias}/archive`
//!
//! - **Migration**
//!   - `GET  /migration/analyze`, `GET /migration/verify`, `GET /migration/state`
//!   - `POST /migration/start`, `POST /migration/rollback`, `POST /migration/reconcile`

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        media_handlers::{cleanup_tombstones, download_media, restore_media, soft_delete_media, synced_urls, upload_media},
        migration_handlers::{analyze, reconcile, rollback, start, state, verify},
        shard_handlers::{archive_shard, cache_stats, setup_shards, shard_stats},
    },
    services::sharded_store::ShardedMediaStore,
};
use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;

/// Shared state carried to every handler.
pub type AppState = Arc<ShardedMediaStore>;

/// Build and return the router for the whole admin API.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // media
        .route("/media/upload", post(upload_media))
        .route("/media/download", post(download_media))
        .route("/media/urls", get(synced_urls))
        .route("/media/delete", post(soft_delete_media))
        .route("/media/restore", post(restore_media))
        .route("/media/tombstones/cleanup", post(cleanup_tombstones))
        // shards
        .route("/shards/stats", get(shard_stats))
        .route("/shards/cache", get(cache_stats))
        .route("/shards/setup", post(setup_shards))
        .route("/shards/{alias}/archive", post(archive_shard))
        // migration
        .route("/migration/analyze", get(analyze))
        .route("/migration/start", post(start))
        .route("/migration/rollback", post(rollback))
        .route("/migration/verify", get(verify))
        .route("/migration/reconcile", post(reconcile))
        .route("/migration/state", get(state))
}
