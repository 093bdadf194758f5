use crate::{
    errors::AppError,
    models::ShardInfo,
    routes::routes::AppState,
    services::shard_manager::ShardStats,
};
use axum::{
    Json,
    extract::{Path, State},
};
use serde::Deserialize;
use serde_json::{Value, json};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupRequest {
    pub master_gist_id: String,
}

/// `GET /shards/stats`
pub async fn shard_stats(State(store): State<AppState>) -> Json<ShardStats> {
    Json(store.get_shard_stats().await)
}

/// `POST /shards/setup`
pub async fn setup_shards(
    State(store): State<AppState>,
    Json(request): Json<SetupRequest>,
) -> Result<Json<Value>, AppError> {
    if request.master_gist_id.trim().is_empty() {
        return Err(AppError::bad_request("masterGistId must not be empty"));
    }
    let index = store.setup_shard_system(&request.master_gist_id).await?;
    Ok(Json(json!({
        "masterGistId": request.master_gist_id,
        "version": index.version,
        "shards": index.shards.len(),
        "files": index.file_index.len(),
    })))
}

/// `POST /shards/{alias}/archive`
pub async fn archive_shard(
    State(store): State<AppState>,
    Path(alias): Path<String>,
) -> Result<Json<ShardInfo>, AppError> {
    Ok(Json(store.archive_shard(&alias).await?))
}

/// `GET /shards/cache`
pub async fn cache_stats(State(store): State<AppState>) -> Json<Value> {
    let stats = store.cache_stats().await;
    Json(json!(stats))
}
