//! HTTP handlers for media upload, download and soft delete.
//! Content travels as standard base64 inside JSON bodies.

use crate::{
    errors::AppError,
    models::{
        MediaType,
        encoding::{decode_content, encode_content},
    },
    routes::routes::AppState,
    services::shard_sync::{MediaUpload, ShardSyncResult},
};
use axum::{Json, extract::State};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadItem {
    pub url: String,
    #[serde(rename = "type", default)]
    pub media_type: MediaType,
    #[serde(default)]
    pub mime_type: String,

    /// Base64-encoded bytes.
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct UploadRequest {
    pub items: Vec<UploadItem>,
}

#[derive(Debug, Deserialize)]
pub struct UrlsRequest {
    pub urls: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteRequest {
    pub urls: Vec<String>,
    #[serde(default)]
    pub deleted_by: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RestoreRequest {
    pub url: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadedItem {
    pub url: String,
    pub shard_id: String,
    #[serde(rename = "type")]
    pub media_type: MediaType,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct DownloadResponse {
    pub result: ShardSyncResult,
    pub media: Vec<DownloadedItem>,
}

/// `POST /media/upload`
pub async fn upload_media(
    State(store): State<AppState>,
    Json(request): Json<UploadRequest>,
) -> Result<Json<ShardSyncResult>, AppError> {
    let mut items = Vec::with_capacity(request.items.len());
    for item in request.items {
        let content = decode_content(&item.content)
            .ok_or_else(|| AppError::bad_request(format!("content of {} is not valid base64", item.url)))?;
        items.push(MediaUpload {
            url: item.url,
            media_type: item.media_type,
            mime_type: item.mime_type,
            content: Bytes::from(content),
        });
    }
    Ok(Json(store.upload_media(items, None).await))
}

/// `POST /media/download`
pub async fn download_media(
    State(store): State<AppState>,
    Json(request): Json<UrlsRequest>,
) -> Json<DownloadResponse> {
    let download = store.download_media(&request.urls, None).await;
    let media = download
        .media
        .into_iter()
        .map(|media| DownloadedItem {
            content: encode_content(&media.content),
            url: media.url,
            shard_id: media.shard_id,
            media_type: media.media_type,
        })
        .collect();
    Json(DownloadResponse {
        result: download.result,
        media,
    })
}

/// `GET /media/urls`
pub async fn synced_urls(State(store): State<AppState>) -> Json<Value> {
    let urls = store.get_synced_urls().await;
    Json(json!({ "count": urls.len(), "urls": urls }))
}

/// `POST /media/delete`
pub async fn soft_delete_media(
    State(store): State<AppState>,
    Json(request): Json<DeleteRequest>,
) -> Json<ShardSyncResult> {
    let deleted_by = request.deleted_by.unwrap_or_else(|| "http".to_string());
    Json(store.soft_delete_media(&request.urls, &deleted_by).await)
}

/// `POST /media/restore`
pub async fn restore_media(
    State(store): State<AppState>,
    Json(request): Json<RestoreRequest>,
) -> Json<Value> {
    let restored = store.restore_media(&request.url).await;
    Json(json!({ "url": request.url, "restored": restored }))
}

/// `POST /media/tombstones/cleanup`
pub async fn cleanup_tombstones(State(store): State<AppState>) -> Json<Value> {
    let purged = store.cleanup_expired_tombstones().await;
    Json(json!({ "purged": purged }))
}
