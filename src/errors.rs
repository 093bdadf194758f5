use crate::{backend::BackendError, kv::KvError};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use thiserror::Error;

/// Errors returned by the shard services.
///
/// Transient backend failures are mostly absorbed into per-item results and
/// warning lists; what reaches callers here are precondition failures and
/// failed explicit persists.
#[derive(Debug, Error)]
pub enum ShardError {
    #[error("shard store is not configured with a master container")]
    NotConfigured,
    #[error("master index is not available for container `{0}`")]
    MasterIndexUnavailable(String),
    #[error("shard `{0}` is not registered")]
    UnknownShard(String),
    #[error("shard `{0}` is archived")]
    ShardArchived(String),
    #[error("file of {size} bytes exceeds the shard size limit of {limit} bytes")]
    FileTooLarge { size: u64, limit: u64 },
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type ShardResult<T> = Result<T, ShardError>;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<ShardError> for AppError {
    fn from(err: ShardError) -> Self {
        let status = match &err {
            ShardError::NotConfigured => StatusCode::CONFLICT,
            ShardError::UnknownShard(_) => StatusCode::NOT_FOUND,
            ShardError::ShardArchived(_) => StatusCode::CONFLICT,
            ShardError::FileTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ShardError::MasterIndexUnavailable(_) | ShardError::Backend(_) => StatusCode::BAD_GATEWAY,
            ShardError::Kv(_) | ShardError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError::new(status, err.to_string())
    }
}
