//! Remote container backend.
//!
//! A "container" is a quota-limited bag of named text files (a Gist on
//! GitHub). The shard services only ever talk to a backend through
//! [`ContainerBackend`], so the same code runs against the Gist API, a local
//! directory tree, or an in-process map in tests.

pub mod filesystem;
pub mod gist;
pub mod memory;

use async_trait::async_trait;
use std::collections::BTreeMap;
use thiserror::Error;

pub use filesystem::FilesystemBackend;
pub use gist::GistBackend;
pub use memory::MemoryBackend;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("container `{0}` not found")]
    ContainerNotFound(String),
    #[error("backend request failed with status {status}: {message}")]
    Http { status: u16, message: String },
    #[error("backend transport error: {0}")]
    Transport(String),
    #[error("backend rejected request: {0}")]
    Rejected(String),
    #[error("invalid filename `{0}`")]
    InvalidFilename(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Metadata of one file in a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerFile {
    pub size: u64,
}

/// Container listing returned by `create_container` and `get_container`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub description: String,
    pub files: BTreeMap<String, ContainerFile>,
}

/// Filename -> text content.
pub type FileMap = BTreeMap<String, String>;

#[async_trait]
pub trait ContainerBackend: Send + Sync {
    /// Text content of one file; `Ok(None)` when the file does not exist.
    async fn get_file_content(&self, filename: &str, container_id: &str) -> BackendResult<Option<String>>;

    /// Create or overwrite several files in one atomic request.
    async fn update_files(&self, files: FileMap, container_id: &str) -> BackendResult<()>;

    /// Remove several files in one request. Missing files are ignored.
    async fn delete_files(&self, filenames: &[String], container_id: &str) -> BackendResult<()>;

    async fn create_container(&self, description: &str, files: FileMap) -> BackendResult<ContainerInfo>;

    async fn delete_container(&self, container_id: &str) -> BackendResult<()>;

    /// `Ok(None)` when the container does not exist.
    async fn get_container(&self, container_id: &str) -> BackendResult<Option<ContainerInfo>>;
}
