//! Directory-backed container backend.
//!
//! Each container is a directory `root/{container_id}` holding one plain file
//! per container file. Writes go to a temporary file and are renamed into
//! place so readers never observe half-written content.

use super::{BackendError, BackendResult, ContainerBackend, ContainerFile, ContainerInfo, FileMap};
use async_trait::async_trait;
use std::{
    collections::BTreeMap,
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tokio::{fs, io::AsyncWriteExt};
use tracing::debug;
use uuid::Uuid;

const DESCRIPTION_FILE: &str = ".description";
const MAX_FILENAME_LEN: usize = 255;

#[derive(Clone, Debug)]
pub struct FilesystemBackend {
    /// Directory under which every container directory lives.
    pub root: PathBuf,
}

impl FilesystemBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Rejects names that could escape the container directory.
    fn ensure_name_safe(name: &str) -> BackendResult<()> {
        if name.is_empty()
            || name.len() > MAX_FILENAME_LEN
            || name.starts_with('.')
            || name.contains('/')
            || name.contains('\\')
            || name.bytes().any(|b| b.is_ascii_control())
        {
            return Err(BackendError::InvalidFilename(name.to_string()));
        }
        Ok(())
    }

    fn container_dir(&self, container_id: &str) -> BackendResult<PathBuf> {
        Self::ensure_name_safe(container_id)?;
        Ok(self.root.join(container_id))
    }

    async fn existing_container_dir(&self, container_id: &str) -> BackendResult<PathBuf> {
        let dir = self.container_dir(container_id)?;
        match fs::metadata(&dir).await {
            Ok(meta) if meta.is_dir() => Ok(dir),
            Ok(_) => Err(BackendError::ContainerNotFound(container_id.to_string())),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(BackendError::ContainerNotFound(container_id.to_string()))
            }
            Err(err) => Err(BackendError::Io(err)),
        }
    }

    async fn write_atomic(dir: &Path, name: &str, content: &str) -> BackendResult<()> {
        let tmp_path = dir.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = fs::File::create(&tmp_path).await?;
        if let Err(err) = file.write_all(content.as_bytes()).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(BackendError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(BackendError::Io(err));
        }
        if let Err(err) = fs::rename(&tmp_path, dir.join(name)).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(BackendError::Io(err));
        }
        Ok(())
    }

    async fn list(&self, container_id: &str, dir: &Path) -> BackendResult<ContainerInfo> {
        let description = match fs::read_to_string(dir.join(DESCRIPTION_FILE)).await {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => String::new(),
            Err(err) => return Err(BackendError::Io(err)),
        };

        let mut files = BTreeMap::new();
        let mut entries = fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let meta = entry.metadata().await?;
            if meta.is_file() {
                files.insert(name, ContainerFile { size: meta.len() });
            }
        }

        Ok(ContainerInfo {
            id: container_id.to_string(),
            description,
            files,
        })
    }
}

#[async_trait]
impl ContainerBackend for FilesystemBackend {
    async fn get_file_content(&self, filename: &str, container_id: &str) -> BackendResult<Option<String>> {
        Self::ensure_name_safe(filename)?;
        let dir = self.existing_container_dir(container_id).await?;
        match fs::read_to_string(dir.join(filename)).await {
            Ok(content) => Ok(Some(content)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(BackendError::Io(err)),
        }
    }

    async fn update_files(&self, files: FileMap, container_id: &str) -> BackendResult<()> {
        for name in files.keys() {
            Self::ensure_name_safe(name)?;
        }
        let dir = self.existing_container_dir(container_id).await?;
        for (name, content) in &files {
            Self::write_atomic(&dir, name, content).await?;
        }
        debug!("wrote {} files to container {}", files.len(), container_id);
        Ok(())
    }

    async fn delete_files(&self, filenames: &[String], container_id: &str) -> BackendResult<()> {
        for name in filenames {
            Self::ensure_name_safe(name)?;
        }
        let dir = self.existing_container_dir(container_id).await?;
        for name in filenames {
            match fs::remove_file(dir.join(name)).await {
                Ok(_) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    debug!("file {} already missing from {}", name, container_id);
                }
                Err(err) => return Err(BackendError::Io(err)),
            }
        }
        Ok(())
    }

    async fn create_container(&self, description: &str, files: FileMap) -> BackendResult<ContainerInfo> {
        for name in files.keys() {
            Self::ensure_name_safe(name)?;
        }
        let id = Uuid::new_v4().simple().to_string();
        let dir = self.container_dir(&id)?;
        fs::create_dir_all(&dir).await?;
        Self::write_atomic(&dir, DESCRIPTION_FILE, description).await?;
        for (name, content) in &files {
            Self::write_atomic(&dir, name, content).await?;
        }
        self.list(&id, &dir).await
    }

    async fn delete_container(&self, container_id: &str) -> BackendResult<()> {
        let dir = self.existing_container_dir(container_id).await?;
        fs::remove_dir_all(&dir).await?;
        Ok(())
    }

    async fn get_container(&self, container_id: &str) -> BackendResult<Option<ContainerInfo>> {
        match self.existing_container_dir(container_id).await {
            Ok(dir) => self.list(container_id, &dir).await.map(Some),
            Err(BackendError::ContainerNotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }
}
