//! In-process container backend.
//!
//! Used by tests and for local experiments. Supports failure injection per
//! container and counts content reads so cache behaviour can be asserted.

use super::{BackendError, BackendResult, ContainerBackend, ContainerFile, ContainerInfo, FileMap};
use async_trait::async_trait;
use std::{
    collections::{HashMap, HashSet},
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicUsize, Ordering},
    },
};
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
struct MemoryContainer {
    description: String,
    files: FileMap,
}

#[derive(Default)]
struct MemoryState {
    containers: HashMap<String, MemoryContainer>,
    failing: HashSet<String>,
    fail_creates: bool,
}

#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    reads: AtomicUsize,
    creates: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // A poisoned map is still structurally valid; keep serving it.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check(&self, state: &MemoryState, container_id: &str) -> BackendResult<()> {
        if state.failing.contains(container_id) {
            return Err(BackendError::Rejected(format!(
                "injected failure for container `{}`",
                container_id
            )));
        }
        Ok(())
    }

    /// Seed a container under a caller-chosen id.
    pub fn insert_container(&self, id: &str, description: &str, files: FileMap) {
        self.lock().containers.insert(
            id.to_string(),
            MemoryContainer {
                description: description.to_string(),
                files,
            },
        );
    }

    /// Make every request touching `container_id` fail until cleared.
    pub fn fail_container(&self, container_id: &str) {
        self.lock().failing.insert(container_id.to_string());
    }

    pub fn heal_container(&self, container_id: &str) {
        self.lock().failing.remove(container_id);
    }

    /// Make `create_container` fail until cleared.
    pub fn set_fail_creates(&self, fail: bool) {
        self.lock().fail_creates = fail;
    }

    /// Number of `get_file_content` calls served so far.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn container_exists(&self, container_id: &str) -> bool {
        self.lock().containers.contains_key(container_id)
    }

    pub fn container_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().containers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn file(&self, container_id: &str, filename: &str) -> Option<String> {
        self.lock()
            .containers
            .get(container_id)
            .and_then(|container| container.files.get(filename).cloned())
    }

    pub fn file_names(&self, container_id: &str) -> Vec<String> {
        self.lock()
            .containers
            .get(container_id)
            .map(|container| container.files.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop a container behind the store's back (simulates external drift).
    pub fn remove_container(&self, container_id: &str) {
        self.lock().containers.remove(container_id);
    }
}

fn info_for(id: &str, container: &MemoryContainer) -> ContainerInfo {
    ContainerInfo {
        id: id.to_string(),
        description: container.description.clone(),
        files: container
            .files
            .iter()
            .map(|(name, content)| {
                (
                    name.clone(),
                    ContainerFile {
                        size: content.len() as u64,
                    },
                )
            })
            .collect(),
    }
}

#[async_trait]
impl ContainerBackend for MemoryBackend {
    async fn get_file_content(&self, filename: &str, container_id: &str) -> BackendResult<Option<String>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let state = self.lock();
        self.check(&state, container_id)?;
        let container = state
            .containers
            .get(container_id)
            .ok_or_else(|| BackendError::ContainerNotFound(container_id.to_string()))?;
        Ok(container.files.get(filename).cloned())
    }

    async fn update_files(&self, files: FileMap, container_id: &str) -> BackendResult<()> {
        let mut state = self.lock();
        self.check(&state, container_id)?;
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| BackendError::ContainerNotFound(container_id.to_string()))?;
        container.files.extend(files);
        Ok(())
    }

    async fn delete_files(&self, filenames: &[String], container_id: &str) -> BackendResult<()> {
        let mut state = self.lock();
        self.check(&state, container_id)?;
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| BackendError::ContainerNotFound(container_id.to_string()))?;
        for name in filenames {
            container.files.remove(name);
        }
        Ok(())
    }

    async fn create_container(&self, description: &str, files: FileMap) -> BackendResult<ContainerInfo> {
        let mut state = self.lock();
        if state.fail_creates {
            return Err(BackendError::Rejected("injected create failure".into()));
        }
        self.creates.fetch_add(1, Ordering::SeqCst);
        let id = format!("mem-{}", Uuid::new_v4().simple());
        let container = MemoryContainer {
            description: description.to_string(),
            files,
        };
        let info = info_for(&id, &container);
        state.containers.insert(id, container);
        Ok(info)
    }

    async fn delete_container(&self, container_id: &str) -> BackendResult<()> {
        let mut state = self.lock();
        self.check(&state, container_id)?;
        state
            .containers
            .remove(container_id)
            .map(|_| ())
            .ok_or_else(|| BackendError::ContainerNotFound(container_id.to_string()))
    }

    async fn get_container(&self, container_id: &str) -> BackendResult<Option<ContainerInfo>> {
        let state = self.lock();
        self.check(&state, container_id)?;
        Ok(state
            .containers
            .get(container_id)
            .map(|container| info_for(container_id, container)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_update_read_delete() {
        let backend = MemoryBackend::new();
        let info = backend
            .create_container("test", FileMap::from([("a".to_string(), "1".to_string())]))
            .await
            .unwrap();
        backend
            .update_files(FileMap::from([("b".to_string(), "22".to_string())]), &info.id)
            .await
            .unwrap();

        let listed = backend.get_container(&info.id).await.unwrap().unwrap();
        assert_eq!(listed.files.len(), 2);
        assert_eq!(listed.files["b"].size, 2);

        backend.delete_files(&["a".to_string()], &info.id).await.unwrap();
        assert_eq!(backend.get_file_content("a", &info.id).await.unwrap(), None);
        assert_eq!(backend.read_count(), 1);

        backend.delete_container(&info.id).await.unwrap();
        assert!(backend.get_container(&info.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn injected_failures_surface_as_errors() {
        let backend = MemoryBackend::new();
        backend.insert_container("g", "", FileMap::new());
        backend.fail_container("g");
        assert!(backend.get_file_content("x", "g").await.is_err());
        backend.heal_container("g");
        assert!(backend.get_file_content("x", "g").await.unwrap().is_none());
    }
}
