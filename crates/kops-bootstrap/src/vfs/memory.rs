use super::{StateStore, VfsError, VfsPath};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// In-memory backend keyed by full path; clones share contents.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    objects: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `data` at `path` (any scheme).
    pub fn insert(&self, path: &str, data: impl Into<Vec<u8>>) {
        let key = VfsPath::parse(path).map_or_else(|_| path.to_string(), |p| p.to_string());
        if let Ok(mut objects) = self.objects.lock() {
            objects.insert(key, data.into());
        }
    }

    /// Removes the object at `path`.
    pub fn remove(&self, path: &str) {
        let key = VfsPath::parse(path).map_or_else(|_| path.to_string(), |p| p.to_string());
        if let Ok(mut objects) = self.objects.lock() {
            objects.remove(&key);
        }
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn read_file(&self, path: &VfsPath) -> Result<Vec<u8>, VfsError> {
        let key = path.to_string();
        let objects = self.objects.lock().map_err(|_| VfsError::Io {
            path: key.clone(),
            source: std::io::Error::other("memory store lock poisoned"),
        })?;
        objects.get(&key).cloned().ok_or(VfsError::NotFound(key))
    }
}
