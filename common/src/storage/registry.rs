// Named storage backends shared between repositories

use super::StorageBackend;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Thread-safe map of storage name to live backend
#[derive(Default)]
pub struct StorageRegistry {
    storages: RwLock<HashMap<String, Arc<dyn StorageBackend>>>,
}

impl StorageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend under its own name, replacing any previous one.
    /// Returns the replaced backend, if any.
    pub fn add(&self, storage: Arc<dyn StorageBackend>) -> Option<Arc<dyn StorageBackend>> {
        let name = storage.name().to_string();
        info!(storage = %name, kind = %storage.kind(), "Storage registered");
        self.storages.write().insert(name, storage)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn StorageBackend>> {
        self.storages.read().get(name).cloned()
    }

    pub fn remove(&self, name: &str) -> Option<Arc<dyn StorageBackend>> {
        let removed = self.storages.write().remove(name);
        if removed.is_some() {
            info!(storage = %name, "Storage removed");
        }
        removed
    }

    pub fn contains(&self, name: &str) -> bool {
        self.storages.read().contains_key(name)
    }

    pub fn list(&self) -> Vec<Arc<dyn StorageBackend>> {
        self.storages.read().values().cloned().collect()
    }

    /// Sorted storage names
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.storages.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.storages.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.storages.read().is_empty()
    }
}
