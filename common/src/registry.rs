// In-memory repository registry
//
// Entries are immutable snapshots behind `Arc`; updates swap in a new snapshot so
// a pipeline run that already holds one keeps a consistent view.

use crate::errors::ValidationError;
use crate::models::BackupRepository;
use crate::storage::StorageBackend;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Concurrency-safe map of repository name to its current record
#[derive(Default)]
pub struct RepositoryRegistry {
    repositories: RwLock<HashMap<String, Arc<BackupRepository>>>,
}

impl RepositoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new repository. Names are unique.
    pub fn add(&self, repository: BackupRepository) -> Result<Arc<BackupRepository>, ValidationError> {
        let mut repositories = self.repositories.write();
        if repositories.contains_key(&repository.name) {
            return Err(ValidationError::DuplicateName {
                kind: "repository".to_string(),
                name: repository.name,
            });
        }

        let repository = Arc::new(repository);
        repositories.insert(repository.name.clone(), Arc::clone(&repository));
        info!(repository = %repository.name, "Repository registered");
        Ok(repository)
    }

    /// Insert or replace a repository, returning the previous record
    pub fn upsert(&self, repository: BackupRepository) -> Option<Arc<BackupRepository>> {
        let name = repository.name.clone();
        let previous = self
            .repositories
            .write()
            .insert(name.clone(), Arc::new(repository));
        debug!(repository = %name, replaced = previous.is_some(), "Repository stored");
        previous
    }

    pub fn get(&self, name: &str) -> Option<Arc<BackupRepository>> {
        self.repositories.read().get(name).cloned()
    }

    pub fn delete(&self, name: &str) -> Option<Arc<BackupRepository>> {
        let removed = self.repositories.write().remove(name);
        if removed.is_some() {
            info!(repository = %name, "Repository removed");
        }
        removed
    }

    /// All repositories, sorted by name
    pub fn list(&self) -> Vec<Arc<BackupRepository>> {
        let mut repositories: Vec<_> = self.repositories.read().values().cloned().collect();
        repositories.sort_by(|a, b| a.name.cmp(&b.name));
        repositories
    }

    pub fn len(&self) -> usize {
        self.repositories.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.repositories.read().is_empty()
    }

    /// Apply `change` to a copy of the named repository and store the result.
    /// Returns the new snapshot, or `None` if the repository is unknown.
    pub fn update<F>(&self, name: &str, change: F) -> Option<Arc<BackupRepository>>
    where
        F: FnOnce(&mut BackupRepository),
    {
        let mut repositories = self.repositories.write();
        let current = repositories.get(name)?;

        let mut next = BackupRepository::clone(current);
        change(&mut next);
        // The registry key is the identity; renames are not updates
        next.name = name.to_string();

        let next = Arc::new(next);
        repositories.insert(name.to_string(), Arc::clone(&next));
        debug!(repository = %name, "Repository updated");
        Some(next)
    }

    pub fn attach_storage(
        &self,
        name: &str,
        storage: Arc<dyn StorageBackend>,
    ) -> Option<Arc<BackupRepository>> {
        let storage_name = storage.name().to_string();
        let updated = self.update(name, move |repository| repository.attach_storage(storage));
        if updated.is_some() {
            info!(repository = %name, storage = %storage_name, "Storage attached");
        }
        updated
    }

    /// Detach a storage from one repository. Returns whether it was attached.
    pub fn detach_storage(&self, name: &str, storage_name: &str) -> bool {
        let mut detached = false;
        self.update(name, |repository| {
            detached = repository.detach_storage(storage_name);
        });
        if detached {
            info!(repository = %name, storage = %storage_name, "Storage detached");
        }
        detached
    }

    /// Swap in `storage` for every repository already bound to a storage of the
    /// same name. Unbound repositories are left alone, so a storage detached
    /// concurrently is never re-attached. Returns the repositories that changed.
    pub fn replace_storage_everywhere(&self, storage: &Arc<dyn StorageBackend>) -> Vec<String> {
        let mut repositories = self.repositories.write();
        let mut changed = Vec::new();

        for (name, current) in repositories.iter_mut() {
            if !current.storages.iter().any(|s| s.name() == storage.name()) {
                continue;
            }
            let mut next = BackupRepository::clone(current);
            next.attach_storage(Arc::clone(storage));
            *current = Arc::new(next);
            changed.push(name.clone());
        }

        changed.sort();
        if !changed.is_empty() {
            info!(storage = %storage.name(), repositories = ?changed, "Storage replaced in repositories");
        }
        changed
    }

    /// Detach a storage from every repository that references it.
    /// Returns the names of the repositories that changed.
    pub fn detach_storage_everywhere(&self, storage_name: &str) -> Vec<String> {
        let mut repositories = self.repositories.write();
        let mut changed = Vec::new();

        for (name, current) in repositories.iter_mut() {
            if !current.storages.iter().any(|s| s.name() == storage_name) {
                continue;
            }
            let mut next = BackupRepository::clone(current);
            next.detach_storage(storage_name);
            *current = Arc::new(next);
            changed.push(name.clone());
        }

        changed.sort();
        if !changed.is_empty() {
            info!(storage = %storage_name, repositories = ?changed, "Storage detached from repositories");
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{LocalConfig, LocalStorage};
    use std::path::Path;
    use tempfile::TempDir;

    fn repo(name: &str) -> BackupRepository {
        BackupRepository::new(name, format!("https://example.com/{}.git", name), Path::new("/data"))
            .unwrap()
    }

    fn local(name: &str, root: &TempDir) -> Arc<dyn StorageBackend> {
        Arc::new(
            LocalStorage::new(&LocalConfig {
                name: name.to_string(),
                root: root.path().to_path_buf(),
                prefix: String::new(),
            })
            .unwrap(),
        )
    }

    #[test]
    fn test_add_get_delete_list() {
        let registry = RepositoryRegistry::new();
        registry.add(repo("beta")).unwrap();
        registry.add(repo("alpha")).unwrap();

        let names: Vec<_> = registry.list().iter().map(|r| r.name.clone()).collect();
        assert_eq!(names, vec!["alpha", "beta"]);
        assert_eq!(registry.get("alpha").unwrap().remote_url, "https://example.com/alpha.git");

        assert!(registry.delete("alpha").is_some());
        assert!(registry.get("alpha").is_none());
        assert!(registry.delete("alpha").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_add_rejected() {
        let registry = RepositoryRegistry::new();
        registry.add(repo("demo")).unwrap();
        let err = registry.add(repo("demo")).unwrap_err();
        assert!(matches!(err, ValidationError::DuplicateName { .. }));
    }

    #[test]
    fn test_update_leaves_old_snapshot_intact() {
        let registry = RepositoryRegistry::new();
        registry.add(repo("demo").with_schedule("5")).unwrap();
        let before = registry.get("demo").unwrap();

        let after = registry
            .update("demo", |r| r.schedule = "10".to_string())
            .unwrap();
        assert_eq!(before.schedule, "5");
        assert_eq!(after.schedule, "10");
        assert_eq!(registry.get("demo").unwrap().schedule, "10");
        assert!(registry.update("ghost", |_| {}).is_none());
    }

    #[test]
    fn test_attach_and_detach_storage() {
        let root = TempDir::new().unwrap();
        let registry = RepositoryRegistry::new();
        registry.add(repo("demo")).unwrap();

        registry.attach_storage("demo", local("disk", &root)).unwrap();
        registry.attach_storage("demo", local("disk", &root)).unwrap();
        assert_eq!(registry.get("demo").unwrap().storage_names(), vec!["disk"]);

        assert!(registry.detach_storage("demo", "disk"));
        assert!(!registry.detach_storage("demo", "disk"));
        assert!(registry.get("demo").unwrap().storages.is_empty());
    }

    #[test]
    fn test_detach_storage_everywhere() {
        let root = TempDir::new().unwrap();
        let registry = RepositoryRegistry::new();
        registry
            .add(repo("a").with_storage(local("shared", &root)).with_storage(local("own", &root)))
            .unwrap();
        registry.add(repo("b").with_storage(local("shared", &root))).unwrap();
        registry.add(repo("c")).unwrap();

        let changed = registry.detach_storage_everywhere("shared");
        assert_eq!(changed, vec!["a", "b"]);
        assert_eq!(registry.get("a").unwrap().storage_names(), vec!["own"]);
        assert!(registry.get("b").unwrap().storages.is_empty());
    }

    #[test]
    fn test_replace_storage_only_touches_bound_repositories() {
        let root = TempDir::new().unwrap();
        let registry = RepositoryRegistry::new();
        registry.add(repo("a").with_storage(local("shared", &root))).unwrap();
        registry.add(repo("b")).unwrap();

        let replacement = local("shared", &root);
        assert_eq!(registry.replace_storage_everywhere(&replacement), vec!["a"]);
        assert!(Arc::ptr_eq(&registry.get("a").unwrap().storages[0], &replacement));
        assert!(registry.get("b").unwrap().storages.is_empty());

        // Once detached, a late replacement must not bring the storage back
        registry.detach_storage_everywhere("shared");
        assert!(registry.replace_storage_everywhere(&local("shared", &root)).is_empty());
        assert!(registry.get("a").unwrap().storages.is_empty());
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let registry = Arc::new(RepositoryRegistry::new());
        registry.add(repo("demo")).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for j in 0..50 {
                        registry.update("demo", |r| {
                            r.schedule = format!("{}", i * 100 + j);
                            r.remote_url.push('x');
                        });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let final_url = &registry.get("demo").unwrap().remote_url;
        assert_eq!(final_url.len(), "https://example.com/demo.git".len() + 400);
    }
}
