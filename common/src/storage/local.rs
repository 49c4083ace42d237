// Filesystem storage backend
// Mirrors the object layout onto a directory tree, useful for NAS mounts and tests.

use super::{
    collect_files, copy_replacing, local_path_for_key, object_key, StorageBackend, StorageKind,
    UploadSummary,
};
use crate::errors::StorageError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    pub name: String,
    pub root: PathBuf,
    #[serde(default)]
    pub prefix: String,
}

/// Storage backend writing objects as plain files under `root/prefix`
#[derive(Debug, Clone)]
pub struct LocalStorage {
    name: String,
    base: PathBuf,
}

impl LocalStorage {
    /// Create the backend, creating the root directory if needed
    pub fn new(config: &LocalConfig) -> Result<Self, StorageError> {
        if config.root.as_os_str().is_empty() {
            return Err(StorageError::InvalidConfiguration(format!(
                "Storage '{}' has no root directory",
                config.name
            )));
        }

        let prefix = object_key(&[&config.prefix]);
        let base = if prefix.is_empty() {
            config.root.clone()
        } else {
            local_path_for_key(&config.root, &prefix)?
        };

        std::fs::create_dir_all(&base).map_err(|e| {
            StorageError::FileSystemError(format!(
                "Failed to create storage root '{}': {}",
                base.display(),
                e
            ))
        })?;

        info!(storage = %config.name, root = %base.display(), "Local storage initialized");
        Ok(Self {
            name: config.name.clone(),
            base,
        })
    }

    fn scope_dir(&self, scope: &str) -> Result<PathBuf, StorageError> {
        local_path_for_key(&self.base, &object_key(&[scope]))
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StorageKind {
        StorageKind::Local
    }

    #[instrument(skip(self, local_dir), fields(storage = %self.name, scope = %scope))]
    async fn upload_directory(
        &self,
        scope: &str,
        local_dir: &Path,
    ) -> Result<UploadSummary, StorageError> {
        let target_root = self.scope_dir(scope)?;
        let files = collect_files(local_dir).await?;

        let mut summary = UploadSummary::default();
        for file in files {
            let target = local_path_for_key(&target_root, &file.relative_key)?;
            let bytes = copy_replacing(&file.path, &target).await?;
            debug!(key = %file.relative_key, bytes, "File stored");

            summary.files += 1;
            summary.bytes += bytes;
        }

        info!(files = summary.files, bytes = summary.bytes, "Directory stored locally");
        Ok(summary)
    }

    #[instrument(skip(self, local_dir), fields(storage = %self.name, scope = %scope))]
    async fn download_directory(
        &self,
        scope: &str,
        local_dir: &Path,
    ) -> Result<usize, StorageError> {
        let source_root = self.scope_dir(scope)?;
        let files = match collect_files(&source_root).await {
            Ok(files) if !files.is_empty() => files,
            Ok(_) | Err(StorageError::NotFound(_)) => {
                return Err(StorageError::NotFound(format!(
                    "No objects under '{}' in storage '{}'",
                    scope, self.name
                )))
            }
            Err(e) => return Err(e),
        };

        tokio::fs::create_dir_all(local_dir).await?;
        for file in &files {
            let target = local_path_for_key(local_dir, &file.relative_key)?;
            copy_replacing(&file.path, &target).await?;
        }

        info!(files = files.len(), path = %local_dir.display(), "Directory restored from local storage");
        Ok(files.len())
    }
}
