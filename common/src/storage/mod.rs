// Storage backends that mirror a working tree as a set of keyed objects
//
// Every backend stores files under `[prefix/]scope/relative/path`, where the scope
// is the repository name. Directories are never stored on their own; they are
// implied by key prefixes and recreated on download.

pub mod local;
pub mod registry;
pub mod s3_bucket;

pub use local::{LocalConfig, LocalStorage};
pub use registry::StorageRegistry;
pub use s3_bucket::{S3Config, S3Storage};

use crate::cipher::SecurityContext;
use crate::errors::StorageError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Closed set of storage kinds, selected by the `type` discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    S3,
    Local,
}

impl StorageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageKind::S3 => "s3",
            StorageKind::Local => "local",
        }
    }
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a directory upload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadSummary {
    pub files: usize,
    pub bytes: u64,
}

/// Directory-level capability shared by every backend.
/// Implementations must be safe to use from many repositories at once.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> StorageKind;

    /// Upload every regular file under `local_dir`, keyed by its path relative to
    /// `local_dir` and namespaced by `scope`. Existing objects are overwritten.
    async fn upload_directory(
        &self,
        scope: &str,
        local_dir: &Path,
    ) -> Result<UploadSummary, StorageError>;

    /// Download every object under `scope` into `local_dir`, recreating
    /// subdirectories. Returns the number of files written.
    async fn download_directory(&self, scope: &str, local_dir: &Path)
        -> Result<usize, StorageError>;
}

/// Persisted storage definition, tagged by backend type
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    S3(S3Config),
    Local(LocalConfig),
}

impl StorageConfig {
    pub fn name(&self) -> &str {
        match self {
            StorageConfig::S3(c) => &c.name,
            StorageConfig::Local(c) => &c.name,
        }
    }

    pub fn kind(&self) -> StorageKind {
        match self {
            StorageConfig::S3(_) => StorageKind::S3,
            StorageConfig::Local(_) => StorageKind::Local,
        }
    }
}

/// Construct a live backend from its persisted definition.
/// Secrets are decrypted here, once; S3 backends probe the bucket before returning.
#[instrument(skip(config, security), fields(storage = %config.name(), kind = %config.kind()))]
pub async fn create_storage(
    config: &StorageConfig,
    security: &SecurityContext,
) -> Result<Arc<dyn StorageBackend>, StorageError> {
    let storage: Arc<dyn StorageBackend> = match config {
        StorageConfig::S3(c) => Arc::new(S3Storage::connect(c, security).await?),
        StorageConfig::Local(c) => Arc::new(LocalStorage::new(c)?),
    };
    info!("Storage backend ready");
    Ok(storage)
}

// ============================================================================
// Key helpers
// ============================================================================

/// Join key segments with `/`, dropping empty segments and stray slashes
pub fn object_key(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| p.trim_matches('/'))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Key prefix for everything stored under a scope, with a trailing `/`
pub fn scope_prefix(prefix: &str, scope: &str) -> String {
    let base = object_key(&[prefix, scope]);
    if base.is_empty() {
        base
    } else {
        format!("{}/", base)
    }
}

/// A file found under an upload root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    pub path: PathBuf,
    /// Path relative to the upload root, `/` separated
    pub relative_key: String,
}

/// Recursively list regular files under `root`. Symlinks are not followed.
pub async fn collect_files(root: &Path) -> Result<Vec<LocalFile>, StorageError> {
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || collect_files_blocking(&root))
        .await
        .map_err(|e| StorageError::FileSystemError(format!("Directory walk task failed: {}", e)))?
}

fn collect_files_blocking(root: &Path) -> Result<Vec<LocalFile>, StorageError> {
    if !root.is_dir() {
        return Err(StorageError::NotFound(format!(
            "Directory '{}' does not exist",
            root.display()
        )));
    }

    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| {
            StorageError::FileSystemError(format!("Failed to walk '{}': {}", root.display(), e))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }

        let relative = entry.path().strip_prefix(root).map_err(|e| {
            StorageError::FileSystemError(format!(
                "Path '{}' escapes upload root: {}",
                entry.path().display(),
                e
            ))
        })?;
        let Some(segments) = relative
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<Vec<_>>>()
        else {
            warn!(path = %entry.path().display(), "Skipping file with a non UTF-8 name");
            continue;
        };
        let relative_key = segments.join("/");

        files.push(LocalFile {
            path: entry.path().to_path_buf(),
            relative_key,
        });
    }

    files.sort_by(|a, b| a.relative_key.cmp(&b.relative_key));
    Ok(files)
}

/// Turn a stored relative key back into a path under `local_dir`.
/// Keys that would escape the target directory are rejected.
pub fn local_path_for_key(local_dir: &Path, relative_key: &str) -> Result<PathBuf, StorageError> {
    let relative = Path::new(relative_key);
    let escapes = relative.components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });
    if relative_key.is_empty() || escapes {
        return Err(StorageError::InvalidConfiguration(format!(
            "Refusing to write object key '{}' outside '{}'",
            relative_key,
            local_dir.display()
        )));
    }
    Ok(local_dir.join(relative))
}

/// Remove `target` if present so read-only files (git objects) can be replaced
async fn clear_target(target: &Path) -> Result<(), StorageError> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    match tokio::fs::remove_file(target).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Copy `source` to `target`, replacing any existing file
pub async fn copy_replacing(source: &Path, target: &Path) -> Result<u64, StorageError> {
    clear_target(target).await?;
    Ok(tokio::fs::copy(source, target).await?)
}

/// Write `contents` to `target`, replacing any existing file
pub async fn write_replacing(target: &Path, contents: &[u8]) -> Result<(), StorageError> {
    clear_target(target).await?;
    Ok(tokio::fs::write(target, contents).await?)
}
