// S3-compatible object storage backend (AWS S3, MinIO, ...)
// Connection parameters are resolved once and the bucket handle is shared by all uploads.

use super::{
    collect_files, local_path_for_key, object_key, scope_prefix, write_replacing, LocalFile,
    StorageBackend, StorageKind, UploadSummary,
};
use crate::cipher::SecurityContext;
use crate::errors::StorageError;
use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use s3::bucket::Bucket;
use s3::creds::Credentials;
use s3::region::Region;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, instrument};

/// Files uploaded or downloaded in parallel per directory transfer
const TRANSFER_CONCURRENCY: usize = 8;

/// S3 storage definition. `access_key` and `secret_key` are encrypted at rest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    pub name: String,
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,
    /// Optional root prefix inside the bucket
    #[serde(default)]
    pub prefix: String,
    #[serde(default = "default_path_style")]
    pub path_style: bool,
}

fn default_path_style() -> bool {
    true
}

/// S3 storage backend
#[derive(Clone, Debug)]
pub struct S3Storage {
    name: String,
    prefix: String,
    bucket: Arc<Bucket>,
}

impl S3Storage {
    /// Create the backend and verify the bucket is reachable
    #[instrument(skip(config, security), fields(storage = %config.name, endpoint = %config.endpoint, bucket = %config.bucket))]
    pub async fn connect(
        config: &S3Config,
        security: &SecurityContext,
    ) -> Result<Self, StorageError> {
        let storage = Self::new(config, security)?;
        storage.health_check().await?;
        Ok(storage)
    }

    /// Create the backend without contacting the endpoint
    pub fn new(config: &S3Config, security: &SecurityContext) -> Result<Self, StorageError> {
        info!("Initializing S3 storage");

        if config.bucket.trim().is_empty() {
            return Err(StorageError::InvalidConfiguration(format!(
                "Storage '{}' has no bucket",
                config.name
            )));
        }
        if config.endpoint.trim().is_empty() {
            return Err(StorageError::InvalidConfiguration(format!(
                "Storage '{}' has no endpoint",
                config.name
            )));
        }

        let access_key = security.decrypt_secret(&config.access_key)?;
        let secret_key = security.decrypt_secret(&config.secret_key)?;

        // Empty keys fall back to anonymous access
        let credentials = if access_key.is_empty() && secret_key.is_empty() {
            Credentials::anonymous()
        } else {
            Credentials::new(Some(&access_key), Some(&secret_key), None, None, None)
        }
        .map_err(|e| {
            error!(error = %e, "Failed to create S3 credentials");
            StorageError::S3Error(format!("Failed to create credentials: {}", e))
        })?;

        let region = Region::Custom {
            region: config.region.clone(),
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
        };

        let bucket = Bucket::new(&config.bucket, region, credentials).map_err(|e| {
            error!(error = %e, "Failed to create S3 bucket handle");
            StorageError::S3Error(format!("Failed to create bucket: {}", e))
        })?;
        let bucket: Arc<Bucket> = if config.path_style {
            Arc::from(bucket.with_path_style())
        } else {
            Arc::from(bucket)
        };

        Ok(Self {
            name: config.name.clone(),
            prefix: config.prefix.trim_matches('/').to_string(),
            bucket,
        })
    }

    /// Verify connectivity by listing the top level of the storage root
    #[instrument(skip(self), fields(storage = %self.name))]
    pub async fn health_check(&self) -> Result<(), StorageError> {
        debug!("Performing S3 health check");

        match self
            .bucket
            .list(scope_prefix(&self.prefix, ""), Some("/".to_string()))
            .await
        {
            Ok(_) => {
                debug!("S3 health check passed");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "S3 health check failed");
                Err(StorageError::S3Error(format!(
                    "Health check failed for storage '{}': {}",
                    self.name, e
                )))
            }
        }
    }

    async fn put_file(&self, scope: &str, file: LocalFile) -> Result<u64, StorageError> {
        let key = object_key(&[&self.prefix, scope, &file.relative_key]);
        let data = tokio::fs::read(&file.path).await.map_err(|e| {
            StorageError::FileSystemError(format!("Failed to read '{}': {}", file.path.display(), e))
        })?;

        let response = self.bucket.put_object(&key, &data).await.map_err(|e| {
            error!(error = %e, key = %key, "Failed to store object");
            StorageError::S3Error(format!("Failed to put object '{}': {}", key, e))
        })?;
        check_status(&key, response.status_code())?;

        debug!(key = %key, size = data.len(), "Object stored");
        Ok(data.len() as u64)
    }

    async fn get_file(&self, key: String, relative: String, local_dir: &Path) -> Result<(), StorageError> {
        let target = local_path_for_key(local_dir, &relative)?;

        let response = self.bucket.get_object(&key).await.map_err(|e| {
            error!(error = %e, key = %key, "Failed to retrieve object");
            StorageError::S3Error(format!("Failed to get object '{}': {}", key, e))
        })?;
        check_status(&key, response.status_code())?;

        write_replacing(&target, response.bytes()).await?;

        debug!(key = %key, path = %target.display(), "Object downloaded");
        Ok(())
    }

    /// List every key under a prefix. The client follows continuation tokens.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let pages = self
            .bucket
            .list(prefix.to_string(), None)
            .await
            .map_err(|e| {
                error!(error = %e, prefix = %prefix, "Failed to list objects");
                StorageError::S3Error(format!(
                    "Failed to list objects with prefix '{}': {}",
                    prefix, e
                ))
            })?;

        Ok(pages
            .into_iter()
            .flat_map(|page| page.contents.into_iter().map(|object| object.key))
            .filter(|key| !key.ends_with('/'))
            .collect())
    }
}

fn check_status(key: &str, status: u16) -> Result<(), StorageError> {
    match status {
        200..=299 => Ok(()),
        404 => Err(StorageError::NotFound(key.to_string())),
        status => Err(StorageError::UnexpectedStatus {
            key: key.to_string(),
            status,
        }),
    }
}

#[async_trait]
impl StorageBackend for S3Storage {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StorageKind {
        StorageKind::S3
    }

    #[instrument(skip(self, local_dir), fields(storage = %self.name, scope = %scope))]
    async fn upload_directory(
        &self,
        scope: &str,
        local_dir: &Path,
    ) -> Result<UploadSummary, StorageError> {
        let files = collect_files(local_dir).await?;
        info!(files = files.len(), "Uploading directory to S3");

        let summary = stream::iter(files)
            .map(|file| self.put_file(scope, file))
            .buffer_unordered(TRANSFER_CONCURRENCY)
            .try_fold(UploadSummary::default(), |mut acc, bytes| async move {
                acc.files += 1;
                acc.bytes += bytes;
                Ok(acc)
            })
            .await?;

        info!(files = summary.files, bytes = summary.bytes, "Directory uploaded to S3");
        Ok(summary)
    }

    #[instrument(skip(self, local_dir), fields(storage = %self.name, scope = %scope))]
    async fn download_directory(
        &self,
        scope: &str,
        local_dir: &Path,
    ) -> Result<usize, StorageError> {
        let prefix = scope_prefix(&self.prefix, scope);
        let keys = self.list_keys(&prefix).await?;
        if keys.is_empty() {
            return Err(StorageError::NotFound(format!(
                "No objects under '{}' in storage '{}'",
                prefix, self.name
            )));
        }

        tokio::fs::create_dir_all(local_dir).await?;
        let count = keys.len();
        stream::iter(keys)
            .map(|key| {
                let relative = key[prefix.len()..].to_string();
                self.get_file(key, relative, local_dir)
            })
            .buffer_unordered(TRANSFER_CONCURRENCY)
            .try_collect::<Vec<()>>()
            .await?;

        info!(files = count, path = %local_dir.display(), "Directory downloaded from S3");
        Ok(count)
    }
}
