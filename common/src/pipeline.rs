// Backup execution pipeline: pull, then replicate the working tree to every storage
//
// `BackupPipeline` runs one repository snapshot. `BackupExecutor` is what triggers
// call: it resolves the repository from the registry at trigger time, serializes
// runs per repository and records metrics.

use crate::errors::{PipelineError, StorageFailure};
use crate::git::{GitAccess, PullOutcome};
use crate::models::{BackupRepository, TriggerSource};
use crate::registry::RepositoryRegistry;
use crate::storage::UploadSummary;
use crate::telemetry;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, instrument, warn, Instrument};
use uuid::Uuid;

/// One successful storage upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageUpload {
    pub storage: String,
    pub summary: UploadSummary,
}

/// Outcome of a successful pipeline run
#[derive(Debug, Clone)]
pub struct BackupReport {
    pub repository: String,
    pub pull: PullOutcome,
    pub uploads: Vec<StorageUpload>,
    pub duration: Duration,
}

/// Pull-then-replicate for a single repository snapshot
#[derive(Clone)]
pub struct BackupPipeline {
    git: Arc<dyn GitAccess>,
}

impl BackupPipeline {
    pub fn new(git: Arc<dyn GitAccess>) -> Self {
        Self { git }
    }

    /// Pull the repository, then upload its working tree to each attached storage.
    ///
    /// A failed pull skips every upload. A failed upload does not stop the
    /// remaining storages; the error lists every storage that failed.
    #[instrument(skip(self, repository), fields(repository = %repository.name, storages = repository.storages.len()))]
    pub async fn backup_and_upload(
        &self,
        repository: &BackupRepository,
    ) -> Result<BackupReport, PipelineError> {
        let started = Instant::now();

        let pull = self
            .git
            .pull(repository)
            .await
            .map_err(|source| PipelineError::Pull {
                repository: repository.name.clone(),
                source,
            })?;

        let mut uploads = Vec::with_capacity(repository.storages.len());
        let mut failures = Vec::new();

        for storage in &repository.storages {
            match storage
                .upload_directory(&repository.name, &repository.local_path)
                .await
            {
                Ok(summary) => {
                    info!(
                        storage = %storage.name(),
                        files = summary.files,
                        bytes = summary.bytes,
                        "Upload completed"
                    );
                    uploads.push(StorageUpload {
                        storage: storage.name().to_string(),
                        summary,
                    });
                }
                Err(e) => {
                    error!(storage = %storage.name(), error = %e, "Upload failed");
                    telemetry::record_storage_upload_failure(&repository.name, storage.name());
                    failures.push(StorageFailure {
                        storage: storage.name().to_string(),
                        error: e,
                    });
                }
            }
        }

        if !failures.is_empty() {
            return Err(PipelineError::Replication {
                repository: repository.name.clone(),
                failures,
            });
        }

        Ok(BackupReport {
            repository: repository.name.clone(),
            pull,
            uploads,
            duration: started.elapsed(),
        })
    }
}

/// Entry point used by schedule ticks and webhook triggers
#[async_trait]
pub trait BackupRunner: Send + Sync {
    /// Run the pipeline for the repository currently registered under `repository`
    async fn run_backup(
        &self,
        repository: &str,
        trigger: TriggerSource,
    ) -> Result<BackupReport, PipelineError>;
}

/// Registry-backed runner with per-repository single-flight
pub struct BackupExecutor {
    registry: Arc<RepositoryRegistry>,
    pipeline: BackupPipeline,
    in_flight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    consecutive_failures: Mutex<HashMap<String, u32>>,
}

impl BackupExecutor {
    pub fn new(registry: Arc<RepositoryRegistry>, git: Arc<dyn GitAccess>) -> Self {
        Self {
            registry,
            pipeline: BackupPipeline::new(git),
            in_flight: Mutex::new(HashMap::new()),
            consecutive_failures: Mutex::new(HashMap::new()),
        }
    }

    fn run_lock(&self, repository: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut in_flight = self.in_flight.lock();
        Arc::clone(in_flight.entry(repository.to_string()).or_default())
    }

    /// Drop the per-name lock once nobody else holds or waits on it
    fn release_run_lock(&self, repository: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut in_flight = self.in_flight.lock();
        if Arc::strong_count(&lock) == 2 {
            in_flight.remove(repository);
        }
    }

    fn record_outcome(&self, repository: &str, failed: bool) -> u32 {
        let mut failures = self.consecutive_failures.lock();
        if failed {
            let count = failures.entry(repository.to_string()).or_insert(0);
            *count += 1;
            *count
        } else {
            failures.remove(repository);
            0
        }
    }

    async fn run_serialized(&self, repository: &str) -> Result<BackupReport, PipelineError> {
        let lock = self.run_lock(repository);
        let result = {
            let _guard = lock.lock().await;

            // Resolved after the guard so a queued run sees the latest record
            match self.registry.get(repository) {
                Some(snapshot) => self.pipeline.backup_and_upload(&snapshot).await,
                None => Err(PipelineError::RepositoryNotFound(repository.to_string())),
            }
        };
        self.release_run_lock(repository, lock);
        result
    }
}

#[async_trait]
impl BackupRunner for BackupExecutor {
    async fn run_backup(
        &self,
        repository: &str,
        trigger: TriggerSource,
    ) -> Result<BackupReport, PipelineError> {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("backup_run", repository = %repository, trigger = %trigger, run_id = %run_id);

        async move {
            info!("Backup started");
            let started = Instant::now();
            let result = self.run_serialized(repository).await;
            telemetry::record_backup_duration(repository, started.elapsed().as_secs_f64());

            match &result {
                Ok(report) => {
                    self.record_outcome(repository, false);
                    telemetry::record_backup_success(repository, trigger.as_str());
                    info!(
                        pull = %report.pull,
                        storages = report.uploads.len(),
                        duration_ms = report.duration.as_millis() as u64,
                        "Backup completed"
                    );
                }
                Err(e) => {
                    let consecutive = self.record_outcome(repository, true);
                    telemetry::record_backup_failure(repository, trigger.as_str(), e.reason());
                    error!(error = %e, failed_storages = ?e.failed_storages(), "Backup failed");
                    if telemetry::should_trigger_alert(consecutive) {
                        warn!(
                            consecutive_failures = consecutive,
                            alert_type = "consecutive_failures",
                            "ALERT: backup has failed {} consecutive times",
                            consecutive
                        );
                    }
                }
            }
            result
        }
        .instrument(span)
        .await
    }
}
