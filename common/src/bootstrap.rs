// Bootstrap utilities for binary initialization
// Turns loaded settings into live registries, the executor and the scheduler.

use crate::cipher::SecurityContext;
use crate::config::Settings;
use crate::errors::{StorageError, ValidationError};
use crate::git::GitAccess;
use crate::models::BackupRepository;
use crate::pipeline::{BackupExecutor, BackupRunner};
use crate::registry::RepositoryRegistry;
use crate::schedule::{parse_timezone, ScheduleSpec};
use crate::scheduler::{BackupScheduler, Scheduler};
use crate::storage::{create_storage, StorageBackend, StorageConfig, StorageRegistry};
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Build the immutable security context from the configured key
pub fn init_security_context(settings: &Settings) -> Result<SecurityContext> {
    SecurityContext::from_base64_key(settings.encryption_key.trim())
        .context("Failed to initialize credential cipher from encryption_key")
}

/// Connect every configured storage. Any unreachable backend aborts startup.
#[tracing::instrument(skip_all)]
pub async fn init_storage_registry(
    settings: &Settings,
    security: &SecurityContext,
) -> Result<Arc<StorageRegistry>> {
    info!(count = settings.storages.len(), "Initializing storages");

    let registry = StorageRegistry::new();
    for config in &settings.storages {
        let storage = create_storage(config, security)
            .await
            .with_context(|| format!("Failed to initialize storage '{}'", config.name()))?;
        registry.add(storage);
    }

    info!(storages = ?registry.names(), "Storages initialized");
    Ok(Arc::new(registry))
}

/// Build runtime repositories from configuration
#[tracing::instrument(skip_all)]
pub fn init_repository_registry(
    settings: &Settings,
    security: &SecurityContext,
    storages: &StorageRegistry,
) -> Result<Arc<RepositoryRegistry>> {
    let registry = RepositoryRegistry::new();
    for config in &settings.repositories {
        let repository =
            BackupRepository::from_config(config, &settings.data_path, security, storages)
                .with_context(|| format!("Invalid repository '{}'", config.name))?;
        registry
            .add(repository)
            .with_context(|| format!("Failed to register repository '{}'", config.name))?;
    }

    info!(count = registry.len(), "Repositories loaded");
    Ok(Arc::new(registry))
}

/// Live backup engine: registries, executor and scheduler wired together
pub struct BackupService {
    storages: Arc<StorageRegistry>,
    repositories: Arc<RepositoryRegistry>,
    executor: Arc<BackupExecutor>,
    scheduler: BackupScheduler,
    security: SecurityContext,
}

impl BackupService {
    /// Wire a service over already-built registries. Nothing is scheduled yet.
    pub fn new(
        storages: Arc<StorageRegistry>,
        repositories: Arc<RepositoryRegistry>,
        git: Arc<dyn GitAccess>,
        timezone: chrono_tz::Tz,
        security: SecurityContext,
    ) -> Self {
        let executor = Arc::new(BackupExecutor::new(Arc::clone(&repositories), git));
        let scheduler = BackupScheduler::new(executor.clone() as Arc<dyn BackupRunner>, timezone);
        Self {
            storages,
            repositories,
            executor,
            scheduler,
            security,
        }
    }

    /// Build the whole engine from settings and install every repository's schedule
    pub async fn from_settings(settings: &Settings, git: Arc<dyn GitAccess>) -> Result<Self> {
        let timezone = parse_timezone(&settings.scheduler.timezone)
            .context("Invalid scheduler timezone")?;
        let security = init_security_context(settings)?;
        let storages = init_storage_registry(settings, &security).await?;
        let repositories = init_repository_registry(settings, &security, &storages)?;

        let service = Self::new(storages, repositories, git, timezone, security);
        service.schedule_all();
        Ok(service)
    }

    pub fn storages(&self) -> &Arc<StorageRegistry> {
        &self.storages
    }

    pub fn repositories(&self) -> &Arc<RepositoryRegistry> {
        &self.repositories
    }

    pub fn scheduler(&self) -> &BackupScheduler {
        &self.scheduler
    }

    pub fn security(&self) -> &SecurityContext {
        &self.security
    }

    /// Runner shared by the scheduler and the webhook listener
    pub fn runner(&self) -> Arc<dyn BackupRunner> {
        self.executor.clone()
    }

    /// Install schedules for every registered repository.
    /// A bad schedule leaves that repository event-driven only.
    pub fn schedule_all(&self) -> usize {
        let mut installed = 0;
        for repository in self.repositories.list() {
            match self.scheduler.schedule_backup(&repository) {
                Ok(true) => installed += 1,
                Ok(false) => {}
                Err(e) => warn!(
                    repository = %repository.name,
                    error = %e,
                    "Repository left without a periodic schedule"
                ),
            }
        }
        installed
    }

    /// Register a new repository and install its schedule.
    /// An unparseable schedule is rejected before anything is registered.
    pub fn add_repository(
        &self,
        repository: BackupRepository,
    ) -> Result<Arc<BackupRepository>, ValidationError> {
        self.check_schedule(&repository)?;
        let repository = self.repositories.add(repository)?;
        self.install_schedule(&repository);
        Ok(repository)
    }

    /// Replace a repository record; the new schedule takes effect immediately.
    /// On an unparseable schedule the previous record and entry stay in place.
    pub fn update_repository(
        &self,
        repository: BackupRepository,
    ) -> Result<Arc<BackupRepository>, ValidationError> {
        self.check_schedule(&repository)?;
        self.repositories.upsert(repository.clone());
        let repository = Arc::new(repository);
        self.install_schedule(&repository);
        Ok(repository)
    }

    fn check_schedule(&self, repository: &BackupRepository) -> Result<(), ValidationError> {
        ScheduleSpec::parse(&repository.schedule, self.scheduler.timezone())
            .map(|_| ())
            .map_err(|source| ValidationError::InvalidSchedule {
                repository: repository.name.clone(),
                source,
            })
    }

    fn install_schedule(&self, repository: &BackupRepository) {
        if let Err(e) = self.scheduler.reschedule_backup(repository) {
            warn!(
                repository = %repository.name,
                error = %e,
                "Repository left without a periodic schedule"
            );
        }
    }

    /// Unschedule then forget a repository. An in-flight run may still finish.
    pub fn remove_repository(&self, name: &str) -> bool {
        let Some(repository) = self.repositories.get(name) else {
            return false;
        };
        self.scheduler.unschedule_backup(&repository);
        self.repositories.delete(name);
        info!(repository = %name, "Repository removed");
        true
    }

    /// Connect and register a storage, replacing any with the same name
    pub async fn add_storage(
        &self,
        config: &StorageConfig,
    ) -> Result<Arc<dyn StorageBackend>, StorageError> {
        let storage = create_storage(config, &self.security).await?;
        if self.storages.add(Arc::clone(&storage)).is_some() {
            self.repositories.replace_storage_everywhere(&storage);
        }
        Ok(storage)
    }

    /// Remove a storage and detach it from every repository that used it
    pub fn remove_storage(&self, name: &str) -> Vec<String> {
        if self.storages.remove(name).is_none() {
            return Vec::new();
        }
        let detached = self.repositories.detach_storage_everywhere(name);
        info!(storage = %name, repositories = ?detached, "Storage removed");
        detached
    }

    /// Download a repository's stored copy into `local_dir`
    pub async fn restore(
        &self,
        repository: &str,
        storage: &str,
        local_dir: &Path,
    ) -> Result<usize> {
        restore_repository(&self.storages, repository, storage, local_dir).await
    }

    pub async fn start(&self) -> Result<()> {
        self.scheduler
            .start()
            .await
            .context("Failed to start scheduler")
    }

    pub async fn stop(&self) -> Result<()> {
        self.scheduler.stop().await.context("Failed to stop scheduler")
    }
}

/// Download `repository`'s namespace from the named storage
#[tracing::instrument(skip(storages))]
pub async fn restore_repository(
    storages: &StorageRegistry,
    repository: &str,
    storage: &str,
    local_dir: &Path,
) -> Result<usize> {
    crate::models::validate_repository_name(repository)?;
    let backend = storages
        .get(storage)
        .with_context(|| format!("Unknown storage '{}'", storage))?;

    let files = backend
        .download_directory(repository, local_dir)
        .await
        .with_context(|| format!("Failed to restore '{}' from '{}'", repository, storage))?;

    info!(files, local_dir = %local_dir.display(), "Repository restored");
    Ok(files)
}
