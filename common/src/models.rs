use crate::cipher::SecurityContext;
use crate::errors::ValidationError;
use crate::storage::{StorageBackend, StorageRegistry};
use crate::webhook::WebhookConfig;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

lazy_static! {
    static ref REPOSITORY_NAME: Regex = Regex::new(r"^[A-Za-z0-9_-]+$").expect("static regex");
}

/// Validate a repository name. Names double as registry keys and storage prefixes.
pub fn validate_repository_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::MissingField("name".to_string()));
    }
    if !REPOSITORY_NAME.is_match(name) {
        return Err(ValidationError::InvalidFieldValue {
            field: "name".to_string(),
            reason: "must consist of alphanumeric characters, hyphens, and underscores only"
                .to_string(),
        });
    }
    Ok(())
}

// ============================================================================
// Repository Models
// ============================================================================

/// Git credentials. Either username/password, an SSH key path, or nothing.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub key_path: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &if self.password.is_empty() { "" } else { "***" })
            .field("key_path", &self.key_path)
            .finish()
    }
}

/// Persisted form of a repository, as it appears in configuration.
/// The password is encrypted and storages are referenced by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub name: String,
    pub remote_url: String,
    /// Minutes between pulls, a cron expression, or empty for event-driven only
    #[serde(default)]
    pub schedule: String,
    #[serde(default)]
    pub credentials: Credentials,
    #[serde(default)]
    pub storages: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookConfig>,
}

/// Runtime form of a repository: credentials decrypted, storages resolved to live backends.
#[derive(Clone)]
pub struct BackupRepository {
    pub name: String,
    pub remote_url: String,
    pub local_path: PathBuf,
    pub schedule: String,
    pub credentials: Credentials,
    pub storages: Vec<Arc<dyn StorageBackend>>,
    pub webhook: Option<WebhookConfig>,
}

impl BackupRepository {
    /// Create a repository whose working tree lives under `data_path/name`
    pub fn new(
        name: impl Into<String>,
        remote_url: impl Into<String>,
        data_path: &Path,
    ) -> Result<Self, ValidationError> {
        let name = name.into();
        validate_repository_name(&name)?;

        let remote_url = remote_url.into();
        if remote_url.trim().is_empty() {
            return Err(ValidationError::MissingField("remote_url".to_string()));
        }

        Ok(Self {
            local_path: data_path.join(&name),
            name,
            remote_url,
            schedule: String::new(),
            credentials: Credentials::default(),
            storages: Vec::new(),
            webhook: None,
        })
    }

    pub fn with_schedule(mut self, schedule: impl Into<String>) -> Self {
        self.schedule = schedule.into();
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn StorageBackend>) -> Self {
        self.attach_storage(storage);
        self
    }

    pub fn with_webhook(mut self, webhook: WebhookConfig) -> Self {
        self.webhook = Some(webhook);
        self
    }

    /// Attach a storage, replacing any existing binding with the same name
    pub fn attach_storage(&mut self, storage: Arc<dyn StorageBackend>) {
        match self.storages.iter_mut().find(|s| s.name() == storage.name()) {
            Some(existing) => *existing = storage,
            None => self.storages.push(storage),
        }
    }

    /// Detach a storage by name, returning whether it was attached
    pub fn detach_storage(&mut self, storage_name: &str) -> bool {
        let before = self.storages.len();
        self.storages.retain(|s| s.name() != storage_name);
        self.storages.len() != before
    }

    pub fn storage_names(&self) -> Vec<String> {
        self.storages.iter().map(|s| s.name().to_string()).collect()
    }

    /// Build the runtime repository from its persisted form.
    /// Decrypts the git password once and resolves storage names.
    pub fn from_config(
        config: &RepositoryConfig,
        data_path: &Path,
        security: &SecurityContext,
        storages: &StorageRegistry,
    ) -> Result<Self, ValidationError> {
        let mut credentials = config.credentials.clone();
        credentials.password = security
            .decrypt_secret(&credentials.password)
            .map_err(|e| ValidationError::InvalidFieldValue {
                field: format!("repositories.{}.credentials.password", config.name),
                reason: e.to_string(),
            })?;

        let mut repository = Self::new(&config.name, &config.remote_url, data_path)?
            .with_schedule(config.schedule.trim())
            .with_credentials(credentials);

        if let Some(webhook) = &config.webhook {
            let mut webhook = webhook.clone();
            webhook.secret = security.decrypt_secret(&webhook.secret).map_err(|e| {
                ValidationError::InvalidFieldValue {
                    field: format!("repositories.{}.webhook.secret", config.name),
                    reason: e.to_string(),
                }
            })?;
            repository.webhook = Some(webhook);
        }

        for storage_name in &config.storages {
            let storage =
                storages
                    .get(storage_name)
                    .ok_or_else(|| ValidationError::UnknownReference {
                        kind: "storage".to_string(),
                        name: storage_name.clone(),
                    })?;
            repository.attach_storage(storage);
        }

        Ok(repository)
    }
}

impl fmt::Debug for BackupRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupRepository")
            .field("name", &self.name)
            .field("remote_url", &self.remote_url)
            .field("local_path", &self.local_path)
            .field("schedule", &self.schedule)
            .field("credentials", &self.credentials)
            .field("storages", &self.storage_names())
            .field("webhook", &self.webhook.as_ref().map(|w| w.vendor))
            .finish()
    }
}

/// What caused a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerSource {
    Scheduled,
    Webhook,
    Manual,
}

impl TriggerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerSource::Scheduled => "scheduled",
            TriggerSource::Webhook => "webhook",
            TriggerSource::Manual => "manual",
        }
    }
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
