// Configuration management with layered configuration (files, env)

use crate::models::{validate_repository_name, RepositoryConfig};
use crate::schedule::parse_timezone;
use crate::storage::StorageConfig;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Root under which each repository's working tree is kept
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,
    /// Base64 AES key used to decrypt secrets in this file
    #[serde(default)]
    pub encryption_key: String,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub webhook: WebhookServerConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    #[serde(default)]
    pub storages: Vec<StorageConfig>,
    #[serde(default)]
    pub repositories: Vec<RepositoryConfig>,
}

fn default_data_path() -> PathBuf {
    PathBuf::from("./data")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// IANA zone cron schedules are evaluated in
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookServerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_seconds: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_shutdown_timeout() -> u64 {
    5
}

impl Default for WebhookServerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_host(),
            port: default_port(),
            shutdown_timeout_seconds: default_shutdown_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default)]
    pub metrics_port: Option<u16>,
    #[serde(default)]
    pub tracing_endpoint: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            metrics_port: None,
            tracing_endpoint: None,
        }
    }
}

impl Settings {
    /// Load configuration with layered precedence: defaults → local → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_layers("config", None)
    }

    /// Load configuration from a specific directory
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        Self::load_layers(config_dir, None)
    }

    /// Load the default layers plus an explicit file, which must exist
    pub fn load_with_file<P: AsRef<Path>>(file: P) -> Result<Self, ConfigError> {
        Self::load_layers("config", Some(file.as_ref()))
    }

    fn load_layers<P: AsRef<Path>>(config_dir: P, file: Option<&Path>) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let mut builder = Config::builder()
            // Start with default configuration
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Add local configuration (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false));

        // Format detected from the extension
        if let Some(file) = file {
            builder = builder.add_source(File::from(file).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if self.encryption_key.trim().is_empty() {
            return Err("Encryption key cannot be empty".to_string());
        }

        if self.data_path.as_os_str().is_empty() {
            return Err("Data path cannot be empty".to_string());
        }

        parse_timezone(&self.scheduler.timezone).map_err(|e| e.to_string())?;

        if self.webhook.enabled && self.webhook.port == 0 {
            return Err("Webhook port must be greater than 0".to_string());
        }

        let mut storage_names = HashSet::new();
        for storage in &self.storages {
            if storage.name().trim().is_empty() {
                return Err("Storage name cannot be empty".to_string());
            }
            if !storage_names.insert(storage.name()) {
                return Err(format!("Duplicate storage name: {}", storage.name()));
            }
        }

        let mut repository_names = HashSet::new();
        for repository in &self.repositories {
            validate_repository_name(&repository.name).map_err(|e| e.to_string())?;
            if !repository_names.insert(repository.name.as_str()) {
                return Err(format!("Duplicate repository name: {}", repository.name));
            }
            if repository.remote_url.trim().is_empty() {
                return Err(format!(
                    "Repository '{}' has an empty remote_url",
                    repository.name
                ));
            }
            if let Some(missing) = repository
                .storages
                .iter()
                .find(|name| !storage_names.contains(name.as_str()))
            {
                return Err(format!(
                    "Repository '{}' references unknown storage '{}'",
                    repository.name, missing
                ));
            }
        }

        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_path: default_data_path(),
            encryption_key: String::new(),
            scheduler: SchedulerConfig::default(),
            webhook: WebhookServerConfig::default(),
            observability: ObservabilityConfig::default(),
            storages: Vec::new(),
            repositories: Vec::new(),
        }
    }
}
