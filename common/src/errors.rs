// Error handling framework
// One enum per concern; binaries wrap these with anyhow at the edges.

use thiserror::Error;

/// Validation errors raised while building repositories and storages
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid field value for {field}: {reason}")]
    InvalidFieldValue { field: String, reason: String },

    #[error("Duplicate {kind} name: {name}")]
    DuplicateName { kind: String, name: String },

    #[error("Unknown {kind} referenced: {name}")]
    UnknownReference { kind: String, name: String },

    #[error("Invalid schedule for repository '{repository}': {source}")]
    InvalidSchedule {
        repository: String,
        #[source]
        source: ScheduleError,
    },
}

/// Schedule-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    #[error("Invalid pull interval '{0}': must be a positive number of minutes")]
    InvalidInterval(String),

    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("No next execution time available for {schedule_type} schedule")]
    NoNextExecution { schedule_type: String },

    #[error("Scheduler has been stopped")]
    SchedulerStopped,
}

/// Credential cipher errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CipherError {
    #[error("Invalid encryption key length {0}: expected 16, 24 or 32 bytes")]
    InvalidKeyLength(usize),

    #[error("Invalid base64 encoding: {0}")]
    InvalidEncoding(String),

    #[error("Malformed ciphertext: {0}")]
    Malformed(String),

    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: wrong key or corrupted ciphertext")]
    DecryptionFailed,

    #[error("Decrypted value is not valid UTF-8")]
    InvalidUtf8,
}

/// Git access errors
#[derive(Error, Debug)]
pub enum GitError {
    #[error("Failed to open repository at '{path}': {reason}")]
    OpenFailed { path: String, reason: String },

    #[error("Failed to clone repository from '{url}': {reason}")]
    CloneFailed { url: String, reason: String },

    #[error("Failed to fetch from remote '{remote}': {reason}")]
    FetchFailed { remote: String, reason: String },

    #[error("Failed to update working tree: {0}")]
    MergeFailed(String),

    #[error("Local branch '{branch}' has diverged from its remote; refusing non fast-forward pull")]
    NonFastForward { branch: String },

    #[error("Repository HEAD is not on a branch")]
    DetachedHead,

    #[error("Git task failed: {0}")]
    TaskFailed(String),
}

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("S3 error: {0}")]
    S3Error(String),

    #[error("Filesystem error: {0}")]
    FileSystemError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid storage configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Unexpected status {status} for object '{key}'")]
    UnexpectedStatus { key: String, status: u16 },

    #[error("Credential error: {0}")]
    Credentials(#[from] CipherError),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::FileSystemError(err.to_string())
    }
}

/// One storage that failed during replication
#[derive(Error, Debug)]
#[error("{storage}: {error}")]
pub struct StorageFailure {
    pub storage: String,
    #[source]
    pub error: StorageError,
}

/// Backup pipeline errors
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Repository not found: {0}")]
    RepositoryNotFound(String),

    #[error("Pull failed for repository '{repository}': {source}")]
    Pull {
        repository: String,
        #[source]
        source: GitError,
    },

    #[error(
        "Replication failed for repository '{repository}' on {} storage(s): {}",
        .failures.len(),
        .failures.iter().map(|f| f.to_string()).collect::<Vec<_>>().join("; ")
    )]
    Replication {
        repository: String,
        failures: Vec<StorageFailure>,
    },
}

impl PipelineError {
    /// Names of the storages that failed, empty for pull failures
    pub fn failed_storages(&self) -> Vec<&str> {
        match self {
            PipelineError::RepositoryNotFound(_) | PipelineError::Pull { .. } => Vec::new(),
            PipelineError::Replication { failures, .. } => {
                failures.iter().map(|f| f.storage.as_str()).collect()
            }
        }
    }

    /// Short label used for metrics
    pub fn reason(&self) -> &'static str {
        match self {
            PipelineError::RepositoryNotFound(_) => "not_found",
            PipelineError::Pull { .. } => "pull",
            PipelineError::Replication { .. } => "replication",
        }
    }
}

/// Webhook errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WebhookError {
    #[error("Repository not found: {0}")]
    RepositoryNotFound(String),

    #[error("Webhook not configured for repository: {0}")]
    NotConfigured(String),

    #[error("Missing header: {0}")]
    MissingHeader(String),

    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("Invalid webhook secret: {0}")]
    InvalidSecret(String),
}

/// API response error type for HTTP responses
#[derive(Debug, serde::Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<WebhookError> for ApiError {
    fn from(err: WebhookError) -> Self {
        let code = match err {
            WebhookError::InvalidSignature | WebhookError::MissingHeader(_) => "UNAUTHORIZED",
            WebhookError::RepositoryNotFound(_) | WebhookError::NotConfigured(_) => "NOT_FOUND",
            WebhookError::InvalidSecret(_) => "WEBHOOK_ERROR",
        };
        ApiError::new(code, err.to_string())
    }
}
