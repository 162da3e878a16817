//! Error types for the synchronization engine.

use std::path::PathBuf;
use thiserror::Error;

use crate::secrets::SecretError;

/// How an error should be treated by whoever schedules the next cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Terminal until the automation or source spec changes.
    Configuration,
    /// Missing or rejected credentials; retried on the next scheduled cycle.
    Auth,
    /// Network trouble, an exceeded deadline or a push that lost a race
    /// with another writer; retried with backoff.
    Transient,
    /// Bad referenced data (URLs, signing keys); terminal until it changes.
    Data,
    /// Local failures that fit none of the above.
    Internal,
}

/// Errors that can occur while planning, cloning, committing or pushing.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Failed to read file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse YAML in '{path}': {message}")]
    ParseYaml { path: PathBuf, message: String },

    #[error("Invalid API version '{version}', expected '{expected}'")]
    InvalidApiVersion { version: String, expected: String },

    #[error("Duplicate resource {kind} '{name}'")]
    DuplicateName { kind: String, name: String },

    #[error("Config directory not found: {0}")]
    ConfigDirNotFound(PathBuf),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Unsupported source kind '{0}', expected GitRepository")]
    UnsupportedSourceKind(String),

    #[error("Push branch cannot be inferred: {0}")]
    NoPushBranch(String),

    #[error("Secret '{secret}' carries GitHub App credentials but provider is '{provider}'")]
    ProviderMismatch { secret: String, provider: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Secret(#[from] SecretError),

    #[error("Token exchange failed for provider '{provider}': {message}")]
    TokenExchange { provider: String, message: String },

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Git authentication failed: {0}")]
    GitAuthFailed(String),

    #[error("Git network error: {0}")]
    GitNetworkError(String),

    #[error("Git push rejected: {0}")]
    GitPushRejected(String),

    #[error("Git operation timed out after {0}s")]
    GitTimeout(u64),

    #[error("Invalid repository URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Invalid signing key: {0}")]
    SigningKey(String),

    #[error("Failed to decrypt signing key: {0}")]
    SigningKeyDecrypt(String),

    #[error("Reference not found: {0}")]
    ReferenceNotFound(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Invalid push result: {0}")]
    InvalidPushResult(String),

    #[error("Git operation failed: {0}")]
    GitOperation(String),

    #[error("File operation failed: {0}")]
    FileOperation(String),
}

impl From<serde_yaml::Error> for SyncError {
    fn from(err: serde_yaml::Error) -> Self {
        SyncError::ParseYaml {
            path: PathBuf::new(),
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::FileOperation(err.to_string())
    }
}

impl SyncError {
    /// Returns the taxonomy bucket for this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            SyncError::ParseYaml { .. }
            | SyncError::InvalidApiVersion { .. }
            | SyncError::DuplicateName { .. }
            | SyncError::ConfigDirNotFound(_)
            | SyncError::ResourceNotFound { .. }
            | SyncError::UnsupportedSourceKind(_)
            | SyncError::NoPushBranch(_)
            | SyncError::ProviderMismatch { .. }
            | SyncError::InvalidConfig(_)
            | SyncError::ReferenceNotFound(_)
            | SyncError::Template(_) => ErrorCategory::Configuration,
            SyncError::Secret(_)
            | SyncError::TokenExchange { .. }
            | SyncError::AccessDenied(_)
            | SyncError::GitAuthFailed(_) => ErrorCategory::Auth,
            SyncError::GitNetworkError(_)
            | SyncError::GitPushRejected(_)
            | SyncError::GitTimeout(_) => ErrorCategory::Transient,
            SyncError::InvalidUrl { .. }
            | SyncError::SigningKey(_)
            | SyncError::SigningKeyDecrypt(_) => ErrorCategory::Data,
            SyncError::ReadFile { .. }
            | SyncError::InvalidPushResult(_)
            | SyncError::GitOperation(_)
            | SyncError::FileOperation(_) => ErrorCategory::Internal,
        }
    }

    /// Returns true if the error is likely transient and the operation can be retried.
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }
}

/// Classifies a git stderr string into a more specific error variant.
pub fn classify_git_error(stderr: &str) -> SyncError {
    let lower = stderr.to_lowercase();

    // A retried cycle re-clones and commits on top of the new tip
    if lower.contains("[rejected]")
        || lower.contains("non-fast-forward")
        || lower.contains("fetch first")
        || lower.contains("updates were rejected")
    {
        return SyncError::GitPushRejected(stderr.trim().to_string());
    }

    if lower.contains("could not resolve host")
        || lower.contains("connection refused")
        || lower.contains("connection timed out")
        || lower.contains("network is unreachable")
        || lower.contains("failed to connect")
        || lower.contains("couldn't connect to server")
        || lower.contains("the remote end hung up unexpectedly")
    {
        return SyncError::GitNetworkError(stderr.trim().to_string());
    }

    if lower.contains("authentication failed")
        || lower.contains("permission denied")
        || lower.contains("invalid credentials")
        || lower.contains("could not read username")
        || lower.contains("host key verification failed")
    {
        return SyncError::GitAuthFailed(stderr.trim().to_string());
    }

    SyncError::GitOperation(stderr.trim().to_string())
}

/// Classifies a failed `git commit`.
///
/// Only failures that gpg reported count as signing errors when a signing
/// key is configured; everything else goes through [`classify_git_error`].
pub fn classify_commit_error(stderr: &str, signing: bool) -> SyncError {
    let lower = stderr.to_lowercase();
    let gpg_failure = lower.contains("gpg failed to sign")
        || lower.contains("cannot run gpg")
        || lower.contains("gpg:")
        || lower.contains("bad passphrase")
        || lower.contains("no secret key");

    if signing && gpg_failure {
        SyncError::SigningKeyDecrypt(stderr.trim().to_string())
    } else {
        classify_git_error(stderr)
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, SyncError>;
