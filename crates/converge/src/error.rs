//! Reconciliation-specific error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during reconciliation.
#[derive(Error, Debug)]
pub enum ConvergeError {
    #[error("Source unavailable for '{repo}': {message}")]
    SourceUnavailable { repo: String, message: String },

    #[error("Failed to render manifests at '{path}': {message}")]
    Render { path: String, message: String },

    #[error("Failed to read manifest file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse YAML in '{path}': {message}")]
    ParseYaml { path: PathBuf, message: String },

    #[error("Duplicate resource '{key}' in manifest set")]
    DuplicateResource { key: String },

    #[error("Conflict applying '{key}': {message}")]
    Conflict { key: String, message: String },

    #[error("Admission rejected for '{key}': {message}")]
    AdmissionRejected { key: String, message: String },

    #[error("Transient cluster API error: {0}")]
    TransientApi(String),

    #[error("Resource not found: {key}")]
    ResourceNotFound { key: String },

    #[error("Application not found: {0}")]
    ApplicationNotFound(String),

    #[error("Application already exists: {0}")]
    ApplicationExists(String),

    #[error("Resource '{key}' is already managed by application '{owner}'")]
    OwnershipConflict { key: String, owner: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Watch error: {0}")]
    Watch(String),

    #[error("Sync cancelled")]
    Cancelled,

    #[error("Wave {wave} failed: {message}")]
    WaveFailed { wave: i64, message: String },
}

impl ConvergeError {
    /// Returns true if the error is likely transient and the operation can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConvergeError::Conflict { .. }
                | ConvergeError::AdmissionRejected { .. }
                | ConvergeError::TransientApi(_)
        )
    }
}

impl From<serde_yaml::Error> for ConvergeError {
    fn from(err: serde_yaml::Error) -> Self {
        ConvergeError::ParseYaml {
            path: PathBuf::new(),
            message: err.to_string(),
        }
    }
}

/// Result type for reconciliation operations.
pub type Result<T> = std::result::Result<T, ConvergeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ConvergeError::TransientApi("timeout".into()).is_retryable());
        assert!(ConvergeError::Conflict {
            key: "Deployment/default/web".into(),
            message: "resource version mismatch".into(),
        }
        .is_retryable());
        assert!(ConvergeError::AdmissionRejected {
            key: "Deployment/default/web".into(),
            message: "webhook unavailable".into(),
        }
        .is_retryable());

        assert!(!ConvergeError::Render {
            path: "apps/web".into(),
            message: "bad yaml".into(),
        }
        .is_retryable());
        assert!(!ConvergeError::Config("missing namespace".into()).is_retryable());
        assert!(!ConvergeError::SourceUnavailable {
            repo: "repo".into(),
            message: "down".into(),
        }
        .is_retryable());
    }
}
