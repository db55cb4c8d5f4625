//! Error types for asset publishing
//!
//! ## Table of Contents
//! - **PublishError**: Main error enum covering all failure modes
//! - **Result**: Type alias for `Result<T, PublishError>`

use thiserror::Error;

/// Result type alias for publish operations
pub type Result<T> = std::result::Result<T, PublishError>;

/// Main error type for publish operations
#[derive(Error, Debug)]
pub enum PublishError {
    /// Missing required path or variable; raised before any work starts
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An optional upstream artifact is absent
    #[error("input missing: {0}")]
    InputMissing(String),

    /// A planned input layer vanished or could not be composed
    #[error("composition error: {0}")]
    Composition(String),

    /// Exporter, reduction, conversion or service failure
    #[error("external tool error: {0}")]
    ExternalTool(String),

    /// Remote enqueue failed; `submitted` holds the jobs already accepted upstream
    #[error("submission error: {message} (already submitted: [{}])", submitted.join(", "))]
    Submission {
        /// Failure description
        message: String,
        /// Farm job ids accepted before the failure
        submitted: Vec<String>,
    },

    /// Generic IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PublishError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create an input-missing error
    pub fn input_missing(msg: impl Into<String>) -> Self {
        Self::InputMissing(msg.into())
    }

    /// Create a composition error
    pub fn composition(msg: impl Into<String>) -> Self {
        Self::Composition(msg.into())
    }

    /// Create an external tool error
    pub fn external(msg: impl Into<String>) -> Self {
        Self::ExternalTool(msg.into())
    }

    /// Create a submission error carrying the ids accepted so far
    pub fn submission(msg: impl Into<String>, submitted: Vec<String>) -> Self {
        Self::Submission {
            message: msg.into(),
            submitted,
        }
    }

    /// Whether the failing unit may be retried after cleanup
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ExternalTool(_))
    }

    /// Whether the failure is absorbed by omitting the feature
    pub fn is_absorbed(&self) -> bool {
        matches!(self, Self::InputMissing(_))
    }
}

impl From<reqwest::Error> for PublishError {
    fn from(err: reqwest::Error) -> Self {
        Self::ExternalTool(err.to_string())
    }
}

impl From<toml::de::Error> for PublishError {
    fn from(err: toml::de::Error) -> Self {
        Self::Configuration(err.to_string())
    }
}

impl From<tempfile::PersistError> for PublishError {
    fn from(err: tempfile::PersistError) -> Self {
        Self::Io(err.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submission_lists_accepted_jobs() {
        let err = PublishError::submission("farm refused job", vec!["a1".into(), "b2".into()]);
        assert_eq!(
            err.to_string(),
            "submission error: farm refused job (already submitted: [a1, b2])"
        );
    }

    #[test]
    fn test_retry_classification() {
        assert!(PublishError::external("exporter crashed").is_retryable());
        assert!(!PublishError::composition("layer gone").is_retryable());
        assert!(PublishError::input_missing("proxy").is_absorbed());
    }
}
