//! Error types for the fabric operator

use thiserror::Error;

use crate::controller::resolver::DependencyError;
use crate::provider::ProviderError;

/// Main error type for fabric operations
///
/// Variants map onto how a reconciliation pass reacts to them:
/// store and conflict errors abort the pass and are retried with backoff,
/// dependency and provider errors are reported as conditions, and invariant
/// violations stop the controller.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Object store failure other than a conflict
    #[error("store error: {0}")]
    Store(String),

    /// Optimistic-concurrency rejection; the pass is retried from scratch
    #[error("conflict: {0}")]
    Conflict(String),

    /// A referenced object is missing or invalid
    #[error("dependency error: {0}")]
    Dependency(#[from] DependencyError),

    /// The device provider failed
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    /// The engine's own consistency assumptions are broken
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// Validation error for CRD specs
    #[error("validation error: {0}")]
    Validation(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A watch stream failed
    #[error("watch error: {0}")]
    Watch(String),
}

impl Error {
    /// Create a store error with the given message
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a conflict error with the given message
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create an invariant violation with the given message
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::Invariant(msg.into())
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// True when the error must stop the controller instead of being retried
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Invariant(_))
    }

    /// True when retrying the same pass later can succeed
    ///
    /// Malformed objects only change when someone edits them, and that edit
    /// arrives as a watch event.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Invariant(_) | Self::Validation(_) | Self::Serialization(_)
        )
    }

    /// Map a kube client error, turning HTTP 409 into [`Error::Conflict`]
    pub fn from_kube(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(response) if response.code == 409 => {
                Self::Conflict(response.message)
            }
            other => Self::Kube(other),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================================================
    // Story Tests: How a failing pass is treated
    // ==========================================================================

    /// Story: a concurrent writer bumped the resourceVersion
    ///
    /// The pass is abandoned and retried; nothing about it reaches the
    /// object's status.
    #[test]
    fn story_conflicts_are_retried() {
        let err = Error::conflict("object has been modified");
        assert!(err.is_retryable());
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("conflict"));
    }

    /// Story: two controllers claim the same object
    ///
    /// The engine cannot decide which owner is right, so it stops rather than
    /// guess.
    #[test]
    fn story_invariant_violations_are_fatal() {
        let err = Error::invariant("object has 2 controlling owners");
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
    }

    #[test]
    fn story_kube_409_becomes_conflict() {
        let err = Error::from_kube(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "the object has been modified".to_string(),
            reason: "Conflict".to_string(),
            code: 409,
        }));
        assert!(matches!(err, Error::Conflict(ref m) if m.contains("modified")));

        let err = Error::from_kube(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "InternalError".to_string(),
            code: 500,
        }));
        assert!(matches!(err, Error::Kube(_)));
    }

    #[test]
    fn story_provider_errors_keep_their_message() {
        let err = Error::from(ProviderError::Unavailable("leaf1 refused".to_string()));
        assert!(err.to_string().contains("leaf1 refused"));
        assert!(err.is_retryable());
    }

    #[test]
    fn story_serde_errors_become_serialization_errors() {
        let parse = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = Error::from(parse);
        assert!(matches!(err, Error::Serialization(_)));
        assert!(!err.is_retryable());
        assert!(!err.is_fatal());
        assert!(!Error::validation("bad").is_retryable());
    }
}
