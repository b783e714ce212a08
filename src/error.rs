//! Error types for the cnat operator

use thiserror::Error;

/// Main error type for cnat operations
///
/// Every error that escapes a reconcile pass is classified by the dispatcher
/// into exactly one retry strategy: conflicts are re-queued immediately (the
/// next pass re-reads fresh state), everything else re-enters the queue with
/// capped exponential backoff. A vanished resource is not an error at all -
/// client reads return `Option` and the reconciler treats `None` as success.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error (transient - network, API server, timeouts)
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Malformed schedule string on an At spec
    ///
    /// Treated as transient: the key is retried with backoff indefinitely
    /// until the user fixes the spec. There is no maximum-attempt cutoff.
    #[error("invalid schedule {value:?}: {reason}")]
    Schedule {
        /// The schedule string that failed to parse
        value: String,
        /// Why parsing failed
        reason: String,
    },

    /// Optimistic-concurrency failure on a status write
    ///
    /// Somebody else updated the resource between our read and our write.
    /// Retried immediately with a fresh read, without a backoff penalty.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Reconcile pass exceeded its wall-clock budget
    #[error("reconcile deadline exceeded after {0:?}")]
    DeadlineExceeded(std::time::Duration),
}

impl Error {
    /// Create a schedule error for the given schedule string
    pub fn schedule(value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Schedule {
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Create a conflict error with the given message
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Whether this error is an optimistic-concurrency conflict
    ///
    /// Conflicts get an immediate retry instead of entering backoff.
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Conflict(_) => true,
            Self::Kube(kube::Error::Api(ae)) => ae.code == 409,
            _ => false,
        }
    }
}
