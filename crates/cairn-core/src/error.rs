//! Unified error type for Cairn.
//!
//! All errors are represented by [`CairnError`], using `thiserror` for
//! ergonomic definitions. The conditional `_if` surface never produces an
//! error for condition-not-satisfied; that is reported in the outcome
//! record. Errors are reserved for missing keys on unconditional reads,
//! policy rejections, retry exhaustion, and backend failures.

use crate::key::SafeKey;
use thiserror::Error;

/// The unified error type for all Cairn operations.
#[derive(Error, Debug)]
pub enum CairnError {
    /// An unconditional `get`/`etag`/`timestamp`/`remove` addressed an
    /// absent key. Backends translate their native not-found (missing file,
    /// HTTP 404) into this at their boundary.
    #[error("key not found: {key}")]
    KeyMissing {
        /// The key that was not found.
        key: SafeKey,
    },

    /// The store's mutation policy forbids the attempted mutation.
    /// The message names the policy, not the operation.
    #[error("mutation rejected by {policy} policy")]
    MutationPolicy {
        /// Name of the policy that rejected the mutation
        /// (e.g. "append-only", "write-once").
        policy: &'static str,
    },

    /// Retries were exhausted inside the transform engine because another
    /// writer kept winning the conditional commit.
    #[error("transform of {key} failed after {attempts} attempt(s)")]
    ConcurrencyConflict {
        /// The key on which the conflict occurred.
        key: SafeKey,
        /// Total number of attempts made before giving up.
        attempts: u32,
    },

    /// A backend/infrastructure failure that is not a missing-key condition
    /// (permissions, network, auth, corruption).
    #[error("{backend} backend failed during {operation}: {message}")]
    Backend {
        /// Name of the backend ("filesystem", "s3", "memory").
        backend: &'static str,
        /// Name of the operation that failed.
        operation: &'static str,
        /// The key involved, if applicable.
        key: Option<SafeKey>,
        /// Human-readable description of the failure.
        message: String,
        /// The underlying error, if available.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A value failed to encode or decode at the codec boundary.
    #[error("serialization failed: {message}")]
    Serialization {
        /// Description of the codec failure.
        message: String,
        /// The underlying error, if available.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The operation is not supported by this dictionary variant.
    #[error("unsupported: {message}")]
    Unsupported {
        /// Description of the unsupported operation.
        message: String,
    },

    /// A key or key component violates the safe-string discipline.
    #[error("invalid key: {message}")]
    InvalidKey {
        /// Description of the violation.
        message: String,
    },
}

impl CairnError {
    /// Create a backend error with a chained source.
    pub fn backend(
        backend: &'static str,
        operation: &'static str,
        key: Option<SafeKey>,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            backend,
            operation,
            key,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a backend error from a message only.
    pub fn backend_msg(
        backend: &'static str,
        operation: &'static str,
        key: Option<SafeKey>,
        message: impl Into<String>,
    ) -> Self {
        Self::Backend {
            backend,
            operation,
            key,
            message: message.into(),
            source: None,
        }
    }

    /// Create a serialization error with a chained source.
    pub fn serialization(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Serialization {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// True for the missing-key condition.
    pub fn is_key_missing(&self) -> bool {
        matches!(self, CairnError::KeyMissing { .. })
    }
}
