//! Defines the failure taxonomy of a single invocation, and whether
//! each kind of failure is worth retrying.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of an invocation failure, as recorded in dead-letter
/// entries and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    ObjectNotFound,
    StoreUnavailable,
    ClassificationUnavailable,
    ClassificationRejected,
    TimeoutExceeded,
    GrantDenied,
}

impl ErrorKind {
    /// Whether the dispatcher may attempt the invocation again.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::StoreUnavailable
                | ErrorKind::ClassificationUnavailable
                | ErrorKind::TimeoutExceeded
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::ObjectNotFound => "ObjectNotFound",
            ErrorKind::StoreUnavailable => "StoreUnavailable",
            ErrorKind::ClassificationUnavailable => "ClassificationUnavailable",
            ErrorKind::ClassificationRejected => "ClassificationRejected",
            ErrorKind::TimeoutExceeded => "TimeoutExceeded",
            ErrorKind::GrantDenied => "GrantDenied",
        };
        f.write_str(name)
    }
}

/// A failed invocation attempt.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InvocationError {
    #[error("object {key:?} version {version:?} not found in bucket {bucket:?}")]
    ObjectNotFound {
        bucket: String,
        key: String,
        version: String,
    },

    /// A transient failure to read from the object store.
    #[error("object store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("classification capability unavailable: {0}")]
    ClassificationUnavailable(String),

    #[error("classification rejected the input: {0}")]
    ClassificationRejected(String),

    #[error("{phase} exceeded its {limit_ms}ms budget")]
    TimeoutExceeded { phase: &'static str, limit_ms: u64 },

    #[error("grant denied: {0}")]
    GrantDenied(String),
}

impl From<crate::store::StoreError> for InvocationError {
    fn from(err: crate::store::StoreError) -> Self {
        use crate::store::StoreError;
        match err {
            StoreError::NotFound {
                bucket,
                key,
                version,
            } => InvocationError::ObjectNotFound {
                bucket,
                key,
                version,
            },
            StoreError::AccessDenied(reason) => InvocationError::GrantDenied(reason),
            StoreError::Unavailable(reason) => InvocationError::StoreUnavailable(reason),
        }
    }
}

impl InvocationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            InvocationError::ObjectNotFound { .. } => ErrorKind::ObjectNotFound,
            InvocationError::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            InvocationError::ClassificationUnavailable(_) => ErrorKind::ClassificationUnavailable,
            InvocationError::ClassificationRejected(_) => ErrorKind::ClassificationRejected,
            InvocationError::TimeoutExceeded { .. } => ErrorKind::TimeoutExceeded,
            InvocationError::GrantDenied(_) => ErrorKind::GrantDenied,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_kinds_are_retryable() {
        assert!(ErrorKind::ClassificationUnavailable.is_retryable());
        assert!(ErrorKind::TimeoutExceeded.is_retryable());
        assert!(ErrorKind::StoreUnavailable.is_retryable());
        assert!(!ErrorKind::ObjectNotFound.is_retryable());
        assert!(!ErrorKind::ClassificationRejected.is_retryable());
        assert!(!ErrorKind::GrantDenied.is_retryable());
    }

    #[test]
    fn error_maps_to_its_kind() {
        let err = InvocationError::TimeoutExceeded {
            phase: "classify",
            limit_ms: 20_000,
        };
        assert_eq!(err.kind(), ErrorKind::TimeoutExceeded);
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "classify exceeded its 20000ms budget");
    }

    #[test]
    fn kind_serializes_by_name() {
        let json = serde_json::to_string(&ErrorKind::ClassificationRejected).unwrap();
        assert_eq!(json, "\"ClassificationRejected\"");
        assert_eq!(ErrorKind::GrantDenied.to_string(), "GrantDenied");
    }
}
