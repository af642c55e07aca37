//! Local error type for the data-plane adapters.

use orch_error::{ErrorCode, OrchError};

/// Errors surfaced by the `KeyValueStore`, `ObjectStore`, and `SecretStore`
/// traits. Splits transient from hard failures so the retry wrapper can
/// tell them apart without inspecting message text.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backend reported throttling; safe to retry with backoff.
    #[error("store throttled: {0}")]
    Throttled(String),
    /// The caller lacks permission for the requested operation.
    #[error("store permission denied: {0}")]
    PermissionDenied(String),
    /// The requested key or object does not exist.
    #[error("store key not found: {0}")]
    NotFound(String),
    /// A conditional lock-acquire attempt lost to a concurrent holder.
    #[error("lock contended for run {0}")]
    LockContended(String),
    /// An unexpected internal failure (I/O, serialization, etc.).
    #[error("store internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// `true` iff the retry wrapper should retry this error with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Throttled(_))
    }
}

impl From<StoreError> for OrchError {
    fn from(err: StoreError) -> Self {
        let code = match &err {
            StoreError::Throttled(_) => ErrorCode::StoreThrottled,
            StoreError::PermissionDenied(_) => ErrorCode::StorePermissionDenied,
            StoreError::NotFound(_) => ErrorCode::StoreNotFound,
            StoreError::LockContended(_) => ErrorCode::LockContended,
            StoreError::Internal(_) => ErrorCode::Internal,
        };
        OrchError::new(code, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_throttled_is_transient() {
        assert!(StoreError::Throttled("x".into()).is_transient());
        assert!(!StoreError::NotFound("x".into()).is_transient());
        assert!(!StoreError::PermissionDenied("x".into()).is_transient());
        assert!(!StoreError::Internal("x".into()).is_transient());
    }

    #[test]
    fn maps_to_expected_error_code() {
        let err: OrchError = StoreError::NotFound("orders:run-1:0001".into()).into();
        assert_eq!(err.code, ErrorCode::StoreNotFound);
    }
}
