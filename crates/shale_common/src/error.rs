use thiserror::Error;

/// Convenience alias for `Result<T, StoreError>`.
pub type StoreResult<T> = Result<T, StoreError>;

/// Error classification for retry/escalation decisions.
///
/// - `UserError`   — bad input (oversized capped payload, out-of-order oplog id)
/// - `Retryable`   — write conflict; the caller SHOULD retry the operation
/// - `Transient`   — interruption or shutdown; the caller MAY retry later
/// - `InternalBug` — should never happen; indicates corruption or a logic bug
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UserError,
    Retryable,
    Transient,
    InternalBug,
}

/// Errors surfaced by the record store and its substrate.
#[derive(Error, Debug)]
pub enum StoreError {
    /// `register_write` was rejected: another transaction owns the key, or a
    /// commit newer than our snapshot already wrote it.
    #[error("write conflict: concurrent modification detected")]
    WriteConflict,

    #[error("bad value: {0}")]
    BadValue(String),

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// Engine-layer failure (iterator/status errors, apply failures).
    #[error("storage engine error: {0}")]
    Engine(String),

    /// A read that cannot fail short of corruption failed anyway.
    #[error("data corruption detected: {0}")]
    Corruption(String),

    #[error("operation interrupted")]
    Interrupted,
}

impl StoreError {
    /// Classify this error for retry decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::WriteConflict => ErrorKind::Retryable,
            StoreError::BadValue(_) | StoreError::Unsupported(_) => ErrorKind::UserError,
            StoreError::Interrupted => ErrorKind::Transient,
            StoreError::Engine(_) | StoreError::Corruption(_) => ErrorKind::InternalBug,
        }
    }

    /// True when the failed operation can simply be retried by the caller.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Retryable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_classification() {
        assert_eq!(StoreError::WriteConflict.kind(), ErrorKind::Retryable);
        assert!(StoreError::WriteConflict.is_retryable());
        assert_eq!(
            StoreError::BadValue("too big".into()).kind(),
            ErrorKind::UserError
        );
        assert_eq!(
            StoreError::Unsupported("in-place update").kind(),
            ErrorKind::UserError
        );
        assert_eq!(StoreError::Interrupted.kind(), ErrorKind::Transient);
        assert_eq!(
            StoreError::Corruption("missing record".into()).kind(),
            ErrorKind::InternalBug
        );
        assert!(!StoreError::Interrupted.is_retryable());
    }
}
