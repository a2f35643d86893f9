use thiserror::Error;

/// Errors surfaced by a [`crate::KvStore`] implementation.
///
/// [`KvError::ConditionFailed`] is not a failure in the usual sense. It is
/// how the lock and idempotent-create loops in `vfp-lock` and `vfp-oplog`
/// discover contention. Callers match on it explicitly rather than treating
/// it like a transient backend error.
#[derive(Debug, Error)]
pub enum KvError {
    /// The caller's `expected` condition did not hold (row present/absent
    /// mismatch, or an attribute did not match the expected value).
    #[error("conditional write failed: expectation not met")]
    ConditionFailed,

    /// The backend itself failed (connection, timeout, serialization).
    #[error("kv backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl KvError {
    /// Whether this error is the kind that should be retried by a caller's
    /// own retry policy rather than treated as a conditional loop signal.
    pub fn is_transient(&self) -> bool {
        matches!(self, KvError::Backend(_))
    }
}

impl From<sqlx::Error> for KvError {
    fn from(e: sqlx::Error) -> Self {
        KvError::Backend(anyhow::Error::new(e))
    }
}
