use thiserror::Error;
use vfp_kv::KvError;

#[derive(Debug, Error)]
pub enum OpLogError {
    #[error("operation log store error: {0}")]
    Store(#[from] KvError),

    #[error("unknown method {0:?}")]
    UnknownMethod(String),

    #[error("malformed operation id {0:?}")]
    InvalidOpId(String),

    #[error("operation log serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Signals a handler can raise that are not ordinary failures: they change
/// how the scheduler proceeds rather than counting against the op's
/// `attempts`/quarantine budget in the usual way.
#[derive(Debug, Error)]
pub enum OpError {
    /// A nested op was created; the scheduler should execute it before
    /// resuming this op.
    #[error("stop and retry: nested operation created")]
    StopAndRetry,

    /// The nested op this handler requested is already quarantined.
    #[error("too many retries")]
    TooManyRetries,

    /// A test-only injected failure fired for the first time on this op.
    #[error("failpoint {0:?} fired")]
    Failpoint(String),

    /// Any other handler failure; counts against the op's retry/quarantine
    /// budget the normal way.
    #[error(transparent)]
    Other(#[from] anyhow::Error),

    #[error(transparent)]
    Log(#[from] OpLogError),
}
