use thiserror::Error;

/// The pipeline's sanitized error boundary. Each internal crate
/// (`vfp-kv`, `vfp-lock`, `vfp-oplog`, `vfp-notify`) keeps its own narrow
/// error enum; this type wraps them with `#[from]` so a request handler
/// has one thing to match on regardless of which layer failed.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Storage(#[from] vfp_kv::KvError),

    #[error(transparent)]
    Lock(#[from] vfp_lock::LockError),

    #[error(transparent)]
    Log(#[from] vfp_oplog::OpLogError),

    #[error(transparent)]
    Notify(#[from] vfp_notify::NotifyError),

    #[error("method {0:?} is not registered in the operation map")]
    UnknownMethod(String),

    #[error("operation id {op_id:?} does not belong to device {device_id:?}")]
    ForeignOpId { op_id: String, device_id: String },

    #[error("args must be a JSON object to carry header fields")]
    InvalidArgsShape,

    #[error(transparent)]
    Config(#[from] anyhow::Error),
}

impl PipelineError {
    /// Whether a caller's own retry loop (outside the one the scheduler
    /// already wraps a handler in) should retry this error, versus
    /// surfacing it to the requester as final. Mirrors the §7 taxonomy:
    /// transient storage is retryable, everything naming a durable
    /// decision (unknown method, lock contention, foreign op id) is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Storage(e) => e.is_transient(),
            PipelineError::Log(vfp_oplog::OpLogError::Store(e)) => e.is_transient(),
            PipelineError::Notify(vfp_notify::NotifyError::Store(e)) => e.is_transient(),
            PipelineError::Lock(_) => false,
            PipelineError::UnknownMethod(_) => false,
            PipelineError::ForeignOpId { .. } => false,
            PipelineError::InvalidArgsShape => false,
            PipelineError::Config(_) => false,
            PipelineError::Log(_) => false,
        }
    }
}
