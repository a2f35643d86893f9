use thiserror::Error;
use vfp_kv::KvError;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification store error: {0}")]
    Store(#[from] KvError),

    #[error("notification serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
