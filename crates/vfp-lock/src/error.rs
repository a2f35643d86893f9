use thiserror::Error;
use vfp_kv::KvError;

#[derive(Debug, Error)]
pub enum LockError {
    /// The lock is held by another live owner, or the bounded contention
    /// retry was exhausted without resolving.
    #[error("lock {0} is held by another owner")]
    Failed(String),

    #[error("lock store error: {0}")]
    Store(#[from] KvError),
}
