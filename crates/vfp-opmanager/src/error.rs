use thiserror::Error;
use vfp_lock::LockError;
use vfp_oplog::OpLogError;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Log(#[from] OpLogError),
}
