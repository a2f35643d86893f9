//! Distributed lock with abandonment detection, built on [`vfp_kv::KvStore`].
//!
//! `LockManager` is the stateless acquire/release/renew service; for
//! abandonment detection to actually keep a lock alive, go through
//! [`LockHandle::acquire`], which owns the process-local renewal timer.

mod error;
mod handle;
mod manager;
mod types;

pub use error::LockError;
pub use handle::LockHandle;
pub use manager::LockManager;
pub use types::{lock_id, LockStatus, ABANDONMENT_SECS, LOCK_RENEWAL_SECS};
