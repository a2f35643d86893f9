use serde::{Deserialize, Serialize};

/// How often a held lock's `expiration` is renewed.
pub const LOCK_RENEWAL_SECS: i64 = 30;
/// How far into the future `expiration` is pushed on acquire/renew.
pub const ABANDONMENT_SECS: i64 = 60;
/// Bounded retry count for the conditional-write contention loop in
/// [`crate::LockManager::try_acquire`].
pub const MAX_ACQUIRE_RETRIES: u32 = 10;

pub const TABLE: &str = "locks";

/// Outcome of a [`crate::LockManager::try_acquire`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    Acquired,
    AcquiredAbandoned,
    Failed,
}

/// The persisted shape of a lock row. `resource_type` is duplicated from
/// the key (`resource_type:resource_id`) into the attribute blob so the
/// abandoned-lock sweeper can filter a cross-partition scan by it; the KV
/// primitives have no prefix-match on hash keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRow {
    pub resource_type: String,
    pub owner_id: String,
    pub resource_data: Option<String>,
    pub expiration: Option<i64>,
    pub acquire_failures: i64,
}

/// A random 48-bit owner token, hex-encoded, the way a process identifies
/// itself as a lock owner without a central allocator.
pub fn random_owner_id() -> String {
    let bits: u64 = fastrand::u64(..) & 0xFFFF_FFFF_FFFF;
    format!("{bits:012x}")
}

pub fn lock_id(resource_type: &str, resource_id: &str) -> String {
    format!("{resource_type}:{resource_id}")
}
