use async_trait::async_trait;
use serde_json::Value;

use crate::error::KvError;
use crate::types::{Expected, Key, RangeQuery, Row, ScanFilter};

/// Storage-agnostic wide-column primitives.
///
/// This is the only interface the rest of the pipeline is written against.
/// Implementations may back onto a real wide-column store (DynamoDB and
/// friends) or, as here, emulate one inside PostgreSQL. Higher layers
/// (`vfp-lock`, `vfp-oplog`, `vfp-notify`) never issue SQL directly.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Conditional create/update. `attrs` replaces the row's attribute blob
    /// entirely on success. Returns [`KvError::ConditionFailed`] if
    /// `expected` does not hold; this is the normal signal for the lock and
    /// idempotent-create retry loops, not an exceptional backend failure.
    async fn put(
        &self,
        table: &str,
        key: &Key,
        attrs: Value,
        expected: Expected,
    ) -> Result<(), KvError>;

    /// Point read. `Ok(None)` means the row does not exist.
    async fn get(&self, table: &str, key: &Key) -> Result<Option<Value>, KvError>;

    /// Batch point read, preserving input order; `None` at an index means
    /// that key was not found.
    async fn batch_get(&self, table: &str, keys: &[Key]) -> Result<Vec<Option<Value>>, KvError>;

    /// Range query over all rows sharing `hash_key`, ordered by range key.
    async fn range_query(
        &self,
        table: &str,
        hash_key: &str,
        opts: RangeQuery,
    ) -> Result<Vec<Row>, KvError>;

    /// Cross-partition scan matching `filter`.
    async fn scan(&self, table: &str, filter: ScanFilter) -> Result<Vec<Row>, KvError>;

    /// Conditional delete. Returns `true` if a row was deleted, `false` if
    /// no row matched both the key and `expected` (the caller decides
    /// whether that means "already gone" or "ownership changed" by
    /// re-reading, per the lock release protocol).
    async fn delete(&self, table: &str, key: &Key, expected: Expected) -> Result<bool, KvError>;
}
