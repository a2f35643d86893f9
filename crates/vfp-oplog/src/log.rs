use std::sync::Arc;

use serde_json::Value;
use vfp_kv::{Expected, Key, KvError, KvStore, RangeQuery, ScanFilter};

use crate::error::OpLogError;
use crate::ids::nested_id;
use crate::types::{exp_backoff_secs, Operation, DEFAULT_QUARANTINE_THRESHOLD, TABLE};

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

fn decode(value: Value, op_id: &str) -> Result<Operation, OpLogError> {
    serde_json::from_value(value).map_err(|e| {
        OpLogError::Store(KvError::Backend(anyhow::anyhow!("operation {op_id}: {e}")))
    })
}

/// Durable CRUD and scheduling-support primitives over the `Operation`
/// table. Execution (claiming the user's lock, running handlers, deciding
/// outcomes) lives in `vfp-opmanager`; this crate only owns the row.
pub struct OperationLog {
    kv: Arc<dyn KvStore>,
    quarantine_threshold: i64,
}

impl OperationLog {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            quarantine_threshold: DEFAULT_QUARANTINE_THRESHOLD,
        }
    }

    pub fn with_quarantine_threshold(mut self, threshold: i64) -> Self {
        self.quarantine_threshold = threshold;
        self
    }

    /// Idempotent create: if `operation_id` already exists for `user_id`,
    /// returns the existing row instead of erroring, so a retried request
    /// observes the same op it created the first time.
    pub async fn create_if_absent(
        &self,
        user_id: &str,
        operation_id: &str,
        method: &str,
        args: Value,
        timestamp: i64,
    ) -> Result<Operation, OpLogError> {
        let key = Key::new(user_id, operation_id);
        let row = Operation::builder()
            .operation_id(operation_id)
            .method(method)
            .args(args)
            .timestamp(timestamp)
            .build();

        match self
            .kv
            .put(TABLE, &key, serde_json::to_value(&row)?, Expected::absent())
            .await
        {
            Ok(()) => Ok(row),
            Err(KvError::ConditionFailed) => {
                let existing = self.kv.get(TABLE, &key).await?.ok_or_else(|| {
                    OpLogError::Store(KvError::Backend(anyhow::anyhow!(
                        "operation {operation_id} vanished after conflicting create"
                    )))
                })?;
                decode(existing, operation_id)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Creates a nested child of `parent_op_id`, idempotent the same way as
    /// [`Self::create_if_absent`]. Returns the child plus whether it is
    /// already quarantined, which the caller surfaces as `TooManyRetries`.
    pub async fn create_nested(
        &self,
        user_id: &str,
        parent_op_id: &str,
        method: &str,
        args: Value,
        timestamp: i64,
    ) -> Result<Operation, OpLogError> {
        let child_id = nested_id(parent_op_id);
        self.create_if_absent(user_id, &child_id, method, args, timestamp)
            .await
    }

    pub async fn get(&self, user_id: &str, operation_id: &str) -> Result<Option<Operation>, OpLogError> {
        let key = Key::new(user_id, operation_id);
        match self.kv.get(TABLE, &key).await? {
            Some(v) => Ok(Some(decode(v, operation_id)?)),
            None => Ok(None),
        }
    }

    /// Ordered, ready-to-run ops for `user_id`: not quarantined, backoff
    /// elapsed, smallest op id first.
    pub async fn pending_for_user(&self, user_id: &str) -> Result<Vec<Operation>, OpLogError> {
        let rows = self
            .kv
            .range_query(TABLE, user_id, RangeQuery::forward())
            .await?;
        let now = now_secs();
        let mut ops = rows
            .into_iter()
            .map(|r| decode(r.attrs, &r.key.range_key))
            .collect::<Result<Vec<_>, _>>()?;
        ops.retain(|op| op.is_ready(now));
        Ok(ops)
    }

    pub async fn delete(&self, user_id: &str, operation_id: &str) -> Result<(), OpLogError> {
        let key = Key::new(user_id, operation_id);
        self.kv.delete(TABLE, &key, Expected::any()).await?;
        Ok(())
    }

    /// Only callable on the op currently executing under the user's lock;
    /// the caller (the `UserOpManager`) is responsible for that invariant.
    pub async fn set_checkpoint(
        &self,
        user_id: &str,
        op: &mut Operation,
        checkpoint: Value,
    ) -> Result<(), OpLogError> {
        op.checkpoint = Some(checkpoint);
        self.store(user_id, op).await
    }

    /// First non-abortable failure on this op: bump attempts, push the
    /// backoff out, and quarantine once the threshold is hit.
    pub async fn record_failure(
        &self,
        user_id: &str,
        op: &mut Operation,
    ) -> Result<(), OpLogError> {
        op.attempts += 1;
        op.backoff = now_secs() + exp_backoff_secs(op.attempts);
        if op.attempts >= self.quarantine_threshold {
            op.quarantine = true;
        }
        self.store(user_id, op).await
    }

    pub async fn mark_quarantine(&self, user_id: &str, op: &mut Operation) -> Result<(), OpLogError> {
        op.quarantine = true;
        self.store(user_id, op).await
    }

    /// Ops currently blocking the scheduler for `user_id`, for an operator
    /// dashboard or CLI. Unlike [`Self::pending_for_user`] this does not
    /// filter `quarantine`/`backoff` out; it is the complement view.
    pub async fn list_quarantined(&self, user_id: &str) -> Result<Vec<Operation>, OpLogError> {
        let rows = self
            .kv
            .range_query(TABLE, user_id, RangeQuery::forward())
            .await?;
        let mut ops = rows
            .into_iter()
            .map(|r| decode(r.attrs, &r.key.range_key))
            .collect::<Result<Vec<_>, _>>()?;
        ops.retain(|op| op.quarantine);
        Ok(ops)
    }

    /// Operator intervention path referenced by the failure taxonomy: clears
    /// `quarantine` and resets `backoff` so the next `MaybeExecuteOp` picks
    /// the op back up, without touching `attempts` (kept as an audit trail
    /// of how many times it already failed).
    pub async fn clear_quarantine(&self, user_id: &str, operation_id: &str) -> Result<Operation, OpLogError> {
        let mut op = self
            .get(user_id, operation_id)
            .await?
            .ok_or_else(|| OpLogError::InvalidOpId(operation_id.to_string()))?;
        op.quarantine = false;
        op.backoff = 0;
        self.store(user_id, &op).await?;
        Ok(op)
    }

    /// Persists `name` into `triggered_failpoints` the first time it
    /// fires, returning `true`. Returns `false` (no-op) on every later
    /// replay of the same op.
    pub async fn trigger_failpoint(
        &self,
        user_id: &str,
        op: &mut Operation,
        name: &str,
    ) -> Result<bool, OpLogError> {
        if op.triggered_failpoints.iter().any(|f| f == name) {
            return Ok(false);
        }
        op.triggered_failpoints.push(name.to_string());
        self.store(user_id, op).await?;
        Ok(true)
    }

    async fn store(&self, user_id: &str, op: &Operation) -> Result<(), OpLogError> {
        let key = Key::new(user_id, &op.operation_id);
        self.kv
            .put(TABLE, &key, serde_json::to_value(op)?, Expected::any())
            .await?;
        Ok(())
    }

    /// Ops with `backoff <= now`, across all users, for the failed-op
    /// sweeper. `limit` bounds the batch; `start` is an opaque resume
    /// token from a previous call (unused here since the scan is
    /// unordered across partitions, kept for interface symmetry with a
    /// real wide-column scan API).
    pub async fn scan_failed(&self, limit: i64) -> Result<Vec<(String, Operation)>, OpLogError> {
        let rows = self
            .kv
            .scan(
                TABLE,
                ScanFilter::new(limit)
                    .numeric_leq("backoff", now_secs())
                    .eq("quarantine", false),
            )
            .await?;
        rows.into_iter()
            .map(|r| {
                let op = decode(r.attrs, &r.key.range_key)?;
                Ok((r.key.hash_key, op))
            })
            .collect()
    }
}
