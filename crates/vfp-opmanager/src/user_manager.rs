use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::oneshot;
use tracing::{debug, error, warn};
use vfp_lock::{LockError, LockHandle, LockManager};
use vfp_oplog::{OpContext, OpError, OperationLog, OperationMap};
use vfp_retry::{call_with_retry, RetryPolicy};

use crate::ctx::ExecutingOpCtx;
use crate::error::ExecError;

/// Per-user serial executor. Holds the user's `op:<user_id>` lock across
/// every op it drains, so a single user's ops never interleave, while many
/// `UserOpManager`s run concurrently across users.
pub struct UserOpManager {
    user_id: String,
    oplog: Arc<OperationLog>,
    locks: Arc<LockManager>,
    methods: Arc<OperationMap>,
    waiters: StdMutex<Vec<oneshot::Sender<()>>>,
}

impl UserOpManager {
    pub fn new(
        user_id: String,
        oplog: Arc<OperationLog>,
        locks: Arc<LockManager>,
        methods: Arc<OperationMap>,
    ) -> Arc<Self> {
        Arc::new(Self {
            user_id,
            oplog,
            locks,
            methods,
            waiters: StdMutex::new(Vec::new()),
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Resolves once this manager's pending work has drained, supporting
    /// `synchronous=true` requests and "wait for user" test helpers.
    /// Dropping the receiver has no effect on the underlying work.
    pub fn register_waiter(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().unwrap().push(tx);
        rx
    }

    fn fire_waiters(&self) {
        for tx in self.waiters.lock().unwrap().drain(..) {
            let _ = tx.send(());
        }
    }

    fn retry_policy() -> RetryPolicy<(), OpError> {
        RetryPolicy::new(
            3,
            std::time::Duration::from_secs(30),
            std::time::Duration::from_millis(100),
            std::time::Duration::from_secs(5),
        )
        .retry_on_error(|e| matches!(e, OpError::Other(_) | OpError::Log(_)))
    }

    /// One full pass: acquire the lock, drain every ready op, release, fire
    /// waiters. Called repeatedly by [`crate::OpManager`]'s run loop for as
    /// long as this manager has been asked to do work.
    pub async fn drain_once(self: &Arc<Self>) {
        if let Err(e) = self.try_drain().await {
            error!(user_id = %self.user_id, error = %e, "drain pass failed");
        }
        self.fire_waiters();
    }

    async fn try_drain(self: &Arc<Self>) -> Result<(), ExecError> {
        let (handle, status) = match LockHandle::acquire(
            self.locks.clone(),
            "op",
            &self.user_id,
            None,
            None,
            true,
        )
        .await
        {
            Ok(pair) => pair,
            Err(LockError::Failed(id)) => {
                debug!(lock_id = %id, "user op-lock held elsewhere, yielding");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if status == vfp_lock::LockStatus::AcquiredAbandoned {
            warn!(user_id = %self.user_id, "resumed user ops after previous owner abandoned the lock");
        }

        loop {
            let mut pending = self.oplog.pending_for_user(&self.user_id).await?;
            pending.sort_by(|a, b| a.operation_id.cmp(&b.operation_id));

            let Some(op) = pending.into_iter().next() else {
                break;
            };

            self.execute_one(op).await?;
        }

        handle.release().await?;
        Ok(())
    }

    async fn execute_one(self: &Arc<Self>, op: vfp_oplog::Operation) -> Result<(), ExecError> {
        let Some(entry) = self.methods.resolve(&op.method) else {
            warn!(user_id = %self.user_id, method = %op.method, op_id = %op.operation_id, "unknown method, quarantining");
            let mut op = op;
            self.oplog.mark_quarantine(&self.user_id, &mut op).await?;
            return Ok(());
        };

        let op_id = op.operation_id.clone();
        let ctx = Arc::new(ExecutingOpCtx::new(self.user_id.clone(), self.oplog.clone(), op));
        let args = ctx.operation().await.args.clone();
        let policy = Self::retry_policy();
        let handler = entry.handler.clone();

        let outcome = call_with_retry(&policy, || {
            let ctx = ctx.clone();
            let handler = handler.clone();
            let args = args.clone();
            async move { handler.execute(ctx.as_ref(), args).await }
        })
        .await;

        match outcome {
            Ok(()) => {
                self.oplog.delete(&self.user_id, &op_id).await?;
            }
            Err(OpError::StopAndRetry) => {
                debug!(user_id = %self.user_id, op_id = %op_id, "nested op requested, retrying parent later");
            }
            Err(OpError::TooManyRetries) => {
                let mut final_op = Self::unwrap_ctx(ctx).await;
                self.oplog.mark_quarantine(&self.user_id, &mut final_op).await?;
            }
            Err(OpError::Failpoint(name)) => {
                debug!(user_id = %self.user_id, op_id = %op_id, failpoint = %name, "failpoint fired");
                let mut final_op = Self::unwrap_ctx(ctx).await;
                self.oplog.record_failure(&self.user_id, &mut final_op).await?;
            }
            Err(OpError::Other(e)) => {
                warn!(user_id = %self.user_id, op_id = %op_id, error = %e, "handler failed, backing off");
                let mut final_op = Self::unwrap_ctx(ctx).await;
                self.oplog.record_failure(&self.user_id, &mut final_op).await?;
            }
            Err(OpError::Log(e)) => {
                warn!(user_id = %self.user_id, op_id = %op_id, error = %e, "op log error during handler, backing off");
                let mut final_op = Self::unwrap_ctx(ctx).await;
                self.oplog.record_failure(&self.user_id, &mut final_op).await?;
            }
        }

        Ok(())
    }

    async fn unwrap_ctx(ctx: Arc<ExecutingOpCtx>) -> vfp_oplog::Operation {
        match Arc::try_unwrap(ctx) {
            Ok(inner) => inner.into_operation().await,
            Err(shared) => shared.operation().await,
        }
    }
}
