use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use vfp_oplog::{OpContext, OpError, Operation, OperationLog};

/// The [`OpContext`] a `UserOpManager` hands to a handler while it owns
/// the user's lock. Only this context is allowed to mutate the op row, and
/// only for the duration of a single `execute` call.
pub struct ExecutingOpCtx {
    user_id: String,
    oplog: Arc<OperationLog>,
    op: AsyncMutex<Operation>,
}

impl ExecutingOpCtx {
    pub fn new(user_id: String, oplog: Arc<OperationLog>, op: Operation) -> Self {
        Self {
            user_id,
            oplog,
            op: AsyncMutex::new(op),
        }
    }

    /// Consumes the context, returning the op's final in-memory state so
    /// the caller can decide the outcome without a second read.
    pub async fn into_operation(self) -> Operation {
        self.op.into_inner()
    }
}

#[async_trait]
impl OpContext for ExecutingOpCtx {
    async fn operation(&self) -> Operation {
        self.op.lock().await.clone()
    }

    async fn set_checkpoint(&self, checkpoint: Value) -> Result<(), vfp_oplog::OpLogError> {
        let mut op = self.op.lock().await;
        self.oplog.set_checkpoint(&self.user_id, &mut op, checkpoint).await
    }

    async fn nested(&self, method: &str, args: Value) -> Result<(), OpError> {
        let parent_id = self.op.lock().await.operation_id.clone();
        let child = self
            .oplog
            .create_nested(&self.user_id, &parent_id, method, args, chrono_now())
            .await?;

        if child.quarantine {
            Err(OpError::TooManyRetries)
        } else {
            Err(OpError::StopAndRetry)
        }
    }

    async fn trigger_failpoint(&self, name: &str) -> Result<(), OpError> {
        let mut op = self.op.lock().await;
        let fired = self.oplog.trigger_failpoint(&self.user_id, &mut op, name).await?;
        if fired {
            Err(OpError::Failpoint(name.to_string()))
        } else {
            Ok(())
        }
    }
}

fn chrono_now() -> i64 {
    chrono::Utc::now().timestamp()
}
