use std::sync::Arc;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};
use vfp_kv::KvStore;
use vfp_lock::LockManager;
use vfp_notify::NotificationManager;
use vfp_oplog::{
    validate_device_owns_id, Migrator, OpHandler, OpIdAllocator, Operation, OperationLog,
    OperationMap,
};
use vfp_opmanager::OpManager;

use crate::config::Config;
use crate::error::PipelineError;

/// Header fields a caller may tuck into `args`; stripped before the
/// remainder is persisted as the op's durable payload.
struct RequestHeaders {
    synchronous: bool,
    op_id: Option<String>,
    op_timestamp: Option<i64>,
}

fn take_headers(args: &mut Value) -> Result<RequestHeaders, PipelineError> {
    let obj = args.as_object_mut().ok_or(PipelineError::InvalidArgsShape)?;
    Ok(RequestHeaders {
        synchronous: obj
            .remove("synchronous")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        op_id: obj.remove("op_id").and_then(|v| v.as_str().map(str::to_string)),
        op_timestamp: obj.remove("op_timestamp").and_then(|v| v.as_i64()),
    })
}

/// Wires the operation pipeline's components into one object: the
/// Operation log, the lock manager, the Operation Map, notification
/// fan-out, and the process-wide `OpManager` coordinator. Construct once
/// per process and share it with every request handler.
pub struct Pipeline {
    kv: Arc<dyn KvStore>,
    oplog: Arc<OperationLog>,
    locks: Arc<LockManager>,
    methods: Arc<OperationMap>,
    notify: Arc<NotificationManager>,
    opmgr: Arc<OpManager>,
    ids: Arc<OpIdAllocator>,
    worker_id: String,
    sweep_cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(kv: Arc<dyn KvStore>, config: &Config) -> Arc<Self> {
        let oplog = Arc::new(OperationLog::new(kv.clone()).with_quarantine_threshold(config.quarantine_threshold));
        let locks = Arc::new(LockManager::new(kv.clone()));
        let methods = Arc::new(OperationMap::new());
        let notify = Arc::new(NotificationManager::new(kv.clone()));
        let opmgr = OpManager::with_limits(
            oplog.clone(),
            locks.clone(),
            methods.clone(),
            config.scan_limit,
            config.max_users_outstanding,
        );

        Arc::new(Self {
            kv,
            oplog,
            locks,
            methods,
            notify,
            opmgr,
            ids: Arc::new(OpIdAllocator::new()),
            worker_id: config.worker_id.clone(),
            sweep_cancel: CancellationToken::new(),
        })
    }

    /// Connects to Postgres and wires a [`Pipeline`] on top of it, running
    /// pending migrations first so a fresh environment boots clean.
    pub async fn connect(config: &Config) -> anyhow::Result<Arc<Self>> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(&config.database_url)
            .await?;
        sqlx::migrate!("../vfp-kv/migrations").run(&pool).await?;

        let kv: Arc<dyn KvStore> = Arc::new(vfp_kv::PgKv::new(pool));
        Ok(Self::new(kv, config))
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn kv(&self) -> Arc<dyn KvStore> {
        self.kv.clone()
    }

    pub fn locks(&self) -> Arc<LockManager> {
        self.locks.clone()
    }

    pub fn notify(&self) -> Arc<NotificationManager> {
        self.notify.clone()
    }

    pub fn oplog(&self) -> Arc<OperationLog> {
        self.oplog.clone()
    }

    /// Registers a handler for `method`, the way a domain module wires its
    /// mutations into the pipeline at process startup. Additive: adding a
    /// method is a safe deployment, no coordination with already-running
    /// ops required.
    pub fn register_method(
        &self,
        method: impl Into<String>,
        handler: impl OpHandler + 'static,
        migrators: Vec<Migrator>,
    ) {
        self.methods.register(method, handler, migrators);
    }

    /// Same as [`Self::register_method`], with a [`vfp_oplog::Scrubber`]
    /// applied to this method's args whenever they leave the process
    /// through operator-facing output (e.g. [`Self::list_quarantined`])
    /// instead of going to the handler itself.
    pub fn register_method_scrubbed(
        &self,
        method: impl Into<String>,
        handler: impl OpHandler + 'static,
        migrators: Vec<Migrator>,
        scrubber: vfp_oplog::Scrubber,
    ) {
        self.methods.register_scrubbed(method, handler, migrators, Some(scrubber));
    }

    /// Starts the two background sweeps (failed ops, abandoned locks).
    /// Call once per process after every domain module has registered its
    /// methods.
    pub fn spawn_sweepers(self: &Arc<Self>) {
        self.opmgr.spawn_failed_op_sweeper(self.sweep_cancel.clone());
        self.opmgr
            .spawn_abandoned_lock_sweeper(self.kv.clone(), self.sweep_cancel.clone());
    }

    /// The entry point every mutating request handler calls:
    /// `CreateAndExecute(user_id, device_id, method, args, message_version)`.
    ///
    /// Strips the `synchronous`/`op_id`/`op_timestamp` header fields out of
    /// `args`, validates or allocates the operation id, migrates the
    /// remaining payload to the server's current message version, and
    /// performs an idempotent conditional create. `synchronous=true` ties
    /// the caller's completion to the operation's: this call then waits for
    /// the op (and everything ahead of it for this user) to drain before
    /// returning. Cancelling the caller (e.g. an HTTP request timeout) does
    /// not cancel the underlying op; it keeps running to completion
    /// regardless, the way a write-ahead log entry must.
    #[instrument(skip(self, args), fields(worker_id = %self.worker_id))]
    pub async fn create_and_execute(
        &self,
        user_id: &str,
        device_id: &str,
        method: &str,
        mut args: Value,
        message_version: usize,
    ) -> Result<Operation, PipelineError> {
        let headers = take_headers(&mut args)?;

        let operation_id = match headers.op_id {
            Some(id) => {
                if !validate_device_owns_id(&id, device_id) {
                    return Err(PipelineError::ForeignOpId {
                        op_id: id,
                        device_id: device_id.to_string(),
                    });
                }
                id
            }
            None => self.ids.allocate_system(),
        };

        let timestamp = headers.op_timestamp.unwrap_or_else(|| chrono::Utc::now().timestamp());
        let migrated_args = self.methods.migrate(method, args, message_version);

        let op = self
            .oplog
            .create_if_absent(user_id, &operation_id, method, migrated_args, timestamp)
            .await?;

        let waiter = self.opmgr.maybe_execute_op(user_id);

        if headers.synchronous {
            wait_for_drain(waiter).await;
            // Re-read: the op may have completed (deleted), failed into
            // backoff, or been quarantined while we waited.
            return Ok(self.oplog.get(user_id, &op.operation_id).await?.unwrap_or(op));
        }

        info!(user_id, device_id, method, op_id = %op.operation_id, "operation persisted, executing asynchronously");
        Ok(op)
    }

    /// Test/operator helper: waits for a user's currently pending ops to
    /// finish draining without enqueueing a new one.
    pub async fn wait_for_user_ops(&self, user_id: &str) {
        let waiter = self.opmgr.maybe_execute_op(user_id);
        wait_for_drain(waiter).await;
    }

    /// Ops currently blocking the scheduler for `user_id`, with each op's
    /// args passed through its method's registered scrubber (if any) since
    /// this is operator-facing output, not the durable row itself.
    pub async fn list_quarantined(&self, user_id: &str) -> Result<Vec<Operation>, PipelineError> {
        let mut ops = self.oplog.list_quarantined(user_id).await?;
        for op in &mut ops {
            op.args = self.methods.scrub(&op.method, &op.args);
        }
        Ok(ops)
    }

    /// Operator intervention: clears `quarantine` on one op so the next
    /// sweep or `MaybeExecuteOp` call picks it back up.
    pub async fn clear_quarantine(&self, user_id: &str, operation_id: &str) -> Result<Operation, PipelineError> {
        let op = self.oplog.clear_quarantine(user_id, operation_id).await?;
        self.opmgr.maybe_execute_op(user_id);
        Ok(op)
    }

    /// Stops the background sweeps and waits for every currently active
    /// `UserOpManager` to drain, so a graceful shutdown does not abandon an
    /// op mid-execution (it would simply be picked up by abandonment
    /// detection, but a clean exit avoids relying on that).
    pub async fn shutdown(&self) {
        let waiter = self.opmgr.register_shutdown_waiter();
        self.sweep_cancel.cancel();
        wait_for_drain(waiter).await;
    }
}

async fn wait_for_drain(rx: oneshot::Receiver<()>) {
    // Dropping the receiver (a cancelled waiter) has no effect on the
    // underlying work; here we always await it to completion.
    let _ = rx.await;
}
