use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use vfp_kv::{KvStore, ScanFilter};
use vfp_lock::LockManager;
use vfp_oplog::{OperationLog, OperationMap};

use crate::user_manager::UserOpManager;

const FAILED_OP_SWEEP_CENTER: Duration = Duration::from_secs(6 * 3600);
const FAILED_OP_SWEEP_JITTER: Duration = Duration::from_secs(3600);
const DEFAULT_FAILED_OP_BATCH: i64 = 10;
const DEFAULT_MAX_ACTIVE_USERS: usize = 1000;

const LOCK_SWEEP_CENTER: Duration = Duration::from_secs(60);
const LOCK_SWEEP_JITTER: Duration = Duration::from_secs(20);

/// A user's drain loop is either not running (and absent from the map
/// entirely) or running one pass, optionally already asked to run one
/// more pass immediately after the current one finishes. `rerun` is how a
/// `maybe_execute_op` call that arrives mid-pass gets folded into the
/// already-running loop instead of racing it with a second lock-acquire
/// attempt for the same user.
#[derive(Clone, Copy)]
enum RunState {
    Running { rerun: bool },
}

struct UserSlot {
    manager: Arc<UserOpManager>,
    state: RunState,
}

/// Process-wide coordinator. Owns the `user_id -> UserOpManager` map and
/// the two background sweeps that re-animate work whose owning process
/// died or whose backoff has elapsed. Exactly one instance per process.
///
/// A user only ever appears in the map while its drain loop is actually
/// running; the loop removes its own entry, and only after confirming
/// under that entry's lock that no further pass was requested while it
/// ran. That keeps `users.is_empty()` an accurate "no op is executing
/// anywhere right now" signal for shutdown, and keeps a second caller
/// for the same user from spawning a competing drain loop instead of
/// folding into the one already in flight.
pub struct OpManager {
    users: DashMap<String, UserSlot>,
    oplog: Arc<OperationLog>,
    locks: Arc<LockManager>,
    methods: Arc<OperationMap>,
    shutdown_waiters: StdMutex<Vec<oneshot::Sender<()>>>,
    failed_op_batch: i64,
    max_active_users: usize,
}

impl OpManager {
    pub fn new(oplog: Arc<OperationLog>, locks: Arc<LockManager>, methods: Arc<OperationMap>) -> Arc<Self> {
        Self::with_limits(
            oplog,
            locks,
            methods,
            DEFAULT_FAILED_OP_BATCH,
            DEFAULT_MAX_ACTIVE_USERS,
        )
    }

    /// Same as [`Self::new`], but with `SCAN_LIMIT`/`MAX_USERS_OUTSTANDING`
    /// threaded in from [`crate`]'s caller instead of the built-in defaults.
    pub fn with_limits(
        oplog: Arc<OperationLog>,
        locks: Arc<LockManager>,
        methods: Arc<OperationMap>,
        failed_op_batch: i64,
        max_active_users: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            users: DashMap::new(),
            oplog,
            locks,
            methods,
            shutdown_waiters: StdMutex::new(Vec::new()),
            failed_op_batch,
            max_active_users,
        })
    }

    /// Resolves once every `UserOpManager` currently tracked has drained.
    /// Registering when the map is already empty resolves immediately.
    /// Used to let a shutting-down process wait for in-flight ops to finish
    /// rather than abandoning their locks mid-execution.
    pub fn register_shutdown_waiter(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        if self.users.is_empty() {
            let _ = tx.send(());
        } else {
            self.shutdown_waiters.lock().unwrap().push(tx);
        }
        rx
    }

    fn fire_shutdown_waiters_if_drained(&self) {
        if self.users.is_empty() {
            for tx in self.shutdown_waiters.lock().unwrap().drain(..) {
                let _ = tx.send(());
            }
        }
    }

    /// Ensures a drain pass runs for `user_id`. If no drain loop is
    /// currently running for this user, claims the slot and spawns one.
    /// If one is already running, marks it to run one more pass once the
    /// current one finishes and returns without spawning anything — the
    /// already-running loop is the only task ever allowed to hold this
    /// user's op-lock at a time, so a second, independent lock-acquire
    /// attempt (which would fail with `LockError::Failed` against the
    /// first task's own lock and return early) never happens.
    pub fn maybe_execute_op(self: &Arc<Self>, user_id: &str) -> oneshot::Receiver<()> {
        let (manager, should_spawn) = match self.users.entry(user_id.to_string()) {
            Entry::Occupied(mut occ) => {
                let should_spawn = match occ.get().state {
                    RunState::Running { .. } => {
                        occ.get_mut().state = RunState::Running { rerun: true };
                        false
                    }
                };
                (occ.get().manager.clone(), should_spawn)
            }
            Entry::Vacant(vac) => {
                let manager = UserOpManager::new(
                    user_id.to_string(),
                    self.oplog.clone(),
                    self.locks.clone(),
                    self.methods.clone(),
                );
                vac.insert(UserSlot {
                    manager: manager.clone(),
                    state: RunState::Running { rerun: false },
                });
                (manager, true)
            }
        };

        let waiter = manager.register_waiter();

        if should_spawn {
            let this = self.clone();
            let user_id = user_id.to_string();
            tokio::spawn(async move {
                loop {
                    manager.drain_once().await;

                    // Decide whether to run again or remove this user's
                    // slot, under the same entry lock a concurrent
                    // `maybe_execute_op` call would need to mark a rerun
                    // or find the slot vacant. That pairing is what rules
                    // out ever deleting a slot a caller just (re-)armed.
                    let rerun = match this.users.entry(user_id.clone()) {
                        Entry::Occupied(mut occ) => {
                            let RunState::Running { rerun } = occ.get().state;
                            if rerun {
                                occ.get_mut().state = RunState::Running { rerun: false };
                                true
                            } else {
                                occ.remove();
                                false
                            }
                        }
                        Entry::Vacant(_) => {
                            unreachable!("this loop is the only remover of its own slot")
                        }
                    };

                    if !rerun {
                        break;
                    }
                }
                this.fire_shutdown_waiters_if_drained();
            });
        }

        waiter
    }

    /// Failed-op sweeper: wakes `MaybeExecuteOp` for users whose ops have
    /// a past-due `backoff`, bounded by `max_active_users` concurrently
    /// active `UserOpManager`s so one server does not take on unbounded
    /// work.
    pub fn spawn_failed_op_sweeper(self: &Arc<Self>, cancel: CancellationToken) {
        let this = self.clone();
        tokio::spawn(async move {
            // Small random start offset avoids every process in a fleet
            // sweeping in lockstep.
            let startup_jitter = Duration::from_secs(fastrand::u64(0..60));
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(startup_jitter) => {}
            }

            loop {
                if this.users.len() < this.max_active_users {
                    match this.oplog.scan_failed(this.failed_op_batch).await {
                        Ok(failed) => {
                            for (user_id, _op) in failed {
                                let _ = this.maybe_execute_op(&user_id);
                            }
                        }
                        Err(e) => error!(error = %e, "failed-op sweep scan error"),
                    }
                } else {
                    info!(active_users = this.users.len(), "failed-op sweep skipped, at capacity");
                }

                let period = jittered(FAILED_OP_SWEEP_CENTER, FAILED_OP_SWEEP_JITTER);
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(period) => {}
                }
            }
        });
    }

    /// Abandoned-lock sweeper: scans `Lock` rows past their `expiration`
    /// for `resource_type = op` and re-triggers `MaybeExecuteOp` on the
    /// user whose lock died with it, using `resource_data` (the op id the
    /// previous owner was working on) purely as a diagnostic hint.
    pub fn spawn_abandoned_lock_sweeper(self: &Arc<Self>, kv: Arc<dyn vfp_kv::KvStore>, cancel: CancellationToken) {
        let this = self.clone();
        tokio::spawn(async move {
            let startup_jitter = Duration::from_secs(fastrand::u64(0..10));
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(startup_jitter) => {}
            }

            loop {
                let now = chrono::Utc::now().timestamp();
                match kv
                    .scan(
                        "locks",
                        ScanFilter::new(100)
                            .numeric_leq("expiration", now)
                            .eq("resource_type", serde_json::json!("op")),
                    )
                    .await
                {
                    Ok(rows) => {
                        for row in rows {
                            let user_id = row.key.hash_key.trim_start_matches("op:").to_string();
                            let _ = this.maybe_execute_op(&user_id);
                        }
                    }
                    Err(e) => error!(error = %e, "abandoned-lock sweep scan error"),
                }

                let period = jittered(LOCK_SWEEP_CENTER, LOCK_SWEEP_JITTER);
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(period) => {}
                }
            }
        });
    }

    pub fn active_user_count(&self) -> usize {
        self.users.len()
    }
}

fn jittered(center: Duration, spread: Duration) -> Duration {
    let spread_secs = spread.as_secs_f64();
    let offset = (fastrand::f64() * 2.0 - 1.0) * spread_secs;
    Duration::from_secs_f64((center.as_secs_f64() + offset).max(1.0))
}
