use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::LockError;
use crate::manager::LockManager;
use crate::types::{lock_id, LockStatus, LOCK_RENEWAL_SECS};

/// An acquired lock plus, when abandonment detection was requested, the
/// process-local renewal timer keeping it alive. Dropping the handle
/// without calling [`release`](LockHandle::release) stops the timer but
/// leaves the row in place for the abandonment sweep to reclaim, mirroring
/// what happens when the owning process simply dies.
pub struct LockHandle {
    manager: Arc<LockManager>,
    resource_type: String,
    resource_id: String,
    owner_id: String,
    cancel: CancellationToken,
    renewal_task: Option<JoinHandle<()>>,
}

impl LockHandle {
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn lock_id(&self) -> String {
        lock_id(&self.resource_type, &self.resource_id)
    }

    /// Acquires `resource_type:resource_id` and, on success, starts the
    /// renewal timer if `detect_abandonment` was requested. Returns
    /// [`LockError::Failed`] if the lock is held by another live owner.
    pub async fn acquire(
        manager: Arc<LockManager>,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        owner_id: Option<String>,
        resource_data: Option<String>,
        detect_abandonment: bool,
    ) -> Result<(Self, LockStatus), LockError> {
        let resource_type = resource_type.into();
        let resource_id = resource_id.into();

        let (owner, status) = manager
            .try_acquire(
                &resource_type,
                &resource_id,
                owner_id,
                resource_data,
                detect_abandonment,
            )
            .await?;

        if status == LockStatus::Failed {
            return Err(LockError::Failed(lock_id(&resource_type, &resource_id)));
        }

        let handle = Self::spawn(manager, resource_type, resource_id, owner, detect_abandonment);
        Ok((handle, status))
    }

    fn spawn(
        manager: Arc<LockManager>,
        resource_type: String,
        resource_id: String,
        owner_id: String,
        detect_abandonment: bool,
    ) -> Self {
        let cancel = CancellationToken::new();

        let renewal_task = detect_abandonment.then(|| {
            let manager = manager.clone();
            let resource_type = resource_type.clone();
            let resource_id = resource_id.clone();
            let owner_id = owner_id.clone();
            let cancel = cancel.clone();

            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(
                    LOCK_RENEWAL_SECS as u64,
                ));
                interval.tick().await; // consume the immediate first tick

                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = interval.tick() => {
                            if let Err(e) = manager.renew(&resource_type, &resource_id, &owner_id).await {
                                warn!(
                                    lock_id = %lock_id(&resource_type, &resource_id),
                                    error = %e,
                                    "lock renewal failed, treating lock as abandoned"
                                );
                                return;
                            }
                        }
                    }
                }
            })
        });

        Self {
            manager,
            resource_type,
            resource_id,
            owner_id,
            cancel,
            renewal_task,
        }
    }

    fn stop_renewal(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.renewal_task.take() {
            task.abort();
        }
    }

    pub async fn release(mut self) -> Result<(), LockError> {
        self.stop_renewal();
        self.manager
            .release(&self.resource_type, &self.resource_id, &self.owner_id)
            .await
    }

    pub async fn abandon(mut self) -> Result<(), LockError> {
        self.stop_renewal();
        self.manager
            .abandon(&self.resource_type, &self.resource_id, &self.owner_id)
            .await
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.stop_renewal();
    }
}
