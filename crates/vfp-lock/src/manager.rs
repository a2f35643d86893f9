use std::sync::Arc;

use tracing::warn;
use vfp_kv::{Expected, Key, KvError, KvStore};

use crate::error::LockError;
use crate::types::{
    lock_id, random_owner_id, LockRow, LockStatus, ABANDONMENT_SECS, MAX_ACQUIRE_RETRIES, TABLE,
};

pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

fn decode(value: serde_json::Value, id: &str) -> Result<LockRow, LockError> {
    serde_json::from_value(value)
        .map_err(|e| LockError::Store(KvError::Backend(anyhow::anyhow!("lock {id} row: {e}"))))
}

/// Stateless acquire/release/renew service over a [`KvStore`].
///
/// The renewal timer for a held lock lives on [`crate::LockHandle`], not
/// here; `LockManager` only ever issues single conditional reads/writes, so
/// it is cheap to share across every `UserOpManager`.
pub struct LockManager {
    kv: Arc<dyn KvStore>,
}

impl LockManager {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Implements the five-step contended-acquire protocol from the lock
    /// component design: read, conditional-insert-if-absent,
    /// adopt-if-owner-matches, steal-if-abandoned, or bump
    /// `acquire_failures` and fail.
    pub async fn try_acquire(
        &self,
        resource_type: &str,
        resource_id: &str,
        owner_id: Option<String>,
        resource_data: Option<String>,
        detect_abandonment: bool,
    ) -> Result<(String, LockStatus), LockError> {
        let id = lock_id(resource_type, resource_id);
        let key = Key::singleton(id.clone());
        let candidate_owner = owner_id.clone().unwrap_or_else(random_owner_id);
        let expiration = detect_abandonment.then(|| now_secs() + ABANDONMENT_SECS);

        for _ in 0..MAX_ACQUIRE_RETRIES {
            let existing = self.kv.get(TABLE, &key).await?;

            let current = match existing {
                None => {
                    let row = LockRow {
                        resource_type: resource_type.to_string(),
                        owner_id: candidate_owner.clone(),
                        resource_data: resource_data.clone(),
                        expiration,
                        acquire_failures: 0,
                    };
                    match self
                        .kv
                        .put(TABLE, &key, serde_json::to_value(&row)?, Expected::absent())
                        .await
                    {
                        Ok(()) => return Ok((candidate_owner, LockStatus::Acquired)),
                        Err(KvError::ConditionFailed) => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
                Some(value) => decode(value, &id)?,
            };

            if let Some(ref supplied) = owner_id {
                if supplied == &current.owner_id {
                    return Ok((current.owner_id, LockStatus::Acquired));
                }
            }

            let abandoned = current
                .expiration
                .map(|exp| exp <= now_secs())
                .unwrap_or(false);

            if abandoned {
                let row = LockRow {
                    resource_type: resource_type.to_string(),
                    owner_id: candidate_owner.clone(),
                    resource_data: resource_data.clone(),
                    expiration,
                    acquire_failures: current.acquire_failures,
                };
                match self
                    .kv
                    .put(
                        TABLE,
                        &key,
                        serde_json::to_value(&row)?,
                        Expected::any().attr("owner_id", current.owner_id.clone()),
                    )
                    .await
                {
                    Ok(()) => return Ok((candidate_owner, LockStatus::AcquiredAbandoned)),
                    Err(KvError::ConditionFailed) => continue,
                    Err(e) => return Err(e.into()),
                }
            }

            let bumped = LockRow {
                acquire_failures: current.acquire_failures + 1,
                ..current.clone()
            };
            // Best-effort telemetry: contention on the bump itself is not
            // worth retrying, the caller already knows the outcome.
            let _ = self
                .kv
                .put(
                    TABLE,
                    &key,
                    serde_json::to_value(&bumped)?,
                    Expected::any()
                        .attr("owner_id", current.owner_id.clone())
                        .attr("acquire_failures", current.acquire_failures),
                )
                .await;

            return Ok((candidate_owner, LockStatus::Failed));
        }

        warn!(lock_id = %id, "lock acquire retry budget exhausted");
        Ok((candidate_owner, LockStatus::Failed))
    }

    pub async fn acquire(
        &self,
        resource_type: &str,
        resource_id: &str,
        owner_id: Option<String>,
        resource_data: Option<String>,
        detect_abandonment: bool,
    ) -> Result<String, LockError> {
        let id = lock_id(resource_type, resource_id);
        let (owner, status) = self
            .try_acquire(
                resource_type,
                resource_id,
                owner_id,
                resource_data,
                detect_abandonment,
            )
            .await?;

        match status {
            LockStatus::Failed => Err(LockError::Failed(id)),
            _ => Ok(owner),
        }
    }

    pub(crate) async fn renew(
        &self,
        resource_type: &str,
        resource_id: &str,
        owner_id: &str,
    ) -> Result<(), LockError> {
        let id = lock_id(resource_type, resource_id);
        let key = Key::singleton(id.clone());
        let existing = self
            .kv
            .get(TABLE, &key)
            .await?
            .ok_or_else(|| LockError::Failed(id.clone()))?;
        let current = decode(existing, &id)?;

        if current.owner_id != owner_id {
            return Err(LockError::Failed(id));
        }

        let row = LockRow {
            expiration: Some(now_secs() + ABANDONMENT_SECS),
            ..current
        };
        self.kv
            .put(
                TABLE,
                &key,
                serde_json::to_value(&row)?,
                Expected::any().attr("owner_id", owner_id),
            )
            .await?;
        Ok(())
    }

    /// Deletes the row conditional on ownership, retrying if
    /// `acquire_failures` advanced underneath us (per the release protocol:
    /// re-read and retry as long as ownership is still ours).
    pub async fn release(
        &self,
        resource_type: &str,
        resource_id: &str,
        owner_id: &str,
    ) -> Result<(), LockError> {
        let id = lock_id(resource_type, resource_id);
        let key = Key::singleton(id.clone());

        for _ in 0..MAX_ACQUIRE_RETRIES {
            let existing = match self.kv.get(TABLE, &key).await? {
                Some(v) => v,
                None => return Ok(()),
            };
            let current = decode(existing, &id)?;

            if current.owner_id != owner_id {
                return Err(LockError::Failed(id));
            }

            let deleted = self
                .kv
                .delete(
                    TABLE,
                    &key,
                    Expected::any()
                        .attr("owner_id", owner_id)
                        .attr("acquire_failures", current.acquire_failures),
                )
                .await?;

            if deleted {
                return Ok(());
            }
        }

        Err(LockError::Failed(id))
    }

    pub async fn abandon(
        &self,
        resource_type: &str,
        resource_id: &str,
        owner_id: &str,
    ) -> Result<(), LockError> {
        let id = lock_id(resource_type, resource_id);
        let key = Key::singleton(id.clone());
        let existing = self
            .kv
            .get(TABLE, &key)
            .await?
            .ok_or_else(|| LockError::Failed(id.clone()))?;
        let current = decode(existing, &id)?;

        if current.owner_id != owner_id {
            return Err(LockError::Failed(id));
        }

        let row = LockRow {
            expiration: Some(0),
            ..current
        };
        self.kv
            .put(
                TABLE,
                &key,
                serde_json::to_value(&row)?,
                Expected::any().attr("owner_id", owner_id),
            )
            .await?;
        Ok(())
    }
}

impl From<serde_json::Error> for LockError {
    fn from(e: serde_json::Error) -> Self {
        LockError::Store(KvError::Backend(anyhow::Error::new(e)))
    }
}
