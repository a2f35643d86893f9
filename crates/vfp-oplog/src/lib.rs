//! Durable, idempotent per-user operation log: the record a
//! `UserOpManager` drains in order, with method dispatch, message
//! migration, and quarantine on repeated failure.

mod error;
mod ids;
mod log;
mod registry;
mod types;

pub use error::{OpError, OpLogError};
pub use ids::{nested_id, validate_device_owns_id, OpIdAllocator, SYSTEM_DEVICE_ID};
pub use log::OperationLog;
pub use registry::{Migrator, OpContext, OpHandler, OperationMap, Scrubber};
pub use types::{exp_backoff_secs, Operation, DEFAULT_QUARANTINE_THRESHOLD, TABLE};

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use vfp_kv::testing::MemoryKv;
    use vfp_kv::KvStore;

    use super::*;

    fn log() -> OperationLog {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        OperationLog::new(kv)
    }

    #[tokio::test]
    async fn create_if_absent_is_idempotent() {
        let log = log();
        let first = log
            .create_if_absent("u1", "dev1:00000000000000000001", "add_photo", json!({"a": 1}), 100)
            .await
            .unwrap();
        let second = log
            .create_if_absent("u1", "dev1:00000000000000000001", "add_photo", json!({"a": 2}), 200)
            .await
            .unwrap();
        assert_eq!(first.timestamp, second.timestamp);
        assert_eq!(second.args, json!({"a": 1}));
    }

    #[tokio::test]
    async fn nested_id_sorts_before_parent() {
        let log = log();
        let parent_id = "dev1:00000000000000000005";
        log.create_if_absent("u1", parent_id, "m", json!({}), 0)
            .await
            .unwrap();
        log.create_nested("u1", parent_id, "child_m", json!({}), 0)
            .await
            .unwrap();

        let pending = log.pending_for_user("u1").await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].operation_id, format!("({parent_id})"));
        assert_eq!(pending[1].operation_id, parent_id);
    }

    #[tokio::test]
    async fn record_failure_quarantines_after_threshold() {
        let log = log().with_quarantine_threshold(2);
        let mut op = log
            .create_if_absent("u1", "dev1:00000000000000000001", "m", json!({}), 0)
            .await
            .unwrap();

        log.record_failure("u1", &mut op).await.unwrap();
        assert!(!op.quarantine);
        assert_eq!(op.attempts, 1);

        log.record_failure("u1", &mut op).await.unwrap();
        assert!(op.quarantine);
        assert_eq!(op.attempts, 2);

        let pending = log.pending_for_user("u1").await.unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn trigger_failpoint_fires_once_then_noops_on_replay() {
        let log = log();
        let mut op = log
            .create_if_absent("u1", "dev1:00000000000000000001", "m", json!({}), 0)
            .await
            .unwrap();

        let fired = log.trigger_failpoint("u1", &mut op, "crash_before_write").await.unwrap();
        assert!(fired);

        let mut replayed = log.get("u1", &op.operation_id).await.unwrap().unwrap();
        let fired_again = log
            .trigger_failpoint("u1", &mut replayed, "crash_before_write")
            .await
            .unwrap();
        assert!(!fired_again);
    }

    #[tokio::test]
    async fn clear_quarantine_resets_backoff_and_unblocks_scheduling() {
        let log = log().with_quarantine_threshold(1);
        let mut op = log
            .create_if_absent("u1", "dev1:00000000000000000001", "m", json!({}), 0)
            .await
            .unwrap();
        log.record_failure("u1", &mut op).await.unwrap();
        assert!(op.quarantine);
        assert!(log.list_quarantined("u1").await.unwrap().len() == 1);

        let cleared = log.clear_quarantine("u1", &op.operation_id).await.unwrap();
        assert!(!cleared.quarantine);
        assert_eq!(cleared.backoff, 0);
        assert_eq!(cleared.attempts, 1, "attempts is an audit trail, not reset");

        let pending = log.pending_for_user("u1").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert!(log.list_quarantined("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn operation_map_applies_migrators_from_message_version() {
        let map = OperationMap::new();
        struct NoopHandler;
        #[async_trait::async_trait]
        impl OpHandler for NoopHandler {
            async fn execute(&self, _ctx: &dyn OpContext, _args: serde_json::Value) -> Result<(), OpError> {
                Ok(())
            }
        }

        map.register(
            "rename",
            NoopHandler,
            vec![
                Arc::new(|args: serde_json::Value| {
                    let mut obj = args.as_object().cloned().unwrap_or_default();
                    obj.insert("v2_field".into(), json!(true));
                    json!(obj)
                }),
                Arc::new(|args: serde_json::Value| {
                    let mut obj = args.as_object().cloned().unwrap_or_default();
                    obj.insert("v3_field".into(), json!(true));
                    json!(obj)
                }),
            ],
        );

        let migrated = map.migrate("rename", json!({"name": "x"}), 1);
        assert_eq!(migrated["v3_field"], json!(true));
        assert!(migrated.get("v2_field").is_none());
    }

    #[tokio::test]
    async fn scrub_redacts_for_registered_methods_and_passes_through_otherwise() {
        let map = OperationMap::new();
        struct NoopHandler;
        #[async_trait::async_trait]
        impl OpHandler for NoopHandler {
            async fn execute(&self, _ctx: &dyn OpContext, _args: serde_json::Value) -> Result<(), OpError> {
                Ok(())
            }
        }

        map.register_scrubbed(
            "send_invite",
            NoopHandler,
            vec![],
            Some(Arc::new(|_args: &serde_json::Value| json!({"email": "[redacted]"}))),
        );
        map.register("add_photo", NoopHandler, vec![]);

        let scrubbed = map.scrub("send_invite", &json!({"email": "a@example.com"}));
        assert_eq!(scrubbed, json!({"email": "[redacted]"}));

        let unscrubbed = map.scrub("add_photo", &json!({"photo_id": "p1"}));
        assert_eq!(unscrubbed, json!({"photo_id": "p1"}));

        let unknown = map.scrub("no_such_method", &json!({"x": 1}));
        assert_eq!(unknown, json!({"x": 1}));
    }
}
