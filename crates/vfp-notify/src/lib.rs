//! Per-user append-only notification fan-out: compact-vs-invalidate
//! payload selection, badge tracking, and query-time `clear_badges`
//! synthesis.

mod error;
mod manager;
mod types;

pub use error::NotifyError;
pub use manager::NotificationManager;
pub use types::{
    ActivityRef, FollowerTarget, Invalidate, Notification, NotifyContext, MAX_INLINE_COMMENT_LEN,
};

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use vfp_kv::testing::MemoryKv;
    use vfp_kv::KvStore;

    use super::*;

    fn manager() -> NotificationManager {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        NotificationManager::new(kv)
    }

    fn ctx() -> NotifyContext {
        NotifyContext {
            sender_id: "sender".into(),
            sender_device_id: "dev1".into(),
            timestamp: 1000,
            op_id: Some("dev1:00000000000000000001".into()),
        }
    }

    fn activity() -> ActivityRef {
        ActivityRef {
            activity_id: "act1".into(),
            viewpoint_id: Some("vp1".into()),
            update_seq: Some(5),
        }
    }

    #[tokio::test]
    async fn notifications_get_dense_increasing_ids_and_badges() {
        let mgr = manager();
        let followers = vec![FollowerTarget {
            user_id: "u2".into(),
            viewed_seq: Some(0),
            invalidate: Invalidate::default(),
        }];

        let first = mgr
            .notify_followers(&ctx(), &activity(), &followers, "add_photo", None)
            .await
            .unwrap();
        assert_eq!(first[0].notification_id, 0);
        assert_eq!(first[0].badge, Some(1));

        let second = mgr
            .notify_followers(&ctx(), &activity(), &followers, "add_photo", None)
            .await
            .unwrap();
        assert_eq!(second[0].notification_id, 1);
        assert_eq!(second[0].badge, Some(2));
    }

    #[tokio::test]
    async fn sender_own_notification_leaves_badge_unaffected() {
        let mgr = manager();
        let followers = vec![
            FollowerTarget {
                user_id: "sender".into(),
                viewed_seq: Some(0),
                invalidate: Invalidate::default(),
            },
            FollowerTarget {
                user_id: "u2".into(),
                viewed_seq: Some(0),
                invalidate: Invalidate::default(),
            },
        ];

        let first = mgr
            .notify_followers(&ctx(), &activity(), &followers, "add_photo", None)
            .await
            .unwrap();
        assert_eq!(first[0].badge, Some(0));
        assert_eq!(first[1].badge, Some(1));

        let second = mgr
            .notify_followers(&ctx(), &activity(), &followers, "add_photo", None)
            .await
            .unwrap();
        assert_eq!(second[0].badge, Some(0));
        assert_eq!(second[1].badge, Some(2));
    }

    #[tokio::test]
    async fn short_comment_is_inline_long_comment_falls_back_to_invalidate() {
        let mgr = manager();
        let invalidate = Invalidate {
            comments: true,
            ..Default::default()
        };
        let followers = vec![FollowerTarget {
            user_id: "u2".into(),
            viewed_seq: None,
            invalidate: invalidate.clone(),
        }];

        let short = mgr
            .notify_followers(&ctx(), &activity(), &followers, "post_comment", Some("hi!"))
            .await
            .unwrap();
        assert_eq!(short[0].inline_comment.as_deref(), Some("hi!"));
        assert!(short[0].invalidate.is_none());

        let long_text = "x".repeat(MAX_INLINE_COMMENT_LEN + 1);
        let long = mgr
            .notify_followers(&ctx(), &activity(), &followers, "post_comment", Some(&long_text))
            .await
            .unwrap();
        assert!(long[0].inline_comment.is_none());
        assert!(long[0].invalidate.as_ref().unwrap().comments);
    }

    #[tokio::test]
    async fn query_appends_clear_badges_only_when_caught_up_and_badge_nonzero() {
        let mgr = manager();
        let followers = vec![FollowerTarget {
            user_id: "u2".into(),
            viewed_seq: None,
            invalidate: Invalidate::default(),
        }];
        mgr.notify_followers(&ctx(), &activity(), &followers, "add_photo", None)
            .await
            .unwrap();

        let page = mgr.query_notifications("u2", None, 10).await.unwrap();
        assert_eq!(page.len(), 2);
        assert!(page[1].synthetic_clear_badges);
        assert_eq!(page[1].badge, Some(0));

        // A partial page (limit smaller than the stream) must not synthesize
        // clear_badges: the reader has not caught up yet.
        mgr.notify_followers(&ctx(), &activity(), &followers, "add_photo", None)
            .await
            .unwrap();
        let partial = mgr.query_notifications("u2", None, 1).await.unwrap();
        assert_eq!(partial.len(), 1);
        assert!(!partial[0].synthetic_clear_badges);
    }
}
