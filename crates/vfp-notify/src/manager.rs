use std::sync::Arc;

use serde_json::Value;
use vfp_kv::{Expected, Key, KvError, KvStore, RangeQuery};

use crate::error::NotifyError;
use crate::types::{
    ActivityRef, FollowerTarget, Invalidate, Notification, NotifyContext, MAX_ID_ALLOC_RETRIES,
    MAX_INLINE_COMMENT_LEN, TABLE,
};

fn range_key(notification_id: i64) -> String {
    format!("{notification_id:020}")
}

fn decode(value: Value) -> Result<Notification, NotifyError> {
    Ok(serde_json::from_value(value)?)
}

pub struct NotificationManager {
    kv: Arc<dyn KvStore>,
}

impl NotificationManager {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    async fn last_notification(&self, user_id: &str) -> Result<Option<Notification>, NotifyError> {
        let rows = self
            .kv
            .range_query(
                TABLE,
                user_id,
                RangeQuery {
                    start_after: None,
                    limit: Some(1),
                    forward: false,
                },
            )
            .await?;
        rows.into_iter().next().map(|r| decode(r.attrs)).transpose()
    }

    /// Allocates the next dense id for `user_id` and inserts the row
    /// conditional on that id being absent, retrying against a fresh read
    /// of the last id on conflict. Concurrent fan-outs for the same user
    /// are serialized in practice by the op's own user-lock, so contention
    /// here is expected to be rare.
    async fn append(&self, user_id: &str, mut build: impl FnMut(i64, i64) -> Notification) -> Result<Notification, NotifyError> {
        for _ in 0..MAX_ID_ALLOC_RETRIES {
            let last = self.last_notification(user_id).await?;
            let next_id = last.as_ref().map(|n| n.notification_id + 1).unwrap_or(0);
            let last_badge = last.and_then(|n| n.badge).unwrap_or(0);

            let notification = build(next_id, last_badge);
            let key = Key::new(user_id, range_key(next_id));

            match self
                .kv
                .put(TABLE, &key, serde_json::to_value(&notification)?, Expected::absent())
                .await
            {
                Ok(()) => return Ok(notification),
                Err(KvError::ConditionFailed) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(NotifyError::Store(KvError::Backend(anyhow::anyhow!(
            "exhausted retries allocating a notification id for user {user_id}"
        ))))
    }

    fn split_payload(inline_comment: Option<&str>, invalidate: Invalidate) -> (Option<String>, Option<Invalidate>) {
        match inline_comment {
            Some(text) if text.len() <= MAX_INLINE_COMMENT_LEN => (Some(text.to_string()), None),
            _ if invalidate.is_empty() => (None, None),
            _ => (None, Some(invalidate)),
        }
    }

    /// Appends one notification per follower, assigning each a consecutive
    /// id in their own stream. `inline_comment`, when present, is dropped
    /// in favor of `invalidate` past [`MAX_INLINE_COMMENT_LEN`]. Each
    /// follower's append lives in its own per-user stream, so the fan-out
    /// runs concurrently rather than one follower at a time.
    pub async fn notify_followers(
        &self,
        ctx: &NotifyContext,
        activity: &ActivityRef,
        followers: &[FollowerTarget],
        name: &str,
        inline_comment: Option<&str>,
    ) -> Result<Vec<Notification>, NotifyError> {
        let appends = followers.iter().map(|follower| {
            let (inline, invalidate) =
                Self::split_payload(inline_comment, follower.invalidate.clone());

            let activity = activity.clone();
            let ctx = ctx.clone();
            let name = name.to_string();
            let viewed_seq = follower.viewed_seq;
            let is_self = follower.user_id == ctx.sender_id;

            self.append(&follower.user_id, move |next_id, last_badge| Notification {
                notification_id: next_id,
                name: name.clone(),
                sender_id: ctx.sender_id.clone(),
                sender_device_id: ctx.sender_device_id.clone(),
                timestamp: ctx.timestamp,
                op_id: ctx.op_id.clone(),
                viewpoint_id: activity.viewpoint_id.clone(),
                update_seq: activity.update_seq,
                viewed_seq,
                activity_id: Some(activity.activity_id.clone()),
                invalidate: invalidate.clone(),
                inline_comment: inline.clone(),
                badge: Some(if is_self { last_badge } else { last_badge + 1 }),
                synthetic_clear_badges: false,
            })
        });

        futures::future::join_all(appends)
            .await
            .into_iter()
            .collect()
    }

    /// Returns the page of real notifications for `user_id` starting after
    /// `start_key` (an opaque cursor: a previously returned
    /// `notification_id`), appending a synthetic `clear_badges` row iff
    /// this page reaches the end of the stream and the last real
    /// notification carried a non-zero badge.
    pub async fn query_notifications(
        &self,
        user_id: &str,
        start_after: Option<i64>,
        limit: i64,
    ) -> Result<Vec<Notification>, NotifyError> {
        let opts = RangeQuery {
            start_after: start_after.map(range_key),
            limit: Some(limit),
            forward: true,
        };
        let rows = self.kv.range_query(TABLE, user_id, opts).await?;
        let mut page = rows
            .into_iter()
            .map(|r| decode(r.attrs))
            .collect::<Result<Vec<_>, _>>()?;

        let caught_up = match page.last() {
            Some(last) => {
                let more = self
                    .kv
                    .range_query(
                        TABLE,
                        user_id,
                        RangeQuery {
                            start_after: Some(range_key(last.notification_id)),
                            limit: Some(1),
                            forward: true,
                        },
                    )
                    .await?;
                more.is_empty()
            }
            None => true,
        };

        if caught_up {
            if let Some(last) = page.last() {
                if last.badge.unwrap_or(0) != 0 {
                    let next_id = last.notification_id + 1;
                    let timestamp = last.timestamp;
                    page.push(Notification {
                        notification_id: next_id,
                        name: "clear_badges".to_string(),
                        sender_id: String::new(),
                        sender_device_id: String::new(),
                        timestamp,
                        op_id: None,
                        viewpoint_id: None,
                        update_seq: None,
                        viewed_seq: None,
                        activity_id: None,
                        invalidate: None,
                        inline_comment: None,
                        badge: Some(0),
                        synthetic_clear_badges: true,
                    });
                }
            }
        }

        Ok(page)
    }
}
