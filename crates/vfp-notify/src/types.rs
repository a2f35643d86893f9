use serde::{Deserialize, Serialize};

pub const TABLE: &str = "notifications";

/// Past this length an inline comment payload is dropped in favor of an
/// invalidate block naming what the client should re-query instead.
pub const MAX_INLINE_COMMENT_LEN: usize = 512;

/// Bounded retry count for the dense-counter allocation loop in
/// [`crate::NotificationManager::notify_followers`].
pub const MAX_ID_ALLOC_RETRIES: u32 = 10;

/// Which collections a client must re-query; sent instead of (or, for
/// items with no inline payload, alongside the lack of) an inline payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Invalidate {
    #[serde(default)]
    pub activities: bool,
    #[serde(default)]
    pub episodes: bool,
    #[serde(default)]
    pub followers: bool,
    #[serde(default)]
    pub comments: bool,
    #[serde(default)]
    pub viewpoints: bool,
}

impl Invalidate {
    pub fn is_empty(&self) -> bool {
        !(self.activities || self.episodes || self.followers || self.comments || self.viewpoints)
    }
}

/// The op-supplied context every notification in a single fan-out shares.
#[derive(Debug, Clone)]
pub struct NotifyContext {
    pub sender_id: String,
    pub sender_device_id: String,
    pub timestamp: i64,
    pub op_id: Option<String>,
}

/// The activity the notification references, plus the viewpoint cursor
/// state it leaves behind for the recipient.
#[derive(Debug, Clone)]
pub struct ActivityRef {
    pub activity_id: String,
    pub viewpoint_id: Option<String>,
    pub update_seq: Option<i64>,
}

/// One recipient of a fan-out: who, their per-viewpoint read cursor, and
/// what they should invalidate if no inline payload fits.
#[derive(Debug, Clone)]
pub struct FollowerTarget {
    pub user_id: String,
    pub viewed_seq: Option<i64>,
    pub invalidate: Invalidate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub notification_id: i64,
    pub name: String,
    pub sender_id: String,
    pub sender_device_id: String,
    pub timestamp: i64,
    #[serde(default)]
    pub op_id: Option<String>,
    #[serde(default)]
    pub viewpoint_id: Option<String>,
    #[serde(default)]
    pub update_seq: Option<i64>,
    #[serde(default)]
    pub viewed_seq: Option<i64>,
    #[serde(default)]
    pub activity_id: Option<String>,
    #[serde(default)]
    pub invalidate: Option<Invalidate>,
    #[serde(default)]
    pub inline_comment: Option<String>,
    #[serde(default)]
    pub badge: Option<i64>,
    /// Never persisted; set only on the synthetic trailing row
    /// [`crate::NotificationManager::query_notifications`] appends when a
    /// reader has caught up to a non-zero badge.
    #[serde(default, skip_serializing)]
    pub synthetic_clear_badges: bool,
}
