use serde::{Deserialize, Serialize};
use serde_json::Value;
use typed_builder::TypedBuilder;

pub const TABLE: &str = "operations";

/// Default number of failed attempts after which an op is quarantined and
/// blocks further progress for its user until an operator intervenes. A
/// conservative small double-digit number of attempts.
pub const DEFAULT_QUARANTINE_THRESHOLD: i64 = 10;

/// Caps the per-attempt exponential backoff, mirroring the dead-letter
/// backoff ceiling a durable job queue uses for the same reason: an
/// indefinitely growing delay is as unhelpful as no backoff at all.
pub const MAX_BACKOFF_SECS: i64 = 3600;

pub fn exp_backoff_secs(attempts: i64) -> i64 {
    2i64.saturating_pow(attempts.clamp(0, 32) as u32).min(MAX_BACKOFF_SECS)
}

#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Operation {
    pub operation_id: String,
    pub method: String,
    pub args: Value,
    #[serde(default)]
    #[builder(default = 0)]
    pub attempts: i64,
    #[serde(default)]
    #[builder(default = 0)]
    pub backoff: i64,
    #[serde(default)]
    #[builder(default = false)]
    pub quarantine: bool,
    pub timestamp: i64,
    #[serde(default)]
    #[builder(default, setter(strip_option))]
    pub checkpoint: Option<Value>,
    #[serde(default)]
    #[builder(default)]
    pub triggered_failpoints: Vec<String>,
}

impl Operation {
    pub fn is_ready(&self, now: i64) -> bool {
        !self.quarantine && self.backoff <= now
    }
}
