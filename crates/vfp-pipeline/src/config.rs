use std::env;

use anyhow::{Context, Result};
use dotenvy::dotenv;

/// Process configuration loaded from the environment, following the
/// tunables named in the component design (abandonment/renewal timing,
/// sweep cadence, quarantine threshold) with defaults matching the
/// documented ones exactly.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,

    /// Identifies this process as a lock owner and in structured logs.
    /// Defaults to a random `worker-<uuid>` if unset, the way a fleet of
    /// identical processes distinguishes itself in logs without an
    /// operator having to assign ids by hand.
    pub worker_id: String,

    /// After how many failed attempts an op is quarantined and stops being
    /// scheduled automatically. Not stated precisely in the original
    /// design; exposed here as a tunable per its own open question.
    pub quarantine_threshold: i64,

    /// Batch size for the failed-op sweeper's scan and the page size for
    /// range queries (`SCAN_LIMIT`).
    pub scan_limit: i64,

    /// Sweep caps the number of `UserOpManager`s a single process takes on
    /// concurrently (`MAX_USERS_OUTSTANDING`).
    pub max_users_outstanding: usize,
}

impl Config {
    /// Load configuration from environment variables, loading a `.env`
    /// file first if present (development convenience).
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            worker_id: env::var("WORKER_ID")
                .ok()
                .unwrap_or_else(|| format!("worker-{}", uuid::Uuid::new_v4())),
            quarantine_threshold: env::var("QUARANTINE_THRESHOLD")
                .unwrap_or_else(|_| vfp_oplog::DEFAULT_QUARANTINE_THRESHOLD.to_string())
                .parse()
                .context("QUARANTINE_THRESHOLD must be a valid integer")?,
            scan_limit: env::var("SCAN_LIMIT")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("SCAN_LIMIT must be a valid integer")?,
            max_users_outstanding: env::var("MAX_USERS_OUTSTANDING")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .context("MAX_USERS_OUTSTANDING must be a valid integer")?,
        })
    }
}
