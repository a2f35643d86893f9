//! Facade crate: wires the KV adapter, lock manager, operation log,
//! notification fan-out, and `OpManager` into one [`Pipeline`], and owns
//! the ambient stack (configuration, the sanitized top-level error type,
//! tracing setup) that every crate above it is written against.

mod config;
mod error;
mod pipeline;

pub use config::Config;
pub use error::PipelineError;
pub use pipeline::Pipeline;

// Re-exported so a binary or request handler crate only needs to depend
// on `vfp-pipeline` to register methods and drive the pipeline.
pub use vfp_kv::{testing::MemoryKv, KvStore};
pub use vfp_lock::LockHandle;
pub use vfp_notify::{ActivityRef, FollowerTarget, Invalidate, Notification, NotifyContext};
pub use vfp_oplog::{Migrator, OpContext, OpError, OpHandler, Operation};

/// Initializes a `tracing` subscriber reading `RUST_LOG`, defaulting to
/// `info` with this crate's own modules at `debug`. Call once at process
/// startup, before constructing a [`Pipeline`].
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,vfp_pipeline=debug,vfp_opmanager=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}
