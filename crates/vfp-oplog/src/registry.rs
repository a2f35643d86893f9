use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::error::{OpError, OpLogError};
use crate::types::Operation;

/// A step in a method's migration chain: upgrades `args` from one message
/// version to the next. Migrators are applied in registration order
/// starting at the caller-supplied `message_version`.
pub type Migrator = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// Redacts a method's args before they leave the process in an operator-
/// facing view (quarantine listings, diagnostic logs). Never applied to
/// the durable row itself or to what a handler receives.
pub type Scrubber = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// Handles one method's execution. Implementors get at the op currently
/// executing under the user's lock (to checkpoint, create nested ops, or
/// fire test failpoints) through [`OpContext`], never by holding their own
/// reference to it.
#[async_trait]
pub trait OpHandler: Send + Sync {
    async fn execute(&self, ctx: &dyn OpContext, args: Value) -> Result<(), OpError>;
}

/// What a handler sees of the op it is running as. Implemented by
/// `vfp-opmanager`'s executor, which is the only thing allowed to mutate
/// the op row while it owns the user's lock.
#[async_trait]
pub trait OpContext: Send + Sync {
    /// A snapshot of the op as of the last mutation this context made.
    async fn operation(&self) -> Operation;

    async fn set_checkpoint(&self, checkpoint: Value) -> Result<(), OpLogError>;

    /// Creates a nested op and always resolves to `Err`: either
    /// [`OpError::StopAndRetry`] so the scheduler runs the child next, or
    /// [`OpError::TooManyRetries`] if the child already exists quarantined.
    async fn nested(&self, method: &str, args: Value) -> Result<(), OpError>;

    /// Fires a named test failpoint. Resolves to `Err(OpError::Failpoint)`
    /// the first time it is reached for this op; a persisted marker makes
    /// every later replay of the same op a no-op (`Ok(())`).
    async fn trigger_failpoint(&self, name: &str) -> Result<(), OpError>;
}

#[derive(Clone)]
pub struct MethodEntry {
    pub handler: Arc<dyn OpHandler>,
    pub migrators: Vec<Migrator>,
    pub scrubber: Option<Scrubber>,
}

/// Method name to handler/migrator-chain lookup, shared process-wide.
#[derive(Default)]
pub struct OperationMap {
    methods: DashMap<String, MethodEntry>,
}

impl OperationMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        method: impl Into<String>,
        handler: impl OpHandler + 'static,
        migrators: Vec<Migrator>,
    ) {
        self.register_scrubbed(method, handler, migrators, None);
    }

    /// Same as [`Self::register`], with a [`Scrubber`] that redacts this
    /// method's args for operator-facing output (e.g. a quarantine
    /// listing) without touching the durable row or what the handler
    /// itself receives.
    pub fn register_scrubbed(
        &self,
        method: impl Into<String>,
        handler: impl OpHandler + 'static,
        migrators: Vec<Migrator>,
        scrubber: Option<Scrubber>,
    ) {
        self.methods.insert(
            method.into(),
            MethodEntry {
                handler: Arc::new(handler),
                migrators,
                scrubber,
            },
        );
    }

    pub fn resolve(&self, method: &str) -> Option<MethodEntry> {
        self.methods.get(method).map(|e| e.clone())
    }

    pub fn is_registered(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    /// Applies every migrator from `message_version` onward, bringing
    /// `args` up to the server's current understanding of the method.
    pub fn migrate(&self, method: &str, args: Value, message_version: usize) -> Value {
        match self.methods.get(method) {
            Some(entry) => entry
                .migrators
                .iter()
                .skip(message_version)
                .fold(args, |acc, m| m(acc)),
            None => args,
        }
    }

    /// Applies `method`'s registered scrubber to `args` if one was
    /// registered; otherwise returns `args` unchanged. Used before handing
    /// an op's args to anything outside the handler that executes it.
    pub fn scrub(&self, method: &str, args: &Value) -> Value {
        match self.methods.get(method) {
            Some(entry) => match &entry.scrubber {
                Some(scrubber) => scrubber(args),
                None => args.clone(),
            },
            None => args.clone(),
        }
    }
}
