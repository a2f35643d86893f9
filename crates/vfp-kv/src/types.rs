use serde_json::Value;

/// A composite key into a [`crate::KvStore`] table: a hash (partition) key
/// and a range (sort) key, the way a wide-column store addresses rows.
///
/// Entities with no natural range component (e.g. locks) use an empty range
/// key so every table shares the same addressing scheme.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key {
    pub hash_key: String,
    pub range_key: String,
}

impl Key {
    pub fn new(hash_key: impl Into<String>, range_key: impl Into<String>) -> Self {
        Self {
            hash_key: hash_key.into(),
            range_key: range_key.into(),
        }
    }

    /// A key with no range component (single row per hash key).
    pub fn singleton(hash_key: impl Into<String>) -> Self {
        Self::new(hash_key, "")
    }
}

/// A condition attached to a `put`/`delete` call. Mirrors DynamoDB-style
/// `expected` maps: the whole row can be required absent, or specific
/// attributes can be required to hold specific values (or be absent, via
/// `Value::Null`).
#[derive(Debug, Clone, Default)]
pub struct Expected {
    pub row_absent: bool,
    pub attrs: Vec<(String, Value)>,
}

impl Expected {
    /// No condition: unconditional write.
    pub fn any() -> Self {
        Self::default()
    }

    /// The row must not already exist (idempotent create).
    pub fn absent() -> Self {
        Self {
            row_absent: true,
            attrs: Vec::new(),
        }
    }

    /// The row must exist with `field` equal to `value` (or, if `value` is
    /// `Value::Null`, `field` must be absent/null on the stored row).
    pub fn attr(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attrs.push((field.into(), value.into()));
        self
    }
}

/// Options for a forward/backward range query over one hash key.
#[derive(Debug, Clone, Default)]
pub struct RangeQuery {
    /// Exclusive start of the range (the caller's last-seen range key).
    pub start_after: Option<String>,
    pub limit: Option<i64>,
    pub forward: bool,
}

impl RangeQuery {
    pub fn forward() -> Self {
        Self {
            start_after: None,
            limit: None,
            forward: true,
        }
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn starting_after(mut self, key: impl Into<String>) -> Self {
        self.start_after = Some(key.into());
        self
    }
}

/// A coarse cross-partition filter for `scan`. Expressive enough for the
/// two sweeps the pipeline runs (failed ops, abandoned locks) without
/// requiring a full query language in the storage-agnostic trait.
#[derive(Debug, Clone, Default)]
pub struct ScanFilter {
    /// `field <= value`, evaluated as an integer.
    pub numeric_leq: Option<(String, i64)>,
    /// `field == value`, evaluated as a JSON value.
    pub equals: Vec<(String, Value)>,
    pub limit: i64,
}

impl ScanFilter {
    pub fn new(limit: i64) -> Self {
        Self {
            numeric_leq: None,
            equals: Vec::new(),
            limit,
        }
    }

    pub fn numeric_leq(mut self, field: impl Into<String>, value: i64) -> Self {
        self.numeric_leq = Some((field.into(), value));
        self
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.equals.push((field.into(), value.into()));
        self
    }
}

/// A row returned by `range_query`/`scan`: its key plus its attribute blob.
#[derive(Debug, Clone)]
pub struct Row {
    pub key: Key,
    pub attrs: Value,
}
