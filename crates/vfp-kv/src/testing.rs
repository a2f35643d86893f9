//! In-memory [`KvStore`] for unit tests that don't need a real Postgres.
//!
//! Mirrors the conditional semantics of [`crate::pg::PgKv`] exactly so tests
//! written against `MemoryKv` exercise the same contention paths the real
//! backend would hit.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::error::KvError;
use crate::store::KvStore;
use crate::types::{Expected, Key, RangeQuery, Row, ScanFilter};

type TableKey = (String, String, String);

#[derive(Default)]
pub struct MemoryKv {
    rows: DashMap<TableKey, Value>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self {
            rows: DashMap::new(),
        }
    }

    fn tk(table: &str, key: &Key) -> TableKey {
        (table.to_string(), key.hash_key.clone(), key.range_key.clone())
    }

    fn matches(attrs: &Value, expected: &Expected) -> bool {
        expected.attrs.iter().all(|(field, value)| {
            let actual = attrs.get(field).cloned().unwrap_or(Value::Null);
            if value.is_null() {
                actual.is_null()
            } else {
                &actual == value
            }
        })
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn put(
        &self,
        table: &str,
        key: &Key,
        attrs: Value,
        expected: Expected,
    ) -> Result<(), KvError> {
        let tk = Self::tk(table, key);

        if expected.row_absent {
            match self.rows.entry(tk) {
                dashmap::mapref::entry::Entry::Occupied(_) => {
                    return Err(KvError::ConditionFailed)
                }
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    slot.insert(attrs);
                    return Ok(());
                }
            }
        }

        if expected.attrs.is_empty() {
            self.rows.insert(tk, attrs);
            return Ok(());
        }

        match self.rows.get(&tk) {
            Some(existing) if Self::matches(&existing, &expected) => {
                drop(existing);
                self.rows.insert(tk, attrs);
                Ok(())
            }
            _ => Err(KvError::ConditionFailed),
        }
    }

    async fn get(&self, table: &str, key: &Key) -> Result<Option<Value>, KvError> {
        Ok(self.rows.get(&Self::tk(table, key)).map(|v| v.clone()))
    }

    async fn batch_get(&self, table: &str, keys: &[Key]) -> Result<Vec<Option<Value>>, KvError> {
        Ok(keys
            .iter()
            .map(|k| self.rows.get(&Self::tk(table, k)).map(|v| v.clone()))
            .collect())
    }

    async fn range_query(
        &self,
        table: &str,
        hash_key: &str,
        opts: RangeQuery,
    ) -> Result<Vec<Row>, KvError> {
        let mut rows: Vec<Row> = self
            .rows
            .iter()
            .filter(|e| e.key().0 == table && e.key().1 == hash_key)
            .map(|e| Row {
                key: Key::new(e.key().1.clone(), e.key().2.clone()),
                attrs: e.value().clone(),
            })
            .collect();

        rows.sort_by(|a, b| a.key.range_key.cmp(&b.key.range_key));
        if !opts.forward {
            rows.reverse();
        }

        if let Some(start) = &opts.start_after {
            rows.retain(|r| {
                if opts.forward {
                    r.key.range_key.as_str() > start.as_str()
                } else {
                    r.key.range_key.as_str() < start.as_str()
                }
            });
        }

        if let Some(limit) = opts.limit {
            rows.truncate(limit.max(0) as usize);
        }

        Ok(rows)
    }

    async fn scan(&self, table: &str, filter: ScanFilter) -> Result<Vec<Row>, KvError> {
        let mut rows: Vec<Row> = self
            .rows
            .iter()
            .filter(|e| e.key().0 == table)
            .filter(|e| {
                if let Some((field, value)) = &filter.numeric_leq {
                    let actual = e.value().get(field).and_then(|v| v.as_i64());
                    match actual {
                        Some(n) => n <= *value,
                        None => false,
                    }
                } else {
                    true
                }
            })
            .filter(|e| {
                filter.equals.iter().all(|(field, value)| {
                    e.value().get(field).cloned().unwrap_or(Value::Null) == *value
                })
            })
            .map(|e| Row {
                key: Key::new(e.key().1.clone(), e.key().2.clone()),
                attrs: e.value().clone(),
            })
            .collect();

        rows.sort_by(|a, b| {
            a.key
                .hash_key
                .cmp(&b.key.hash_key)
                .then(a.key.range_key.cmp(&b.key.range_key))
        });
        rows.truncate(filter.limit.max(0) as usize);

        Ok(rows)
    }

    async fn delete(&self, table: &str, key: &Key, expected: Expected) -> Result<bool, KvError> {
        let tk = Self::tk(table, key);

        if !expected.attrs.is_empty() {
            match self.rows.get(&tk) {
                Some(existing) if Self::matches(&existing, &expected) => {}
                _ => return Ok(false),
            }
        }

        Ok(self.rows.remove(&tk).is_some())
    }
}
