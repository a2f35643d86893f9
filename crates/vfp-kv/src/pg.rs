//! PostgreSQL-backed [`KvStore`].
//!
//! Every table the pipeline needs (`operations`, `locks`, `notifications`)
//! is emulated as a partition of a single generic `kv_items` table, keyed by
//! `(table_name, hash_key, range_key)` with a `jsonb` attribute blob. This
//! keeps the rest of the pipeline honest about only using the storage
//! primitives a wide-column store would actually expose.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgPool, QueryBuilder, Row as SqlxRow};

use crate::error::KvError;
use crate::store::KvStore;
use crate::types::{Expected, Key, RangeQuery, Row, ScanFilter};

pub struct PgKv {
    pool: PgPool,
}

impl PgKv {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn row_from_sql(row: &sqlx::postgres::PgRow) -> Row {
    let hash_key: String = row.get("hash_key");
    let range_key: String = row.get("range_key");
    let attrs: Value = row.get("attrs");
    Row {
        key: Key::new(hash_key, range_key),
        attrs,
    }
}

#[async_trait]
impl KvStore for PgKv {
    async fn put(
        &self,
        table: &str,
        key: &Key,
        attrs: Value,
        expected: Expected,
    ) -> Result<(), KvError> {
        if expected.row_absent {
            let result = sqlx::query(
                r#"
                INSERT INTO kv_items (table_name, hash_key, range_key, attrs)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (table_name, hash_key, range_key) DO NOTHING
                "#,
            )
            .bind(table)
            .bind(&key.hash_key)
            .bind(&key.range_key)
            .bind(&attrs)
            .execute(&self.pool)
            .await?;

            return if result.rows_affected() == 0 {
                Err(KvError::ConditionFailed)
            } else {
                Ok(())
            };
        }

        if expected.attrs.is_empty() {
            sqlx::query(
                r#"
                INSERT INTO kv_items (table_name, hash_key, range_key, attrs, updated_at)
                VALUES ($1, $2, $3, $4, now())
                ON CONFLICT (table_name, hash_key, range_key)
                DO UPDATE SET attrs = EXCLUDED.attrs, updated_at = now()
                "#,
            )
            .bind(table)
            .bind(&key.hash_key)
            .bind(&key.range_key)
            .bind(&attrs)
            .execute(&self.pool)
            .await?;

            return Ok(());
        }

        let mut qb = QueryBuilder::new("UPDATE kv_items SET attrs = ");
        qb.push_bind(attrs);
        qb.push(", updated_at = now() WHERE table_name = ");
        qb.push_bind(table);
        qb.push(" AND hash_key = ");
        qb.push_bind(&key.hash_key);
        qb.push(" AND range_key = ");
        qb.push_bind(&key.range_key);
        for (field, value) in &expected.attrs {
            push_attr_condition(&mut qb, field, value);
        }

        let result = qb.build().execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            Err(KvError::ConditionFailed)
        } else {
            Ok(())
        }
    }

    async fn get(&self, table: &str, key: &Key) -> Result<Option<Value>, KvError> {
        let row = sqlx::query(
            "SELECT attrs FROM kv_items WHERE table_name = $1 AND hash_key = $2 AND range_key = $3",
        )
        .bind(table)
        .bind(&key.hash_key)
        .bind(&key.range_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.get::<Value, _>("attrs")))
    }

    async fn batch_get(&self, table: &str, keys: &[Key]) -> Result<Vec<Option<Value>>, KvError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let hash_keys: Vec<String> = keys.iter().map(|k| k.hash_key.clone()).collect();
        let range_keys: Vec<String> = keys.iter().map(|k| k.range_key.clone()).collect();

        let rows = sqlx::query(
            r#"
            SELECT hash_key, range_key, attrs
            FROM kv_items
            WHERE table_name = $1
              AND (hash_key, range_key) IN (
                  SELECT * FROM UNNEST($2::text[], $3::text[])
              )
            "#,
        )
        .bind(table)
        .bind(&hash_keys)
        .bind(&range_keys)
        .fetch_all(&self.pool)
        .await?;

        let found: std::collections::HashMap<(String, String), Value> = rows
            .into_iter()
            .map(|r| {
                let h: String = r.get("hash_key");
                let rk: String = r.get("range_key");
                let attrs: Value = r.get("attrs");
                ((h, rk), attrs)
            })
            .collect();

        Ok(keys
            .iter()
            .map(|k| found.get(&(k.hash_key.clone(), k.range_key.clone())).cloned())
            .collect())
    }

    async fn range_query(
        &self,
        table: &str,
        hash_key: &str,
        opts: RangeQuery,
    ) -> Result<Vec<Row>, KvError> {
        let mut qb = QueryBuilder::new(
            "SELECT hash_key, range_key, attrs FROM kv_items WHERE table_name = ",
        );
        qb.push_bind(table);
        qb.push(" AND hash_key = ");
        qb.push_bind(hash_key);

        if let Some(start) = &opts.start_after {
            if opts.forward {
                qb.push(" AND range_key > ");
            } else {
                qb.push(" AND range_key < ");
            }
            qb.push_bind(start.clone());
        }

        if opts.forward {
            qb.push(" ORDER BY range_key ASC");
        } else {
            qb.push(" ORDER BY range_key DESC");
        }

        if let Some(limit) = opts.limit {
            qb.push(" LIMIT ");
            qb.push_bind(limit);
        }

        let rows = qb.build().fetch_all(&self.pool).await?;
        Ok(rows.iter().map(row_from_sql).collect())
    }

    async fn scan(&self, table: &str, filter: ScanFilter) -> Result<Vec<Row>, KvError> {
        let mut qb = QueryBuilder::new(
            "SELECT hash_key, range_key, attrs FROM kv_items WHERE table_name = ",
        );
        qb.push_bind(table);

        if let Some((field, value)) = &filter.numeric_leq {
            qb.push(" AND (attrs->>");
            qb.push_bind(field.clone());
            qb.push(")::bigint <= ");
            qb.push_bind(value);
        }

        for (field, value) in &filter.equals {
            push_attr_condition(&mut qb, field, value);
        }

        qb.push(" ORDER BY hash_key, range_key LIMIT ");
        qb.push_bind(filter.limit.max(0));

        let rows = qb.build().fetch_all(&self.pool).await?;
        Ok(rows.iter().map(row_from_sql).collect())
    }

    async fn delete(&self, table: &str, key: &Key, expected: Expected) -> Result<bool, KvError> {
        let mut qb = QueryBuilder::new("DELETE FROM kv_items WHERE table_name = ");
        qb.push_bind(table);
        qb.push(" AND hash_key = ");
        qb.push_bind(&key.hash_key);
        qb.push(" AND range_key = ");
        qb.push_bind(&key.range_key);

        for (field, value) in &expected.attrs {
            push_attr_condition(&mut qb, field, value);
        }

        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }
}

fn push_attr_condition(qb: &mut QueryBuilder<'_, sqlx::Postgres>, field: &str, value: &Value) {
    if value.is_null() {
        qb.push(" AND (attrs->");
        qb.push_bind(field.to_string());
        qb.push(") IS NULL");
    } else {
        qb.push(" AND (attrs->");
        qb.push_bind(field.to_string());
        qb.push(") = ");
        qb.push_bind(value.clone());
    }
}
