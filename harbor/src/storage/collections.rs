use std::collections::{HashMap, HashSet};
use std::time::Duration;

use sqlx::Row;
use sqlx::postgres::PgRow;

use super::StorageConnection;
use crate::batch::hash_upsert_sql;
use crate::connection::IsolationLevel;
use crate::error::{Error, Result, require_non_empty};

impl StorageConnection {
    async fn fetch_rows(&self, sql: &str, key: &str, range: Option<(i64, i64)>) -> Result<Vec<PgRow>> {
        let mut scope = self.provider.acquire().await?;
        let mut query = sqlx::query(sql).bind(key);
        if let Some((from, to)) = range {
            query = query.bind(from).bind(to);
        }
        let rows = query.fetch_all(scope.connection()?).await;
        scope.observe(rows)
    }

    async fn fetch_count(&self, table: &str, key: &str) -> Result<i64> {
        require_non_empty("key", key)?;
        let sql = format!("SELECT COUNT(*) FROM {} WHERE key = $1", self.schema.table(table));
        let mut scope = self.provider.acquire().await?;
        let count = sqlx::query_scalar::<_, i64>(&sql)
            .bind(key)
            .fetch_one(scope.connection()?)
            .await;
        scope.observe(count)
    }

    async fn fetch_ttl(&self, table: &str, key: &str) -> Result<Option<Duration>> {
        require_non_empty("key", key)?;
        let sql = format!(
            "SELECT EXTRACT(EPOCH FROM (MIN(expireat) - NOW()))::float8 FROM {} WHERE key = $1",
            self.schema.table(table)
        );
        let mut scope = self.provider.acquire().await?;
        let seconds = sqlx::query_scalar::<_, Option<f64>>(&sql)
            .bind(key)
            .fetch_one(scope.connection()?)
            .await;
        Ok(scope
            .observe(seconds)?
            .map(|s| Duration::from_secs_f64(s.max(0.0))))
    }

    /// Sum of every delta recorded under `key`; 0 when there are none.
    pub async fn get_counter(&self, key: &str) -> Result<i64> {
        require_non_empty("key", key)?;
        let sql = format!(
            "SELECT COALESCE(SUM(value), 0)::bigint FROM {} WHERE key = $1",
            self.schema.table("counter")
        );
        let mut scope = self.provider.acquire().await?;
        let total = sqlx::query_scalar::<_, i64>(&sql)
            .bind(key)
            .fetch_one(scope.connection()?)
            .await;
        scope.observe(total)
    }

    /// Every member of the set.
    pub async fn get_all_items_from_set(&self, key: &str) -> Result<HashSet<String>> {
        require_non_empty("key", key)?;
        let sql = format!("SELECT value FROM {} WHERE key = $1", self.schema.table("set"));
        let rows = self.fetch_rows(&sql, key, None).await?;
        rows.iter()
            .map(|row| row.try_get("value").map_err(Error::from))
            .collect()
    }

    /// Member with the lowest score inside `from..=to`.
    pub async fn get_first_by_lowest_score_from_set(
        &self,
        key: &str,
        from: f64,
        to: f64,
    ) -> Result<Option<String>> {
        require_non_empty("key", key)?;
        if to < from {
            return Err(Error::validation(
                "to",
                "upper score bound must not be below the lower bound",
            ));
        }
        let sql = format!(
            r#"
            SELECT value FROM {}
            WHERE key = $1 AND score BETWEEN $2 AND $3
            ORDER BY score
            LIMIT 1
            "#,
            self.schema.table("set")
        );
        let mut scope = self.provider.acquire().await?;
        let value = sqlx::query_scalar::<_, String>(&sql)
            .bind(key)
            .bind(from)
            .bind(to)
            .fetch_optional(scope.connection()?)
            .await;
        scope.observe(value)
    }

    /// Number of members in the set.
    pub async fn get_set_count(&self, key: &str) -> Result<i64> {
        self.fetch_count("set", key).await
    }

    /// Members at zero-based positions `from..=to`, in insertion order.
    pub async fn get_range_from_set(&self, key: &str, from: i64, to: i64) -> Result<Vec<String>> {
        require_non_empty("key", key)?;
        let sql = range_sql(&self.schema.table("set"), "ASC");
        let rows = self.fetch_rows(&sql, key, Some((from + 1, to + 1))).await?;
        values(&rows)
    }

    /// Time until the set expires; `None` when it has no expiry.
    pub async fn get_set_ttl(&self, key: &str) -> Result<Option<Duration>> {
        self.fetch_ttl("set", key).await
    }

    /// Every list element, newest first.
    pub async fn get_all_items_from_list(&self, key: &str) -> Result<Vec<String>> {
        require_non_empty("key", key)?;
        let sql = format!(
            "SELECT value FROM {} WHERE key = $1 ORDER BY id DESC",
            self.schema.table("list")
        );
        let rows = self.fetch_rows(&sql, key, None).await?;
        values(&rows)
    }

    /// Elements at zero-based positions `from..=to`, newest first.
    pub async fn get_range_from_list(&self, key: &str, from: i64, to: i64) -> Result<Vec<String>> {
        require_non_empty("key", key)?;
        let sql = range_sql(&self.schema.table("list"), "DESC");
        let rows = self.fetch_rows(&sql, key, Some((from + 1, to + 1))).await?;
        values(&rows)
    }

    /// Number of elements in the list.
    pub async fn get_list_count(&self, key: &str) -> Result<i64> {
        self.fetch_count("list", key).await
    }

    /// Time until the list expires; `None` when it has no expiry.
    pub async fn get_list_ttl(&self, key: &str) -> Result<Option<Duration>> {
        self.fetch_ttl("list", key).await
    }

    /// Upsert hash fields immediately, all or none.
    pub async fn set_range_in_hash<I, K, V>(&self, key: &str, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        require_non_empty("key", key)?;
        let sql = hash_upsert_sql(&self.schema);
        let mut scope = self.provider.acquire().await?;
        let mut tx = scope.begin_transaction(IsolationLevel::ReadCommitted).await?;
        for (field, value) in entries {
            sqlx::query(&sql)
                .bind(key)
                .bind(field.as_ref())
                .bind(value.as_ref())
                .execute(tx.connection())
                .await?;
        }
        tx.commit().await
    }

    /// All fields of a hash, or `None` if it has none.
    pub async fn get_all_entries_from_hash(&self, key: &str) -> Result<Option<HashMap<String, String>>> {
        require_non_empty("key", key)?;
        let sql = format!(
            "SELECT field, value FROM {} WHERE key = $1",
            self.schema.table("hash")
        );
        let rows = self.fetch_rows(&sql, key, None).await?;
        if rows.is_empty() {
            return Ok(None);
        }
        let entries = rows
            .iter()
            .map(|row| -> Result<(String, String)> {
                Ok((row.try_get("field")?, row.try_get("value")?))
            })
            .collect::<Result<HashMap<_, _>>>()?;
        Ok(Some(entries))
    }

    /// One hash field, if present.
    pub async fn get_value_from_hash(&self, key: &str, field: &str) -> Result<Option<String>> {
        require_non_empty("key", key)?;
        require_non_empty("field", field)?;
        let sql = format!(
            "SELECT value FROM {} WHERE key = $1 AND field = $2",
            self.schema.table("hash")
        );
        let mut scope = self.provider.acquire().await?;
        let value = sqlx::query_scalar::<_, Option<String>>(&sql)
            .bind(key)
            .bind(field)
            .fetch_optional(scope.connection()?)
            .await;
        Ok(scope.observe(value)?.flatten())
    }

    /// Number of fields in the hash.
    pub async fn get_hash_count(&self, key: &str) -> Result<i64> {
        self.fetch_count("hash", key).await
    }

    /// Time until the hash expires; `None` when it has no expiry.
    pub async fn get_hash_ttl(&self, key: &str) -> Result<Option<Duration>> {
        self.fetch_ttl("hash", key).await
    }
}

/// Positional range over one key; `$2` and `$3` are one-based and inclusive.
fn range_sql(table: &str, order: &str) -> String {
    format!(
        r#"
        SELECT value FROM (
            SELECT value, row_number() OVER (ORDER BY id {order}) AS row_num
            FROM {table}
            WHERE key = $1
        ) AS ranked
        WHERE ranked.row_num BETWEEN $2 AND $3
        ORDER BY ranked.row_num
        "#
    )
}

fn values(rows: &[PgRow]) -> Result<Vec<String>> {
    rows.iter()
        .map(|row| row.try_get("value").map_err(Error::from))
        .collect()
}
