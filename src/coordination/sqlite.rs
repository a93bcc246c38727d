use async_trait::async_trait;
use chrono::Utc;
use log::debug;
use sqlx::{Row, SqliteConnection};
use std::collections::HashMap;
use std::time::Duration;

use super::{CoordinationError, CoordinationResult, CoordinationStore};
use crate::db::DbPool;

/// Coordination state kept in `coordination_*` tables of the catalog
/// database, so every worker process sharing the file sees the same flags.
/// Expiries are unix milliseconds; expired rows are ignored on read and
/// purged on the next write to the key.
#[derive(Clone)]
pub struct SqliteCoordinationStore {
    pool: DbPool,
}

impl SqliteCoordinationStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn deadline(ttl: Duration) -> i64 {
    now_millis() + ttl.as_millis() as i64
}

const CONTAINER_TABLES: [&str; 3] = [
    "coordination_list",
    "coordination_set",
    "coordination_hash",
];

/// Drops the key's rows if they expired. Runs first in every write
/// transaction so the transaction holds the write lock from the start.
async fn purge_expired_key(conn: &mut SqliteConnection, key: &str, now: i64) -> sqlx::Result<()> {
    sqlx::query(
        "DELETE FROM coordination_kv WHERE key = ? AND expires_at IS NOT NULL AND expires_at <= ?",
    )
    .bind(key)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    for table in CONTAINER_TABLES {
        let sql = format!(
            "DELETE FROM {} WHERE key = ? AND EXISTS \
             (SELECT 1 FROM coordination_expiry WHERE key = ? AND expires_at <= ?)",
            table
        );
        sqlx::query(&sql)
            .bind(key)
            .bind(key)
            .bind(now)
            .execute(&mut *conn)
            .await?;
    }

    sqlx::query("DELETE FROM coordination_expiry WHERE key = ? AND expires_at <= ?")
        .bind(key)
        .bind(now)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

const CONTAINER_LIVE: &str =
    "NOT EXISTS (SELECT 1 FROM coordination_expiry e WHERE e.key = ? AND e.expires_at <= ?)";

#[async_trait]
impl CoordinationStore for SqliteCoordinationStore {
    async fn get(&self, key: &str) -> CoordinationResult<Option<String>> {
        let value = sqlx::query_scalar::<_, String>(
            "SELECT value FROM coordination_kv WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(key)
        .bind(now_millis())
        .fetch_optional(&self.pool)
        .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CoordinationResult<()> {
        sqlx::query(
            "INSERT INTO coordination_kv (key, value, expires_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
        )
        .bind(key)
        .bind(value)
        .bind(ttl.map(deadline))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> CoordinationResult<bool> {
        // An expired holder is overwritten in the same statement
        let result = sqlx::query(
            "INSERT INTO coordination_kv (key, value, expires_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at
             WHERE coordination_kv.expires_at IS NOT NULL AND coordination_kv.expires_at <= ?",
        )
        .bind(key)
        .bind(value)
        .bind(deadline(ttl))
        .bind(now_millis())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete(&self, key: &str) -> CoordinationResult<()> {
        let mut tx = self.pool.begin().await?;
        for table in [
            "coordination_kv",
            "coordination_list",
            "coordination_set",
            "coordination_hash",
            "coordination_expiry",
        ] {
            sqlx::query(&format!("DELETE FROM {} WHERE key = ?", table))
                .bind(key)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn incr_by(&self, key: &str, delta: i64) -> CoordinationResult<i64> {
        let mut tx = self.pool.begin().await?;
        purge_expired_key(&mut *tx, key, now_millis()).await?;

        let raw = sqlx::query_scalar::<_, String>(
            "INSERT INTO coordination_kv (key, value, expires_at) VALUES (?, ?, NULL)
             ON CONFLICT(key) DO UPDATE
             SET value = CAST(CAST(coordination_kv.value AS INTEGER) + ? AS TEXT)
             RETURNING value",
        )
        .bind(key)
        .bind(delta.to_string())
        .bind(delta)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        raw.parse()
            .map_err(|_| CoordinationError::NotAnInteger(key.to_string()))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CoordinationResult<()> {
        let expires_at = deadline(ttl);
        let mut tx = self.pool.begin().await?;
        purge_expired_key(&mut *tx, key, now_millis()).await?;

        sqlx::query("UPDATE coordination_kv SET expires_at = ? WHERE key = ?")
            .bind(expires_at)
            .bind(key)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT INTO coordination_expiry (key, expires_at)
             SELECT ?, ? WHERE
                EXISTS (SELECT 1 FROM coordination_list WHERE key = ?)
                OR EXISTS (SELECT 1 FROM coordination_set WHERE key = ?)
                OR EXISTS (SELECT 1 FROM coordination_hash WHERE key = ?)
             ON CONFLICT(key) DO UPDATE SET expires_at = excluded.expires_at",
        )
        .bind(key)
        .bind(expires_at)
        .bind(key)
        .bind(key)
        .bind(key)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn list_push(&self, key: &str, values: &[String]) -> CoordinationResult<u64> {
        let mut tx = self.pool.begin().await?;
        purge_expired_key(&mut *tx, key, now_millis()).await?;

        for value in values {
            sqlx::query(
                "INSERT INTO coordination_list (key, position, value)
                 SELECT ?, COALESCE(MAX(position), -1) + 1, ? FROM coordination_list WHERE key = ?",
            )
            .bind(key)
            .bind(value)
            .bind(key)
            .execute(&mut *tx)
            .await?;
        }

        let len: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM coordination_list WHERE key = ?")
            .bind(key)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(len as u64)
    }

    async fn list_range(
        &self,
        key: &str,
        start: usize,
        count: usize,
    ) -> CoordinationResult<Vec<String>> {
        let sql = format!(
            "SELECT value FROM coordination_list WHERE key = ? AND {}
             ORDER BY position LIMIT ? OFFSET ?",
            CONTAINER_LIVE
        );
        let values = sqlx::query_scalar::<_, String>(&sql)
            .bind(key)
            .bind(key)
            .bind(now_millis())
            .bind(count as i64)
            .bind(start as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(values)
    }

    async fn list_len(&self, key: &str) -> CoordinationResult<u64> {
        let sql = format!(
            "SELECT COUNT(*) FROM coordination_list WHERE key = ? AND {}",
            CONTAINER_LIVE
        );
        let len: i64 = sqlx::query_scalar(&sql)
            .bind(key)
            .bind(key)
            .bind(now_millis())
            .fetch_one(&self.pool)
            .await?;
        Ok(len as u64)
    }

    async fn set_add(&self, key: &str, member: &str) -> CoordinationResult<bool> {
        let mut tx = self.pool.begin().await?;
        purge_expired_key(&mut *tx, key, now_millis()).await?;

        let result =
            sqlx::query("INSERT OR IGNORE INTO coordination_set (key, member) VALUES (?, ?)")
                .bind(key)
                .bind(member)
                .execute(&mut *tx)
                .await?;
        tx.commit().await?;
        Ok(result.rows_affected() == 1)
    }

    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> CoordinationResult<()> {
        let mut tx = self.pool.begin().await?;
        purge_expired_key(&mut *tx, key, now_millis()).await?;

        for (field, value) in fields {
            sqlx::query(
                "INSERT INTO coordination_hash (key, field, value) VALUES (?, ?, ?)
                 ON CONFLICT(key, field) DO UPDATE SET value = excluded.value",
            )
            .bind(key)
            .bind(*field)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> CoordinationResult<HashMap<String, String>> {
        let sql = format!(
            "SELECT field, value FROM coordination_hash WHERE key = ? AND {}",
            CONTAINER_LIVE
        );
        let rows = sqlx::query(&sql)
            .bind(key)
            .bind(key)
            .bind(now_millis())
            .fetch_all(&self.pool)
            .await?;

        let mut hash = HashMap::with_capacity(rows.len());
        for row in rows {
            hash.insert(row.try_get("field")?, row.try_get("value")?);
        }
        Ok(hash)
    }

    async fn sweep_expired(&self) -> CoordinationResult<u64> {
        let now = now_millis();
        let mut tx = self.pool.begin().await?;

        let mut removed = sqlx::query(
            "DELETE FROM coordination_kv WHERE expires_at IS NOT NULL AND expires_at <= ?",
        )
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        for table in CONTAINER_TABLES {
            sqlx::query(&format!(
                "DELETE FROM {} WHERE key IN \
                 (SELECT key FROM coordination_expiry WHERE expires_at <= ?)",
                table
            ))
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        removed += sqlx::query("DELETE FROM coordination_expiry WHERE expires_at <= ?")
            .bind(now)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        if removed > 0 {
            debug!("Swept {} expired coordination keys", removed);
        }
        Ok(removed)
    }
}
