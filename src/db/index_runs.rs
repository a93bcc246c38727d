use super::models::{IndexRun, IndexRunStatus, ScanCounters};
use super::DbPool;
use chrono::Utc;

pub async fn create(pool: &DbPool) -> Result<IndexRun, sqlx::Error> {
    let result = sqlx::query("INSERT INTO index_runs (status, started_at) VALUES (?, ?)")
        .bind(IndexRunStatus::Running.as_str())
        .bind(Utc::now())
        .execute(pool)
        .await?;

    sqlx::query_as::<_, IndexRun>("SELECT * FROM index_runs WHERE id = ?")
        .bind(result.last_insert_rowid())
        .fetch_one(pool)
        .await
}

pub async fn find(pool: &DbPool, id: i64) -> Result<Option<IndexRun>, sqlx::Error> {
    sqlx::query_as::<_, IndexRun>("SELECT * FROM index_runs WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn latest(pool: &DbPool) -> Result<Option<IndexRun>, sqlx::Error> {
    sqlx::query_as::<_, IndexRun>("SELECT * FROM index_runs ORDER BY id DESC LIMIT 1")
        .fetch_optional(pool)
        .await
}

pub async fn checkpoint(
    pool: &DbPool,
    id: i64,
    counters: &ScanCounters,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE index_runs SET scanned_count = ?, created_count = ?, updated_count = ?,
                               restored_count = ?, deleted_count = ?
         WHERE id = ?",
    )
    .bind(counters.scanned)
    .bind(counters.created)
    .bind(counters.updated)
    .bind(counters.restored)
    .bind(counters.deleted)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Writes final counters, the terminal status and the finish time.
pub async fn finish(
    pool: &DbPool,
    id: i64,
    counters: &ScanCounters,
    status: IndexRunStatus,
    error: Option<&str>,
) -> Result<(), sqlx::Error> {
    checkpoint(pool, id, counters).await?;
    sqlx::query("UPDATE index_runs SET status = ?, error = ?, finished_at = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(error)
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_in_memory_pool;

    #[tokio::test]
    async fn test_run_lifecycle() {
        let pool = create_in_memory_pool().await.unwrap();
        let run = create(&pool).await.unwrap();
        assert_eq!(run.status, IndexRunStatus::Running);
        assert!(run.finished_at.is_none());

        let counters = ScanCounters {
            scanned: 10,
            created: 4,
            ..Default::default()
        };
        checkpoint(&pool, run.id, &counters).await.unwrap();
        finish(&pool, run.id, &counters, IndexRunStatus::Failed, Some("cancelled"))
            .await
            .unwrap();

        let stored = latest(&pool).await.unwrap().unwrap();
        assert_eq!(stored.id, run.id);
        assert_eq!(stored.status, IndexRunStatus::Failed);
        assert_eq!(stored.scanned_count, 10);
        assert_eq!(stored.created_count, 4);
        assert_eq!(stored.error.as_deref(), Some("cancelled"));
        assert!(stored.finished_at.is_some());
    }
}
