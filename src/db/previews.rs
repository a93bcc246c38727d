use super::models::Preview;
use super::DbPool;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PreviewCounts {
    pub total_files: i64,
    pub total_previews: i64,
    pub missing_previews: i64,
    pub progress: f64,
}

pub async fn find(pool: &DbPool, file_id: i64) -> Result<Option<Preview>, sqlx::Error> {
    sqlx::query_as::<_, Preview>("SELECT * FROM previews WHERE file_id = ?")
        .bind(file_id)
        .fetch_optional(pool)
        .await
}

pub async fn upsert(
    pool: &DbPool,
    file_id: i64,
    thumb_key: &str,
    medium_key: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO previews (file_id, thumb_key, medium_key, updated_at)
         VALUES (?, ?, ?, ?)
         ON CONFLICT(file_id) DO UPDATE SET
             thumb_key = excluded.thumb_key,
             medium_key = excluded.medium_key,
             updated_at = excluded.updated_at",
    )
    .bind(file_id)
    .bind(thumb_key)
    .bind(medium_key)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn delete(pool: &DbPool, file_id: i64) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM previews WHERE file_id = ?")
        .bind(file_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Previews whose owning entry is soft-deleted.
pub async fn owned_by_deleted(pool: &DbPool) -> Result<Vec<Preview>, sqlx::Error> {
    sqlx::query_as::<_, Preview>(
        "SELECT p.* FROM previews p
         JOIN files f ON f.id = p.file_id
         WHERE f.deleted_at IS NOT NULL
         ORDER BY p.file_id",
    )
    .fetch_all(pool)
    .await
}

/// Every storage key referenced by any preview record.
pub async fn referenced_keys(pool: &DbPool) -> Result<HashSet<String>, sqlx::Error> {
    let rows = sqlx::query_as::<_, (String, String)>("SELECT thumb_key, medium_key FROM previews")
        .fetch_all(pool)
        .await?;

    let mut keys = HashSet::with_capacity(rows.len() * 2);
    for (thumb, medium) in rows {
        keys.insert(thumb);
        keys.insert(medium);
    }
    Ok(keys)
}

pub async fn counts(pool: &DbPool) -> Result<PreviewCounts, sqlx::Error> {
    let (total_files, total_previews) = sqlx::query_as::<_, (i64, i64)>(
        "SELECT
             (SELECT COUNT(*) FROM files WHERE deleted_at IS NULL),
             (SELECT COUNT(*) FROM previews p JOIN files f ON f.id = p.file_id
              WHERE f.deleted_at IS NULL)",
    )
    .fetch_one(pool)
    .await?;

    let missing_previews = (total_files - total_previews).max(0);
    let progress = if total_files > 0 {
        total_previews as f64 / total_files as f64
    } else {
        1.0
    };

    Ok(PreviewCounts {
        total_files,
        total_previews,
        missing_previews,
        progress,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{create_in_memory_pool, files, NewCatalogEntry};

    async fn insert_file(pool: &DbPool, key: &str) -> i64 {
        files::insert(
            pool,
            &NewCatalogEntry {
                original_key: key.to_string(),
                filename: "x.jpg".to_string(),
                ext: "jpg".to_string(),
                mime: "image/jpeg".to_string(),
                size_bytes: 1,
                mtime: Utc::now(),
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_upsert_overwrites() {
        let pool = create_in_memory_pool().await.unwrap();
        let id = insert_file(&pool, "/a.jpg").await;

        upsert(&pool, id, "/p/1/old.jpg", "/p/1/old.jpg").await.unwrap();
        upsert(&pool, id, "/p/1/new.jpg", "/p/1/new.jpg").await.unwrap();

        let preview = find(&pool, id).await.unwrap().unwrap();
        assert_eq!(preview.medium_key, "/p/1/new.jpg");
        assert_eq!(referenced_keys(&pool).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_counts_ignore_deleted_entries() {
        let pool = create_in_memory_pool().await.unwrap();
        let a = insert_file(&pool, "/a.jpg").await;
        let b = insert_file(&pool, "/b.jpg").await;
        insert_file(&pool, "/c.jpg").await;
        upsert(&pool, a, "/p/a", "/p/a").await.unwrap();
        upsert(&pool, b, "/p/b", "/p/b").await.unwrap();
        files::soft_delete(&pool, &[b]).await.unwrap();

        let counts = counts(&pool).await.unwrap();
        assert_eq!(counts.total_files, 2);
        assert_eq!(counts.total_previews, 1);
        assert_eq!(counts.missing_previews, 1);
        assert!((counts.progress - 0.5).abs() < f64::EPSILON);

        let orphans = owned_by_deleted(&pool).await.unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].file_id, b);
    }
}
