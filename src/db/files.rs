use super::keywords;
use super::models::{CatalogEntry, NewCatalogEntry, Orientation, StorageMode};
use super::DbPool;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};

/// What the scanner needs to know about a catalog row to reconcile it.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct KnownFile {
    pub id: i64,
    pub original_key: String,
    pub size_bytes: i64,
    pub mtime: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Metadata fields written back after a probe.
#[derive(Debug, Clone, Default)]
pub struct MetadataUpdate {
    pub mime: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub shot_at: Option<DateTime<Utc>>,
    pub title: Option<String>,
    pub description: Option<String>,
}

pub async fn find_by_id(pool: &DbPool, id: i64) -> Result<Option<CatalogEntry>, sqlx::Error> {
    sqlx::query_as::<_, CatalogEntry>("SELECT * FROM files WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn find_many(pool: &DbPool, ids: &[i64]) -> Result<Vec<CatalogEntry>, sqlx::Error> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let placeholders = vec!["?"; ids.len()].join(",");
    let sql = format!(
        "SELECT * FROM files WHERE id IN ({}) ORDER BY id",
        placeholders
    );
    let mut query = sqlx::query_as::<_, CatalogEntry>(&sql);
    for id in ids {
        query = query.bind(id);
    }
    query.fetch_all(pool).await
}

/// Every catalog row keyed by storage key. When a key has several rows (older
/// soft-deleted ones plus at most one active), the active row wins, otherwise
/// the most recent one.
pub async fn load_known(pool: &DbPool) -> Result<HashMap<String, KnownFile>, sqlx::Error> {
    let rows = sqlx::query_as::<_, KnownFile>(
        "SELECT id, original_key, size_bytes, mtime, deleted_at FROM files
         ORDER BY (deleted_at IS NULL) ASC, id ASC",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| (row.original_key.clone(), row))
        .collect())
}

pub async fn ids_missing_keywords(pool: &DbPool) -> Result<HashSet<i64>, sqlx::Error> {
    let ids = sqlx::query_scalar::<_, i64>(
        "SELECT f.id FROM files f
         LEFT JOIN file_keywords fk ON fk.file_id = f.id
         WHERE f.deleted_at IS NULL AND fk.file_id IS NULL",
    )
    .fetch_all(pool)
    .await?;
    Ok(ids.into_iter().collect())
}

pub async fn ids_missing_text(pool: &DbPool) -> Result<HashSet<i64>, sqlx::Error> {
    let ids = sqlx::query_scalar::<_, i64>(
        "SELECT id FROM files
         WHERE deleted_at IS NULL AND (title IS NULL OR description IS NULL)",
    )
    .fetch_all(pool)
    .await?;
    Ok(ids.into_iter().collect())
}

pub async fn ids_missing_preview(pool: &DbPool) -> Result<HashSet<i64>, sqlx::Error> {
    let ids = sqlx::query_scalar::<_, i64>(
        "SELECT f.id FROM files f
         LEFT JOIN previews p ON p.file_id = f.id
         WHERE f.deleted_at IS NULL AND p.file_id IS NULL
         ORDER BY f.id",
    )
    .fetch_all(pool)
    .await?;
    Ok(ids.into_iter().collect())
}

/// Active entries lacking keywords, title or description.
pub async fn ids_missing_metadata(pool: &DbPool) -> Result<Vec<i64>, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        "SELECT f.id FROM files f
         WHERE f.deleted_at IS NULL
           AND (f.title IS NULL OR f.description IS NULL
                OR NOT EXISTS (SELECT 1 FROM file_keywords fk WHERE fk.file_id = f.id))
         ORDER BY f.id",
    )
    .fetch_all(pool)
    .await
}

pub async fn ids_missing_shot_at(pool: &DbPool) -> Result<Vec<i64>, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        "SELECT id FROM files WHERE deleted_at IS NULL AND shot_at IS NULL ORDER BY id",
    )
    .fetch_all(pool)
    .await
}

pub async fn insert(pool: &DbPool, entry: &NewCatalogEntry) -> Result<i64, sqlx::Error> {
    let now = Utc::now();
    let result = sqlx::query(
        "INSERT INTO files (storage_mode, original_key, filename, ext, mime, size_bytes, mtime,
                            orientation, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(StorageMode::Filesystem.as_str())
    .bind(&entry.original_key)
    .bind(&entry.filename)
    .bind(&entry.ext)
    .bind(&entry.mime)
    .bind(entry.size_bytes)
    .bind(entry.mtime)
    .bind(Orientation::Unknown.as_str())
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(result.last_insert_rowid())
}

pub async fn update_stat(
    pool: &DbPool,
    id: i64,
    size_bytes: i64,
    mtime: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE files SET size_bytes = ?, mtime = ?, updated_at = ? WHERE id = ?")
        .bind(size_bytes)
        .bind(mtime)
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Clears the soft delete, refreshes size/mtime and counts the entry's keywords again.
pub async fn restore(
    pool: &DbPool,
    id: i64,
    size_bytes: i64,
    mtime: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    let result = sqlx::query(
        "UPDATE files SET deleted_at = NULL, size_bytes = ?, mtime = ?, updated_at = ?
         WHERE id = ? AND deleted_at IS NOT NULL",
    )
    .bind(size_bytes)
    .bind(mtime)
    .bind(Utc::now())
    .bind(id)
    .execute(&mut *tx)
    .await?;

    if result.rows_affected() > 0 {
        keywords::shift_counts_for_file(&mut tx, id, 1).await?;
    }

    tx.commit().await
}

/// Soft-deletes the given active entries and releases their keyword counts.
/// Returns the ids that were actually deleted.
pub async fn soft_delete(pool: &DbPool, ids: &[i64]) -> Result<Vec<i64>, sqlx::Error> {
    let now = Utc::now();
    let mut deleted = Vec::with_capacity(ids.len());
    let mut tx = pool.begin().await?;

    for &id in ids {
        let result = sqlx::query(
            "UPDATE files SET deleted_at = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() > 0 {
            keywords::shift_counts_for_file(&mut tx, id, -1).await?;
            deleted.push(id);
        }
    }

    tx.commit().await?;
    Ok(deleted)
}

/// Bumps `updated_at` of an active entry. Returns false when the entry is
/// gone or soft-deleted. Opening a transaction with this takes the write
/// lock up front.
pub async fn touch_active(conn: &mut sqlx::SqliteConnection, id: i64) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("UPDATE files SET updated_at = ? WHERE id = ? AND deleted_at IS NULL")
        .bind(Utc::now())
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn apply_metadata(
    conn: &mut sqlx::SqliteConnection,
    id: i64,
    update: &MetadataUpdate,
) -> Result<(), sqlx::Error> {
    let orientation = Orientation::from_dimensions(update.width, update.height);
    let mut query = String::from(
        "UPDATE files SET width = ?, height = ?, orientation = ?, shot_at = ?,
                          title = ?, description = ?, updated_at = ?",
    );
    if update.mime.is_some() {
        query.push_str(", mime = ?");
    }
    query.push_str(" WHERE id = ?");

    let mut statement = sqlx::query(&query)
        .bind(update.width)
        .bind(update.height)
        .bind(orientation.as_str())
        .bind(update.shot_at)
        .bind(&update.title)
        .bind(&update.description)
        .bind(Utc::now());
    if let Some(mime) = &update.mime {
        statement = statement.bind(mime);
    }
    statement.bind(id).execute(&mut *conn).await?;
    Ok(())
}

pub async fn set_shot_at(
    pool: &DbPool,
    id: i64,
    shot_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE files SET shot_at = ?, updated_at = ? WHERE id = ?")
        .bind(shot_at)
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn count_active(pool: &DbPool) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM files WHERE deleted_at IS NULL")
        .fetch_one(pool)
        .await
}

/// Keyset page of active ids strictly after `after_id`.
pub async fn active_ids_after(
    pool: &DbPool,
    after_id: i64,
    limit: i64,
) -> Result<Vec<i64>, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        "SELECT id FROM files WHERE deleted_at IS NULL AND id > ? ORDER BY id LIMIT ?",
    )
    .bind(after_id)
    .bind(limit)
    .fetch_all(pool)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_in_memory_pool;

    fn new_entry(key: &str) -> NewCatalogEntry {
        NewCatalogEntry {
            original_key: key.to_string(),
            filename: key.rsplit('/').next().unwrap_or(key).to_string(),
            ext: "jpg".to_string(),
            mime: "image/jpeg".to_string(),
            size_bytes: 1024,
            mtime: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_soft_delete_then_restore_keeps_id() {
        let pool = create_in_memory_pool().await.unwrap();
        let id = insert(&pool, &new_entry("/photos/a.jpg")).await.unwrap();

        let deleted = soft_delete(&pool, &[id]).await.unwrap();
        assert_eq!(deleted, vec![id]);

        let known = load_known(&pool).await.unwrap();
        assert!(known["/photos/a.jpg"].deleted_at.is_some());

        restore(&pool, id, 2048, Utc::now()).await.unwrap();
        let entry = find_by_id(&pool, id).await.unwrap().unwrap();
        assert!(!entry.is_deleted());
        assert_eq!(entry.size_bytes, 2048);
    }

    #[tokio::test]
    async fn test_soft_delete_is_idempotent() {
        let pool = create_in_memory_pool().await.unwrap();
        let id = insert(&pool, &new_entry("/photos/b.jpg")).await.unwrap();

        assert_eq!(soft_delete(&pool, &[id]).await.unwrap(), vec![id]);
        assert!(soft_delete(&pool, &[id]).await.unwrap().is_empty());
        assert_eq!(count_active(&pool).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_active_key_is_unique() {
        let pool = create_in_memory_pool().await.unwrap();
        insert(&pool, &new_entry("/photos/c.jpg")).await.unwrap();
        assert!(insert(&pool, &new_entry("/photos/c.jpg")).await.is_err());
    }

    #[tokio::test]
    async fn test_apply_metadata_derives_orientation() {
        let pool = create_in_memory_pool().await.unwrap();
        let id = insert(&pool, &new_entry("/photos/d.jpg")).await.unwrap();

        let mut conn = pool.acquire().await.unwrap();
        let update = MetadataUpdate {
            width: Some(600),
            height: Some(900),
            title: Some("Portrait".to_string()),
            ..Default::default()
        };
        apply_metadata(&mut conn, id, &update).await.unwrap();
        drop(conn);

        let entry = find_by_id(&pool, id).await.unwrap().unwrap();
        assert_eq!(entry.orientation, Orientation::Portrait);
        assert_eq!(entry.title.as_deref(), Some("Portrait"));
        assert_eq!(entry.mime, "image/jpeg");
    }

    #[tokio::test]
    async fn test_active_ids_after_pages_in_order() {
        let pool = create_in_memory_pool().await.unwrap();
        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(
                insert(&pool, &new_entry(&format!("/photos/{}.jpg", i)))
                    .await
                    .unwrap(),
            );
        }
        soft_delete(&pool, &[ids[1]]).await.unwrap();

        let first = active_ids_after(&pool, 0, 2).await.unwrap();
        assert_eq!(first, vec![ids[0], ids[2]]);
        let second = active_ids_after(&pool, ids[2], 10).await.unwrap();
        assert_eq!(second, vec![ids[3], ids[4]]);
    }
}
