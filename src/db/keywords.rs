use super::models::Keyword;
use chrono::Utc;
use sqlx::SqliteConnection;

/// Returns the keyword for `value_norm`, creating it with `value_display` and a
/// zero count if absent. An existing keyword keeps its first-seen display form.
pub async fn get_or_create(
    conn: &mut SqliteConnection,
    value_norm: &str,
    value_display: &str,
) -> Result<Keyword, sqlx::Error> {
    sqlx::query(
        "INSERT INTO keywords (value_norm, value_display, usage_count, created_at)
         VALUES (?, ?, 0, ?)
         ON CONFLICT(value_norm) DO NOTHING",
    )
    .bind(value_norm)
    .bind(value_display)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;

    sqlx::query_as::<_, Keyword>("SELECT * FROM keywords WHERE value_norm = ?")
        .bind(value_norm)
        .fetch_one(&mut *conn)
        .await
}

pub async fn for_file(
    conn: &mut SqliteConnection,
    file_id: i64,
) -> Result<Vec<Keyword>, sqlx::Error> {
    sqlx::query_as::<_, Keyword>(
        "SELECT k.* FROM keywords k
         JOIN file_keywords fk ON fk.keyword_id = k.id
         WHERE fk.file_id = ?
         ORDER BY k.value_norm",
    )
    .bind(file_id)
    .fetch_all(&mut *conn)
    .await
}

/// Links a keyword to a file and counts the new reference. Already linked is a no-op.
pub async fn attach(
    conn: &mut SqliteConnection,
    file_id: i64,
    keyword_id: i64,
) -> Result<(), sqlx::Error> {
    let result =
        sqlx::query("INSERT OR IGNORE INTO file_keywords (file_id, keyword_id) VALUES (?, ?)")
            .bind(file_id)
            .bind(keyword_id)
            .execute(&mut *conn)
            .await?;
    if result.rows_affected() > 0 {
        increment(conn, keyword_id).await?;
    }
    Ok(())
}

pub async fn detach(
    conn: &mut SqliteConnection,
    file_id: i64,
    keyword_id: i64,
) -> Result<(), sqlx::Error> {
    let result = sqlx::query("DELETE FROM file_keywords WHERE file_id = ? AND keyword_id = ?")
        .bind(file_id)
        .bind(keyword_id)
        .execute(&mut *conn)
        .await?;
    if result.rows_affected() > 0 {
        decrement(conn, keyword_id).await?;
    }
    Ok(())
}

pub async fn increment(conn: &mut SqliteConnection, keyword_id: i64) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE keywords SET usage_count = usage_count + 1 WHERE id = ?")
        .bind(keyword_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Floors at zero.
pub async fn decrement(conn: &mut SqliteConnection, keyword_id: i64) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE keywords SET usage_count = MAX(usage_count - 1, 0) WHERE id = ?")
        .bind(keyword_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Adjusts the count of every keyword attached to `file_id` by `delta` (+1 or -1).
pub async fn shift_counts_for_file(
    conn: &mut SqliteConnection,
    file_id: i64,
    delta: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE keywords SET usage_count = MAX(usage_count + ?, 0)
         WHERE id IN (SELECT keyword_id FROM file_keywords WHERE file_id = ?)",
    )
    .bind(delta)
    .bind(file_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Normalized keyword values per file, for evaluating queries against many files at once.
pub async fn norms_for_files(
    conn: &mut SqliteConnection,
    file_ids: &[i64],
) -> Result<Vec<(i64, String)>, sqlx::Error> {
    if file_ids.is_empty() {
        return Ok(Vec::new());
    }

    let placeholders = vec!["?"; file_ids.len()].join(",");
    let sql = format!(
        "SELECT fk.file_id, k.value_norm FROM file_keywords fk
         JOIN keywords k ON k.id = fk.keyword_id
         WHERE fk.file_id IN ({})",
        placeholders
    );

    let mut query = sqlx::query_as::<_, (i64, String)>(&sql);
    for id in file_ids {
        query = query.bind(id);
    }
    query.fetch_all(&mut *conn).await
}

/// Number of keywords whose count differs from the active files referencing them.
pub async fn count_mismatches(conn: &mut SqliteConnection) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM keywords k
         WHERE k.usage_count != (
             SELECT COUNT(*) FROM file_keywords fk
             JOIN files f ON f.id = fk.file_id
             WHERE fk.keyword_id = k.id AND f.deleted_at IS NULL
         )",
    )
    .fetch_one(&mut *conn)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_in_memory_pool;

    #[tokio::test]
    async fn test_get_or_create_keeps_first_display() {
        let pool = create_in_memory_pool().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();

        let first = get_or_create(&mut conn, "sunset", "Sunset").await.unwrap();
        let second = get_or_create(&mut conn, "sunset", "SUNSET").await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.value_display, "Sunset");
        assert_eq!(second.usage_count, 0);
    }

    #[tokio::test]
    async fn test_decrement_floors_at_zero() {
        let pool = create_in_memory_pool().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();

        let keyword = get_or_create(&mut conn, "sea", "sea").await.unwrap();
        increment(&mut conn, keyword.id).await.unwrap();
        decrement(&mut conn, keyword.id).await.unwrap();
        decrement(&mut conn, keyword.id).await.unwrap();

        let reloaded = get_or_create(&mut conn, "sea", "sea").await.unwrap();
        assert_eq!(reloaded.usage_count, 0);
    }
}
