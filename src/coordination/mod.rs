//! Ephemeral coordination state shared by workers: exclusivity flags,
//! cancellation flags, locks, counters and job status records. The
//! relational store stays authoritative; everything here may expire.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryCoordinationStore;
pub use sqlite::SqliteCoordinationStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum CoordinationError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Value at {0} is not an integer")]
    NotAnInteger(String),
    #[error("Key {0} holds a different kind of value")]
    WrongType(String),
    #[error("Coordination state lock poisoned")]
    Poisoned,
    #[error("Invalid status record: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type CoordinationResult<T> = Result<T, CoordinationError>;

/// Key-value operations with per-key expiry. Keys hold one kind of value:
/// text, list, set or hash.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn get(&self, key: &str) -> CoordinationResult<Option<String>>;

    /// Stores a text value. `None` clears any previous expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CoordinationResult<()>;

    /// Stores a text value only if the key is absent. Returns whether it was stored.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> CoordinationResult<bool>;

    /// Removes the key whatever kind of value it holds.
    async fn delete(&self, key: &str) -> CoordinationResult<()>;

    /// Atomically adds `delta` to an integer value (missing counts as 0).
    async fn incr_by(&self, key: &str, delta: i64) -> CoordinationResult<i64>;

    async fn expire(&self, key: &str, ttl: Duration) -> CoordinationResult<()>;

    /// Appends to a list, returning its new length.
    async fn list_push(&self, key: &str, values: &[String]) -> CoordinationResult<u64>;

    async fn list_range(
        &self,
        key: &str,
        start: usize,
        count: usize,
    ) -> CoordinationResult<Vec<String>>;

    async fn list_len(&self, key: &str) -> CoordinationResult<u64>;

    /// Adds a set member. Returns true when it was not already present.
    async fn set_add(&self, key: &str, member: &str) -> CoordinationResult<bool>;

    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> CoordinationResult<()>;

    async fn hash_get_all(&self, key: &str) -> CoordinationResult<HashMap<String, String>>;

    /// Drops every expired key, returning how many were removed.
    async fn sweep_expired(&self) -> CoordinationResult<u64>;
}

pub const PREVIEW_EXCLUSIVE_KEY: &str = "preview:exclusive";
pub const BACKFILL_LOCK_KEY: &str = "lock:backfill_shot_at";
const REINDEX_COMPLETED_KEY: &str = "reindex:completed";
const REINDEX_TOTAL_KEY: &str = "reindex:total";

const PREVIEW_EXCLUSIVE_TTL: Duration = Duration::from_secs(6 * 60 * 60);
const CANCEL_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const BACKFILL_LOCK_TTL: Duration = Duration::from_secs(2 * 60 * 60);
const STATUS_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const COUNTER_TTL: Duration = Duration::from_secs(24 * 60 * 60);

fn cancel_key(run_id: i64) -> String {
    format!("index:cancel:{}", run_id)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    #[default]
    Idle,
    Queued,
    Running,
    Completed,
    Failed,
}

/// A status blob one job family publishes with a bounded TTL.
pub trait StatusRecord: Serialize + DeserializeOwned + Default + Send + Sync {
    const KEY: &'static str;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreviewRefreshStatus {
    pub status: JobState,
    pub round: u32,
    pub max_rounds: u32,
    pub total_files: i64,
    pub total_previews: i64,
    pub missing_previews: i64,
    pub progress: f64,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl StatusRecord for PreviewRefreshStatus {
    const KEY: &'static str = "status:preview_refresh";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrphanCleanupStatus {
    pub status: JobState,
    pub total: u64,
    pub processed: u64,
    pub deleted: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl StatusRecord for OrphanCleanupStatus {
    const KEY: &'static str = "status:orphan_cleanup";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReindexStatus {
    pub status: JobState,
    pub total: i64,
    pub completed: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl StatusRecord for ReindexStatus {
    const KEY: &'static str = "status:reindex";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackfillStatus {
    pub status: JobState,
    pub total: u64,
    pub processed: u64,
    pub updated: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl StatusRecord for BackfillStatus {
    const KEY: &'static str = "status:backfill_shot_at";
}

/// Typed access to the coordination keys used by the jobs.
#[derive(Clone)]
pub struct Coordinator {
    store: Arc<dyn CoordinationStore>,
}

impl Coordinator {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    pub async fn preview_exclusive(&self) -> CoordinationResult<bool> {
        Ok(self.store.get(PREVIEW_EXCLUSIVE_KEY).await?.is_some())
    }

    pub async fn set_preview_exclusive(&self, enabled: bool) -> CoordinationResult<()> {
        if enabled {
            self.store
                .set(PREVIEW_EXCLUSIVE_KEY, "1", Some(PREVIEW_EXCLUSIVE_TTL))
                .await
        } else {
            self.store.delete(PREVIEW_EXCLUSIVE_KEY).await
        }
    }

    pub async fn request_cancel(&self, run_id: i64) -> CoordinationResult<()> {
        self.store
            .set(&cancel_key(run_id), "1", Some(CANCEL_TTL))
            .await
    }

    pub async fn is_cancelled(&self, run_id: i64) -> CoordinationResult<bool> {
        Ok(self.store.get(&cancel_key(run_id)).await?.is_some())
    }

    pub async fn clear_cancel(&self, run_id: i64) -> CoordinationResult<()> {
        self.store.delete(&cancel_key(run_id)).await
    }

    /// Time-boxed mutual exclusion. Returns false when someone else holds it.
    pub async fn try_lock(&self, key: &str, ttl: Duration) -> CoordinationResult<bool> {
        let token = Utc::now().timestamp_millis().to_string();
        self.store.set_nx(key, &token, ttl).await
    }

    pub async fn unlock(&self, key: &str) -> CoordinationResult<()> {
        self.store.delete(key).await
    }

    /// Acquires the backfill lock. A held lock whose status shows no total and
    /// no progress is presumed left behind by a crashed worker and is taken over.
    pub async fn acquire_backfill_lock(&self) -> CoordinationResult<bool> {
        if self.try_lock(BACKFILL_LOCK_KEY, BACKFILL_LOCK_TTL).await? {
            return Ok(true);
        }

        let status = self.status::<BackfillStatus>().await?.unwrap_or_default();
        if status.processed == 0 && status.total == 0 {
            warn!("Backfill lock looks stuck (no recorded progress), clearing it");
            self.unlock(BACKFILL_LOCK_KEY).await?;
            return self.try_lock(BACKFILL_LOCK_KEY, BACKFILL_LOCK_TTL).await;
        }

        debug!(
            "Backfill lock held, {} of {} processed",
            status.processed, status.total
        );
        Ok(false)
    }

    pub async fn publish<S: StatusRecord>(&self, record: &S) -> CoordinationResult<()> {
        let payload = serde_json::to_string(record)?;
        self.store.set(S::KEY, &payload, Some(STATUS_TTL)).await
    }

    /// The last published record, or `None` (idle) once it expired.
    pub async fn status<S: StatusRecord>(&self) -> CoordinationResult<Option<S>> {
        match self.store.get(S::KEY).await? {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    pub async fn reset_reindex_counters(&self, total: i64) -> CoordinationResult<()> {
        self.store
            .set(REINDEX_TOTAL_KEY, &total.to_string(), Some(COUNTER_TTL))
            .await?;
        self.store
            .set(REINDEX_COMPLETED_KEY, "0", Some(COUNTER_TTL))
            .await
    }

    pub async fn add_reindex_completed(&self, count: i64) -> CoordinationResult<i64> {
        self.store.incr_by(REINDEX_COMPLETED_KEY, count).await
    }

    /// `(completed, total)` of the current full reindex.
    pub async fn reindex_progress(&self) -> CoordinationResult<(i64, i64)> {
        let read = |value: Option<String>, key: &str| -> CoordinationResult<i64> {
            match value {
                Some(raw) => raw
                    .parse()
                    .map_err(|_| CoordinationError::NotAnInteger(key.to_string())),
                None => Ok(0),
            }
        };
        let completed = read(
            self.store.get(REINDEX_COMPLETED_KEY).await?,
            REINDEX_COMPLETED_KEY,
        )?;
        let total = read(self.store.get(REINDEX_TOTAL_KEY).await?, REINDEX_TOTAL_KEY)?;
        Ok((completed, total))
    }
}
