//! Background jobs: one tagged payload per job type, a shared context, and
//! the dispatcher the worker runs claimed jobs through.

pub mod admin;
pub mod async_search;
pub mod metadata;
pub mod previews;
pub mod queue;
pub mod scanner;
pub mod search_sync;
pub mod worker;

pub use queue::{ClaimedJob, JobQueue, QueueCounts, SqliteJobQueue};
pub use worker::Worker;

use log::debug;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, CoordinationBackend, SearchBackend};
use crate::coordination::{
    CoordinationError, CoordinationStore, Coordinator, MemoryCoordinationStore,
    SqliteCoordinationStore,
};
use crate::db::DbPool;
use crate::metadata_extractor::{ExifToolProbe, MetadataProbe};
use crate::preview_renderer::{
    FallbackRenderer, FfmpegRenderer, ImageRenderer, PreviewError, PreviewRenderer,
};
use crate::search::{MeiliSearchClient, MemorySearchIndex, SearchError, SearchIndex};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Job {
    ScanStorage { run_id: i64 },
    ExtractMetadata { file_id: i64 },
    GeneratePreview { file_id: i64 },
    UpsertSearchDoc { file_id: i64 },
    RemoveSearchDoc { file_id: i64 },
    StartReindex,
    ReindexChunk { file_ids: Vec<i64> },
    GcPreviews,
    CleanupOrphanPreviews,
    RefreshPreviewsCycle { round: u32, max_rounds: u32 },
    QueueMissingMetadata,
    QueueMissingPreviews,
    BackfillShotAt,
    AsyncSearchScatter { job_id: String },
    CancelIndexRun { run_id: i64 },
}

impl Job {
    pub fn kind(&self) -> &'static str {
        match self {
            Job::ScanStorage { .. } => "scan_storage",
            Job::ExtractMetadata { .. } => "extract_metadata",
            Job::GeneratePreview { .. } => "generate_preview",
            Job::UpsertSearchDoc { .. } => "upsert_search_doc",
            Job::RemoveSearchDoc { .. } => "remove_search_doc",
            Job::StartReindex => "start_reindex",
            Job::ReindexChunk { .. } => "reindex_chunk",
            Job::GcPreviews => "gc_previews",
            Job::CleanupOrphanPreviews => "cleanup_orphan_previews",
            Job::RefreshPreviewsCycle { .. } => "refresh_previews_cycle",
            Job::QueueMissingMetadata => "queue_missing_metadata",
            Job::QueueMissingPreviews => "queue_missing_previews",
            Job::BackfillShotAt => "backfill_shot_at",
            Job::AsyncSearchScatter { .. } => "async_search_scatter",
            Job::CancelIndexRun { .. } => "cancel_index_run",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Coordination error: {0}")]
    Coordination(#[from] CoordinationError),
    #[error("Search error: {0}")]
    Search(#[from] SearchError),
    #[error("Preview error: {0}")]
    Preview(#[from] PreviewError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid job payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("Index run {0} was cancelled")]
    Cancelled(i64),
    #[error("Index run {0} is not running")]
    NotRunning(i64),
    #[error("No index run recorded")]
    NoIndexRun,
    #[error("File {0} not found")]
    NotFound(i64),
}

impl JobError {
    /// Whether redelivering the job could succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            JobError::Cancelled(_)
                | JobError::NotRunning(_)
                | JobError::NoIndexRun
                | JobError::NotFound(_)
                | JobError::Payload(_)
        )
    }
}

pub type JobResult<T> = Result<T, JobError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// Rescheduled itself after the given delay instead of running.
    Deferred(Duration),
    /// Nothing to do (entry gone, lock held, root missing...).
    Skipped(&'static str),
}

/// Everything a job needs. Cheap to clone; all handles are shared.
#[derive(Clone)]
pub struct JobContext {
    pub pool: DbPool,
    pub config: Arc<Config>,
    pub queue: Arc<dyn JobQueue>,
    pub coordinator: Coordinator,
    pub search: Arc<dyn SearchIndex>,
    pub probe: Arc<dyn MetadataProbe>,
    pub renderer: Arc<dyn PreviewRenderer>,
}

impl JobContext {
    /// Wires the production collaborators selected by `config`.
    pub fn from_config(pool: DbPool, config: Config, queue: Arc<dyn JobQueue>) -> Self {
        let store: Arc<dyn CoordinationStore> = match config.coordination_backend {
            CoordinationBackend::Sqlite => Arc::new(SqliteCoordinationStore::new(pool.clone())),
            CoordinationBackend::Memory => Arc::new(MemoryCoordinationStore::new()),
        };
        let search: Arc<dyn SearchIndex> = match config.search.backend {
            SearchBackend::Meili => Arc::new(MeiliSearchClient::new(&config.search)),
            SearchBackend::Memory => Arc::new(MemorySearchIndex::new(config.search.max_total_hits)),
        };
        let probe = Arc::new(ExifToolProbe::new(
            config.exiftool_path.clone(),
            config.probe_timeout,
        ));
        let renderer = Arc::new(FallbackRenderer::new(
            Box::new(ImageRenderer),
            Box::new(FfmpegRenderer::new(config.previews.ffmpeg_path.clone())),
        ));

        Self {
            pool,
            config: Arc::new(config),
            queue,
            coordinator: Coordinator::new(store),
            search,
            probe,
            renderer,
        }
    }

    pub async fn enqueue(&self, job: Job) -> JobResult<i64> {
        self.queue.enqueue(job, None).await
    }

    pub async fn enqueue_in(&self, job: Job, delay: Duration) -> JobResult<i64> {
        self.queue.enqueue(job, Some(delay)).await
    }

    /// Re-enqueues `job` after the configured backoff when a preview refresh
    /// cycle holds the catalog. Returns the deferral outcome if it did.
    pub(crate) async fn defer_if_exclusive(&self, job: &Job) -> JobResult<Option<JobOutcome>> {
        if !self.coordinator.preview_exclusive().await? {
            return Ok(None);
        }
        let delay = self.config.defer_delay;
        debug!("Deferring {} by {:?}: preview refresh is exclusive", job.kind(), delay);
        self.enqueue_in(job.clone(), delay).await?;
        Ok(Some(JobOutcome::Deferred(delay)))
    }
}

/// Runs one job to completion.
pub async fn dispatch(ctx: &JobContext, job: &Job) -> JobResult<JobOutcome> {
    match job {
        Job::ScanStorage { run_id } => scanner::scan_storage(ctx, *run_id).await,
        Job::ExtractMetadata { file_id } => metadata::extract_metadata(ctx, *file_id).await,
        Job::GeneratePreview { file_id } => previews::generate_preview(ctx, *file_id).await,
        Job::UpsertSearchDoc { file_id } => search_sync::upsert_search_doc(ctx, *file_id).await,
        Job::RemoveSearchDoc { file_id } => search_sync::remove_search_doc(ctx, *file_id).await,
        Job::StartReindex => search_sync::start_reindex(ctx).await,
        Job::ReindexChunk { file_ids } => search_sync::reindex_chunk(ctx, file_ids).await,
        Job::GcPreviews => previews::gc_previews(ctx).await,
        Job::CleanupOrphanPreviews => previews::cleanup_orphan_previews(ctx).await,
        Job::RefreshPreviewsCycle { round, max_rounds } => {
            previews::refresh_previews_cycle(ctx, *round, *max_rounds).await
        }
        Job::QueueMissingMetadata => metadata::queue_missing_metadata(ctx).await,
        Job::QueueMissingPreviews => previews::queue_missing_previews(ctx).await,
        Job::BackfillShotAt => metadata::backfill_shot_at(ctx).await,
        Job::AsyncSearchScatter { job_id } => async_search::scatter(ctx, job_id).await,
        Job::CancelIndexRun { run_id } => admin::cancel_index_run(ctx, Some(*run_id))
            .await
            .map(|_| JobOutcome::Completed),
    }
}
