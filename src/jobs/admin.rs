//! Operator entry points: each validates, records what it is about to do, and
//! hands the actual work to the queue.

use chrono::Utc;
use log::info;
use serde::Serialize;

use super::previews::refresh_status;
use super::{Job, JobContext, JobError, JobResult};
use crate::coordination::{JobState, OrphanCleanupStatus, PreviewRefreshStatus, ReindexStatus};
use crate::db::previews::PreviewCounts;
use crate::db::{files, index_runs, previews, IndexRun, IndexRunStatus};

#[derive(Debug, Clone, Serialize)]
pub struct IndexStatus {
    pub files: i64,
    pub run: Option<IndexRun>,
}

/// The preview refresh record merged with live counts.
#[derive(Debug, Clone, Serialize)]
pub struct PreviewStatus {
    pub status: JobState,
    pub round: u32,
    pub max_rounds: u32,
    #[serde(flatten)]
    pub counts: PreviewCounts,
}

/// Starts a full index run: scan, backfill whatever metadata and previews
/// are missing, and rebuild the search index once the dust settles.
pub async fn refresh_all(ctx: &JobContext) -> JobResult<i64> {
    let run = index_runs::create(&ctx.pool).await?;
    ctx.enqueue(Job::ScanStorage { run_id: run.id }).await?;
    ctx.enqueue(Job::QueueMissingMetadata).await?;
    ctx.enqueue(Job::QueueMissingPreviews).await?;
    ctx.enqueue_in(Job::StartReindex, ctx.config.reindex_delay).await?;
    info!("Index run {} queued", run.id);
    Ok(run.id)
}

/// Flags a running index run for cancellation; the scanner notices at its
/// next poll. Without `run_id` the latest run is targeted.
pub async fn cancel_index_run(ctx: &JobContext, run_id: Option<i64>) -> JobResult<i64> {
    let run = match run_id {
        Some(id) => index_runs::find(&ctx.pool, id)
            .await?
            .ok_or(JobError::NotRunning(id))?,
        None => index_runs::latest(&ctx.pool)
            .await?
            .ok_or(JobError::NoIndexRun)?,
    };
    if run.status != IndexRunStatus::Running {
        return Err(JobError::NotRunning(run.id));
    }

    ctx.coordinator.request_cancel(run.id).await?;
    info!("Cancellation requested for index run {}", run.id);
    Ok(run.id)
}

/// Queues cancellation of the latest run after checking it is running.
pub async fn request_cancel_latest(ctx: &JobContext) -> JobResult<i64> {
    let run = index_runs::latest(&ctx.pool)
        .await?
        .ok_or(JobError::NoIndexRun)?;
    if run.status != IndexRunStatus::Running {
        return Err(JobError::NotRunning(run.id));
    }
    ctx.enqueue(Job::CancelIndexRun { run_id: run.id }).await?;
    Ok(run.id)
}

pub async fn index_status(ctx: &JobContext) -> JobResult<IndexStatus> {
    let files = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM files")
        .fetch_one(&ctx.pool)
        .await?;
    let run = index_runs::latest(&ctx.pool).await?;
    Ok(IndexStatus { files, run })
}

/// Takes the catalog for a bulk preview pass. Metadata and search jobs defer
/// until the cycle releases it.
pub async fn refresh_previews(ctx: &JobContext) -> JobResult<()> {
    let max_rounds = ctx.config.previews.check_rounds.max(1);
    let counts = previews::counts(&ctx.pool).await?;

    ctx.coordinator.set_preview_exclusive(true).await?;
    ctx.coordinator
        .publish(&refresh_status(
            JobState::Running,
            1,
            max_rounds,
            &counts,
            Some(Utc::now()),
        ))
        .await?;
    ctx.enqueue(Job::RefreshPreviewsCycle {
        round: 1,
        max_rounds,
    })
    .await?;

    info!(
        "Preview refresh started: {} of {} previews missing",
        counts.missing_previews, counts.total_files
    );
    Ok(())
}

pub async fn preview_status(ctx: &JobContext) -> JobResult<PreviewStatus> {
    let record = ctx
        .coordinator
        .status::<PreviewRefreshStatus>()
        .await?
        .unwrap_or_default();
    let counts = previews::counts(&ctx.pool).await?;
    Ok(PreviewStatus {
        status: record.status,
        round: record.round,
        max_rounds: record.max_rounds,
        counts,
    })
}

pub async fn request_orphan_cleanup(ctx: &JobContext) -> JobResult<()> {
    let now = Utc::now();
    ctx.coordinator
        .publish(&OrphanCleanupStatus {
            status: JobState::Queued,
            started_at: Some(now),
            updated_at: Some(now),
            ..Default::default()
        })
        .await?;
    ctx.enqueue(Job::CleanupOrphanPreviews).await?;
    Ok(())
}

pub async fn orphan_status(ctx: &JobContext) -> JobResult<OrphanCleanupStatus> {
    Ok(ctx
        .coordinator
        .status::<OrphanCleanupStatus>()
        .await?
        .unwrap_or_default())
}

/// The reindex record, with counts read from the live counters.
pub async fn reindex_status(ctx: &JobContext) -> JobResult<ReindexStatus> {
    let mut status = ctx
        .coordinator
        .status::<ReindexStatus>()
        .await?
        .unwrap_or_default();
    let (completed, total) = ctx.coordinator.reindex_progress().await?;
    if status.status == JobState::Running {
        status.completed = completed;
        status.total = total;
        if total > 0 && completed >= total {
            status.status = JobState::Completed;
        }
    }
    Ok(status)
}

/// Queues a fresh metadata extraction for one active entry.
pub async fn reextract(ctx: &JobContext, file_id: i64) -> JobResult<()> {
    match files::find_by_id(&ctx.pool, file_id).await? {
        Some(entry) if !entry.is_deleted() => {
            ctx.enqueue(Job::ExtractMetadata { file_id }).await?;
            Ok(())
        }
        _ => Err(JobError::NotFound(file_id)),
    }
}
