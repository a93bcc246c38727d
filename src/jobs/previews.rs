use chrono::Utc;
use log::{debug, info, warn};
use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::{Job, JobContext, JobOutcome, JobResult};
use crate::coordination::{JobState, OrphanCleanupStatus, PreviewRefreshStatus};
use crate::db::previews::PreviewCounts;
use crate::db::{files, previews};
use crate::preview_renderer::{write_preview, PreviewError};

const ORPHAN_PUBLISH_EVERY: u64 = 100;

/// Renders and stores the preview of one active entry.
pub async fn generate_preview(ctx: &JobContext, file_id: i64) -> JobResult<JobOutcome> {
    let entry = match files::find_by_id(&ctx.pool, file_id).await? {
        Some(entry) if !entry.is_deleted() => entry,
        _ => {
            debug!("File {} gone or deleted, no preview", file_id);
            return Ok(JobOutcome::Skipped("file not found"));
        }
    };

    let renderer = ctx.renderer.clone();
    let source = PathBuf::from(&entry.original_key);
    let max_dimension = ctx.config.previews.max_dimension;
    let quality = ctx.config.previews.quality;

    let rendered =
        tokio::task::spawn_blocking(move || renderer.render(&source, max_dimension, quality))
            .await?;
    let data = match rendered {
        Ok(data) => data,
        Err(PreviewError::SourceMissing(path)) => {
            debug!("Preview source {} vanished", path.display());
            return Ok(JobOutcome::Skipped("source missing"));
        }
        Err(e) => return Err(e.into()),
    };

    let target = write_preview(&ctx.config.previews.previews_root, file_id, &data).await?;
    let key = target.to_string_lossy();
    previews::upsert(&ctx.pool, file_id, &key, &key).await?;

    debug!("Preview for file {} written to {}", file_id, key);
    Ok(JobOutcome::Completed)
}

async fn remove_file_if_present(path: &Path) -> std::io::Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Removes `dir` if it is empty; anything else is left alone.
async fn remove_dir_if_empty(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir(dir).await {
        debug!("Keeping {}: {}", dir.display(), e);
    }
}

/// Deletes previews owned by soft-deleted entries, record and files alike.
pub async fn gc_previews(ctx: &JobContext) -> JobResult<JobOutcome> {
    let orphaned = previews::owned_by_deleted(&ctx.pool).await?;
    let mut removed = 0usize;

    for preview in &orphaned {
        let keys: BTreeSet<&str> = [preview.thumb_key.as_str(), preview.medium_key.as_str()]
            .into_iter()
            .filter(|key| !key.is_empty())
            .collect();

        for key in &keys {
            let path = Path::new(key);
            if let Err(e) = remove_file_if_present(path).await {
                warn!("Failed to remove preview {}: {}", path.display(), e);
            }
        }
        if let Some(dir) = Path::new(&preview.thumb_key).parent() {
            remove_dir_if_empty(dir).await;
        }

        previews::delete(&ctx.pool, preview.file_id).await?;
        removed += 1;
    }

    info!("Preview GC removed {} previews of deleted files", removed);
    Ok(JobOutcome::Completed)
}

/// Walks the preview store and deletes every file no preview record points at.
pub async fn cleanup_orphan_previews(ctx: &JobContext) -> JobResult<JobOutcome> {
    let root = ctx.config.previews.previews_root.clone();
    let started_at = Utc::now();
    let mut status = OrphanCleanupStatus {
        status: JobState::Running,
        started_at: Some(started_at),
        updated_at: Some(started_at),
        ..Default::default()
    };

    let candidates: Vec<PathBuf> = if root.exists() {
        let walk_root = root.clone();
        tokio::task::spawn_blocking(move || {
            WalkDir::new(walk_root)
                .follow_links(false)
                .into_iter()
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().is_file())
                .map(|entry| entry.into_path())
                .collect()
        })
        .await?
    } else {
        Vec::new()
    };

    let referenced = previews::referenced_keys(&ctx.pool).await?;
    status.total = candidates.len() as u64;
    ctx.coordinator.publish(&status).await?;

    for path in candidates {
        if !referenced.contains(path.to_string_lossy().as_ref()) {
            match remove_file_if_present(&path).await {
                Ok(true) => {
                    status.deleted += 1;
                    if let Some(dir) = path.parent() {
                        if dir != root.as_path() {
                            remove_dir_if_empty(dir).await;
                        }
                    }
                }
                Ok(false) => {}
                Err(e) => warn!("Failed to remove orphan {}: {}", path.display(), e),
            }
        }

        status.processed += 1;
        if status.processed % ORPHAN_PUBLISH_EVERY == 0 {
            status.updated_at = Some(Utc::now());
            ctx.coordinator.publish(&status).await?;
        }
    }

    status.status = JobState::Completed;
    status.updated_at = Some(Utc::now());
    ctx.coordinator.publish(&status).await?;

    info!(
        "Orphan cleanup: {} of {} preview files deleted",
        status.deleted, status.total
    );
    Ok(JobOutcome::Completed)
}

/// Enqueues preview generation for active entries without a preview.
pub async fn queue_missing_previews(ctx: &JobContext) -> JobResult<JobOutcome> {
    let mut ids: Vec<i64> = files::ids_missing_preview(&ctx.pool).await?.into_iter().collect();
    ids.sort_unstable();
    for file_id in &ids {
        ctx.enqueue(Job::GeneratePreview { file_id: *file_id }).await?;
    }
    info!("Queued preview generation for {} files", ids.len());
    Ok(JobOutcome::Completed)
}

pub(crate) fn refresh_status(
    state: JobState,
    round: u32,
    max_rounds: u32,
    counts: &PreviewCounts,
    started_at: Option<chrono::DateTime<Utc>>,
) -> PreviewRefreshStatus {
    PreviewRefreshStatus {
        status: state,
        round,
        max_rounds,
        total_files: counts.total_files,
        total_previews: counts.total_previews,
        missing_previews: counts.missing_previews,
        progress: counts.progress,
        started_at,
        updated_at: Some(Utc::now()),
    }
}

/// One round of a preview refresh. Rounds `1..=max_rounds` queue whatever is
/// missing and check back after the configured delay; the cycle ends early
/// once nothing is missing. Ending clears the exclusivity flag.
pub async fn refresh_previews_cycle(
    ctx: &JobContext,
    round: u32,
    max_rounds: u32,
) -> JobResult<JobOutcome> {
    let counts = previews::counts(&ctx.pool).await?;
    let started_at = if round <= 1 {
        Some(Utc::now())
    } else {
        ctx.coordinator
            .status::<PreviewRefreshStatus>()
            .await?
            .and_then(|status| status.started_at)
            .or_else(|| Some(Utc::now()))
    };

    if counts.missing_previews == 0 || round > max_rounds {
        ctx.coordinator.set_preview_exclusive(false).await?;
        ctx.coordinator
            .publish(&refresh_status(
                JobState::Completed,
                round.min(max_rounds),
                max_rounds,
                &counts,
                started_at,
            ))
            .await?;
        if counts.missing_previews > 0 {
            warn!(
                "Preview refresh gave up after {} rounds with {} previews missing",
                max_rounds, counts.missing_previews
            );
        } else {
            info!("Preview refresh complete after round {}", round);
        }
        return Ok(JobOutcome::Completed);
    }

    ctx.coordinator.set_preview_exclusive(true).await?;
    ctx.coordinator
        .publish(&refresh_status(
            JobState::Running,
            round,
            max_rounds,
            &counts,
            started_at,
        ))
        .await?;

    queue_missing_previews(ctx).await?;
    ctx.enqueue_in(
        Job::RefreshPreviewsCycle {
            round: round + 1,
            max_rounds,
        },
        ctx.config.previews.check_delay,
    )
    .await?;

    info!(
        "Preview refresh round {}/{}: {} of {} missing",
        round, max_rounds, counts.missing_previews, counts.total_files
    );
    Ok(JobOutcome::Completed)
}
