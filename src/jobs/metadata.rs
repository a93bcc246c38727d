use chrono::Utc;
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use super::{Job, JobContext, JobOutcome, JobResult};
use crate::coordination::{BackfillStatus, JobState, BACKFILL_LOCK_KEY};
use crate::db::{files, keywords, CatalogEntry};
use crate::db::files::MetadataUpdate;
use crate::keywords::dedupe_keywords;

const BACKFILL_PUBLISH_EVERY: u64 = 50;

/// Keyword membership changes made by one reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeywordDelta {
    pub added: usize,
    pub removed: usize,
}

async fn load_active(ctx: &JobContext, file_id: i64) -> JobResult<Option<CatalogEntry>> {
    Ok(files::find_by_id(&ctx.pool, file_id)
        .await?
        .filter(|entry| !entry.is_deleted()))
}

/// Probes one file and reconciles its metadata and keyword set, then fans
/// out preview generation and a search upsert.
pub async fn extract_metadata(ctx: &JobContext, file_id: i64) -> JobResult<JobOutcome> {
    let job = Job::ExtractMetadata { file_id };
    if let Some(deferred) = ctx.defer_if_exclusive(&job).await? {
        return Ok(deferred);
    }

    let Some(entry) = load_active(ctx, file_id).await? else {
        debug!("File {} gone or deleted, skipping metadata", file_id);
        return Ok(JobOutcome::Skipped("file not found"));
    };

    let path = PathBuf::from(&entry.original_key);
    if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
        debug!("{} vanished before metadata extraction", path.display());
        return Ok(JobOutcome::Skipped("file missing on disk"));
    }

    let extracted = ctx.probe.extract(&path).await;
    let update = MetadataUpdate {
        mime: extracted.mime,
        width: extracted.width,
        height: extracted.height,
        shot_at: extracted.shot_at.or(entry.shot_at),
        title: extracted.title,
        description: extracted.description,
    };
    let wanted = dedupe_keywords(&extracted.keywords);

    let Some(delta) = reconcile(ctx, file_id, &update, &wanted).await? else {
        return Ok(JobOutcome::Skipped("file deleted during extraction"));
    };

    ctx.enqueue(Job::GeneratePreview { file_id }).await?;
    ctx.enqueue(Job::UpsertSearchDoc { file_id }).await?;

    info!(
        "Metadata for file {}: {} keywords added, {} removed",
        file_id, delta.added, delta.removed
    );
    Ok(JobOutcome::Completed)
}

/// Writes metadata and replaces the keyword set in one transaction. New
/// associations count up, dropped ones count down, kept ones are untouched.
/// Returns `None` if the entry is no longer active.
pub async fn reconcile(
    ctx: &JobContext,
    file_id: i64,
    update: &MetadataUpdate,
    wanted: &[(String, String)],
) -> JobResult<Option<KeywordDelta>> {
    let mut tx = ctx.pool.begin().await?;

    if !files::touch_active(&mut tx, file_id).await? {
        tx.rollback().await?;
        return Ok(None);
    }
    files::apply_metadata(&mut tx, file_id, update).await?;

    let current: HashMap<String, i64> = keywords::for_file(&mut tx, file_id)
        .await?
        .into_iter()
        .map(|keyword| (keyword.value_norm, keyword.id))
        .collect();
    let wanted_norms: HashSet<&str> = wanted.iter().map(|(norm, _)| norm.as_str()).collect();

    let mut delta = KeywordDelta::default();
    for (norm, display) in wanted {
        if current.contains_key(norm) {
            continue;
        }
        let keyword = keywords::get_or_create(&mut tx, norm, display).await?;
        keywords::attach(&mut tx, file_id, keyword.id).await?;
        delta.added += 1;
    }
    for (norm, keyword_id) in &current {
        if !wanted_norms.contains(norm.as_str()) {
            keywords::detach(&mut tx, file_id, *keyword_id).await?;
            delta.removed += 1;
        }
    }

    tx.commit().await?;
    Ok(Some(delta))
}

/// Enqueues extraction for active entries missing keywords, title or description.
pub async fn queue_missing_metadata(ctx: &JobContext) -> JobResult<JobOutcome> {
    let ids = files::ids_missing_metadata(&ctx.pool).await?;
    for file_id in &ids {
        ctx.enqueue(Job::ExtractMetadata { file_id: *file_id }).await?;
    }
    info!("Queued metadata extraction for {} files", ids.len());
    Ok(JobOutcome::Completed)
}

/// Fills in missing capture times with a timestamp-only probe. Serialized
/// through the backfill lock.
pub async fn backfill_shot_at(ctx: &JobContext) -> JobResult<JobOutcome> {
    if !ctx.coordinator.acquire_backfill_lock().await? {
        info!("Capture-time backfill already running, skipping");
        return Ok(JobOutcome::Skipped("backfill already running"));
    }

    let started_at = Utc::now();
    let result = run_backfill(ctx, started_at).await;

    if result.is_err() {
        let failed = BackfillStatus {
            status: JobState::Failed,
            started_at: Some(started_at),
            updated_at: Some(Utc::now()),
            ..ctx.coordinator.status::<BackfillStatus>().await?.unwrap_or_default()
        };
        ctx.coordinator.publish(&failed).await?;
    }
    ctx.coordinator.unlock(BACKFILL_LOCK_KEY).await?;
    result
}

async fn run_backfill(
    ctx: &JobContext,
    started_at: chrono::DateTime<Utc>,
) -> JobResult<JobOutcome> {
    let ids = files::ids_missing_shot_at(&ctx.pool).await?;
    let mut status = BackfillStatus {
        status: JobState::Running,
        total: ids.len() as u64,
        processed: 0,
        updated: 0,
        started_at: Some(started_at),
        updated_at: Some(Utc::now()),
    };
    ctx.coordinator.publish(&status).await?;

    for file_id in ids {
        if let Some(entry) = load_active(ctx, file_id).await? {
            let path = PathBuf::from(&entry.original_key);
            match ctx.probe.extract_shot_at(&path).await {
                Some(shot_at) => {
                    files::set_shot_at(&ctx.pool, file_id, shot_at).await?;
                    ctx.enqueue(Job::UpsertSearchDoc { file_id }).await?;
                    status.updated += 1;
                }
                None => debug!("No capture time found for {}", path.display()),
            }
        }

        status.processed += 1;
        if status.processed % BACKFILL_PUBLISH_EVERY == 0 {
            status.updated_at = Some(Utc::now());
            ctx.coordinator.publish(&status).await?;
        }
    }

    status.status = JobState::Completed;
    status.updated_at = Some(Utc::now());
    ctx.coordinator.publish(&status).await?;

    if status.updated < status.total {
        warn!(
            "Capture-time backfill left {} of {} files without a timestamp",
            status.total - status.updated,
            status.total
        );
    }
    info!(
        "Capture-time backfill done: {} of {} updated",
        status.updated, status.total
    );
    Ok(JobOutcome::Completed)
}
