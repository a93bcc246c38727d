use chrono::Utc;
use log::{debug, info};
use std::collections::HashMap;

use super::{Job, JobContext, JobOutcome, JobResult};
use crate::coordination::{JobState, ReindexStatus};
use crate::db::{files, keywords, CatalogEntry, Keyword};
use crate::search::SearchDocument;

async fn build_document(ctx: &JobContext, entry: &CatalogEntry) -> JobResult<SearchDocument> {
    let mut conn = ctx.pool.acquire().await?;
    let keywords = keywords::for_file(&mut conn, entry.id).await?;
    Ok(SearchDocument::build(entry, &keywords))
}

/// Pushes the current state of one entry to the search engine. A
/// soft-deleted entry has its document removed instead.
pub async fn upsert_search_doc(ctx: &JobContext, file_id: i64) -> JobResult<JobOutcome> {
    let job = Job::UpsertSearchDoc { file_id };
    if let Some(deferred) = ctx.defer_if_exclusive(&job).await? {
        return Ok(deferred);
    }

    let Some(entry) = files::find_by_id(&ctx.pool, file_id).await? else {
        return Ok(JobOutcome::Skipped("file not found"));
    };

    ctx.search.ensure_index().await?;
    if entry.is_deleted() {
        ctx.search.delete(file_id).await?;
        debug!("File {} is deleted, removed its search document", file_id);
        return Ok(JobOutcome::Completed);
    }

    let document = build_document(ctx, &entry).await?;
    ctx.search.upsert(&[document]).await?;
    debug!("Search document for file {} upserted", file_id);
    Ok(JobOutcome::Completed)
}

pub async fn remove_search_doc(ctx: &JobContext, file_id: i64) -> JobResult<JobOutcome> {
    let job = Job::RemoveSearchDoc { file_id };
    if let Some(deferred) = ctx.defer_if_exclusive(&job).await? {
        return Ok(deferred);
    }

    ctx.search.ensure_index().await?;
    ctx.search.delete(file_id).await?;
    debug!("Search document for file {} removed", file_id);
    Ok(JobOutcome::Completed)
}

/// Splits every active entry into fixed-size chunks and enqueues one
/// independent job per chunk.
pub async fn start_reindex(ctx: &JobContext) -> JobResult<JobOutcome> {
    let total = files::count_active(&ctx.pool).await?;
    let started_at = Utc::now();
    ctx.coordinator.reset_reindex_counters(total).await?;

    let mut status = ReindexStatus {
        status: JobState::Running,
        total,
        completed: 0,
        started_at: Some(started_at),
        updated_at: Some(started_at),
    };
    if total == 0 {
        status.status = JobState::Completed;
        ctx.coordinator.publish(&status).await?;
        info!("Reindex requested with no active files");
        return Ok(JobOutcome::Completed);
    }
    ctx.coordinator.publish(&status).await?;

    let chunk_size = ctx.config.reindex_chunk_size.max(1) as i64;
    let mut after_id = 0;
    let mut chunks = 0usize;
    loop {
        let file_ids = files::active_ids_after(&ctx.pool, after_id, chunk_size).await?;
        let Some(&last) = file_ids.last() else {
            break;
        };
        after_id = last;
        ctx.enqueue(Job::ReindexChunk { file_ids }).await?;
        chunks += 1;
    }

    info!("Reindex of {} files split into {} chunks", total, chunks);
    Ok(JobOutcome::Completed)
}

/// Rebuilds and upserts the documents of one chunk, then bumps the shared
/// completed counter by the chunk size. Entries deleted since the reindex
/// started are skipped but still count as handled. Whichever chunk reaches
/// the total marks the reindex completed.
pub async fn reindex_chunk(ctx: &JobContext, file_ids: &[i64]) -> JobResult<JobOutcome> {
    ctx.search.ensure_index().await?;

    let entries: Vec<CatalogEntry> = files::find_many(&ctx.pool, file_ids)
        .await?
        .into_iter()
        .filter(|entry| !entry.is_deleted())
        .collect();

    let mut by_file: HashMap<i64, Vec<Keyword>> = HashMap::new();
    {
        let mut conn = ctx.pool.acquire().await?;
        for entry in &entries {
            by_file.insert(entry.id, keywords::for_file(&mut conn, entry.id).await?);
        }
    }

    let documents: Vec<SearchDocument> = entries
        .iter()
        .map(|entry| {
            let keywords = by_file.get(&entry.id).map(Vec::as_slice).unwrap_or(&[]);
            SearchDocument::build(entry, keywords)
        })
        .collect();
    if !documents.is_empty() {
        ctx.search.upsert(&documents).await?;
    }

    let completed = ctx
        .coordinator
        .add_reindex_completed(file_ids.len() as i64)
        .await?;
    let (_, total) = ctx.coordinator.reindex_progress().await?;

    let previous = ctx.coordinator.status::<ReindexStatus>().await?.unwrap_or_default();
    if previous.completed > completed {
        // A later chunk already published further progress
        return Ok(JobOutcome::Completed);
    }
    let status = ReindexStatus {
        status: if completed >= total {
            JobState::Completed
        } else {
            JobState::Running
        },
        total,
        completed,
        started_at: previous.started_at,
        updated_at: Some(Utc::now()),
    };
    ctx.coordinator.publish(&status).await?;

    debug!("Reindex chunk done: {}/{}", completed, total);
    if status.status == JobState::Completed {
        info!("Reindex completed: {} documents", completed);
    }
    Ok(JobOutcome::Completed)
}
