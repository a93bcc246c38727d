//! Searches that outgrow the engine's pagination cap. `start` answers the
//! first page synchronously, then the scatter job keeps walking the engine in
//! fixed-size chunks, appending newly seen matches to an ordered list in the
//! coordination store. Callers page through that list while it grows.

use chrono::Utc;
use log::{debug, info};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::{Job, JobContext, JobOutcome, JobResult};
use crate::db::{files, keywords};
use crate::search_parser::{evaluate, extract_positive_terms, parse_query, QueryNode};

pub const RESULTS_TTL: Duration = Duration::from_secs(60 * 60);

const STATUS_RUNNING: &str = "running";
const STATUS_COMPLETED: &str = "completed";
const STATUS_UNKNOWN: &str = "unknown";

fn meta_key(job_id: &str) -> String {
    format!("search:async:{}:meta", job_id)
}

fn list_key(job_id: &str) -> String {
    format!("search:async:{}:list", job_id)
}

fn seen_key(job_id: &str) -> String {
    format!("search:async:{}:seen", job_id)
}

/// First page of a freshly started search.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AsyncSearchStart {
    pub job_id: String,
    pub ids: Vec<i64>,
    pub total_found: u64,
    pub next_cursor: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AsyncSearchPage {
    pub ids: Vec<i64>,
    pub total_found: u64,
    pub next_cursor: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AsyncSearchStatus {
    pub status: String,
    pub total_found: u64,
    pub scanned: u64,
    pub updated_at: Option<String>,
}

/// The string sent to the engine: positive terms only. Negations are left to
/// the evaluator, so a purely negated or malformed query asks the engine for
/// everything.
pub fn engine_query(node: Option<&QueryNode>) -> String {
    extract_positive_terms(node).join(" ")
}

static JOB_SEQUENCE: AtomicU64 = AtomicU64::new(0);

fn new_job_id(query: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(query.as_bytes());
    hasher.update(JOB_SEQUENCE.fetch_add(1, Ordering::Relaxed).to_le_bytes());
    hasher.update(Utc::now().timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..32].to_string()
}

/// Progress of one walk over the engine results.
#[derive(Debug, Clone, Copy, Default)]
struct ScanState {
    offset: usize,
    exhausted: bool,
}

/// Queries one chunk at `state.offset` and returns the ids that are active
/// and satisfy `node`, in engine order.
async fn scan_chunk(
    ctx: &JobContext,
    node: Option<&QueryNode>,
    query: &str,
    state: &mut ScanState,
) -> JobResult<Vec<i64>> {
    let chunk_size = ctx.config.async_search_chunk_size.max(1);
    let hits = ctx.search.search(query, chunk_size, state.offset).await?;
    if hits.ids.is_empty() {
        state.exhausted = true;
        return Ok(Vec::new());
    }

    state.offset += hits.ids.len();
    let estimate_reached = hits
        .estimated_total_hits
        .is_some_and(|estimate| estimate > 0 && state.offset as u64 >= estimate);
    if estimate_reached || hits.ids.len() < chunk_size {
        state.exhausted = true;
    }

    let entries = files::find_many(&ctx.pool, &hits.ids).await?;
    let active: HashMap<i64, String> = entries
        .into_iter()
        .filter(|entry| !entry.is_deleted())
        .map(|entry| {
            let text = [
                Some(entry.filename.as_str()),
                entry.title.as_deref(),
                entry.description.as_deref(),
            ]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");
            (entry.id, text)
        })
        .collect();

    let mut norms: HashMap<i64, HashSet<String>> = HashMap::new();
    {
        let mut conn = ctx.pool.acquire().await?;
        let active_ids: Vec<i64> = active.keys().copied().collect();
        for (file_id, norm) in keywords::norms_for_files(&mut conn, &active_ids).await? {
            norms.entry(file_id).or_default().insert(norm);
        }
    }

    let empty = HashSet::new();
    Ok(hits
        .ids
        .into_iter()
        .filter(|id| match active.get(id) {
            Some(text) => evaluate(node, norms.get(id).unwrap_or(&empty), Some(text)),
            None => false,
        })
        .collect())
}

/// Appends ids not yet seen by this job, returning how many were new.
async fn append_unseen(ctx: &JobContext, job_id: &str, ids: &[i64]) -> JobResult<u64> {
    let store = ctx.coordinator.store();
    let seen = seen_key(job_id);
    let mut fresh = Vec::new();
    for id in ids {
        if store.set_add(&seen, &id.to_string()).await? {
            fresh.push(id.to_string());
        }
    }
    if !fresh.is_empty() {
        store.list_push(&list_key(job_id), &fresh).await?;
    }
    Ok(fresh.len() as u64)
}

async fn write_meta(
    ctx: &JobContext,
    job_id: &str,
    status: &str,
    total_found: u64,
    state: &ScanState,
) -> JobResult<()> {
    let store = ctx.coordinator.store();
    store
        .hash_set(
            &meta_key(job_id),
            &[
                ("status", status.to_string()),
                ("total_found", total_found.to_string()),
                ("scanned", state.offset.to_string()),
                ("next_offset", state.offset.to_string()),
                ("updated_at", Utc::now().to_rfc3339()),
            ],
        )
        .await?;
    for key in [meta_key(job_id), list_key(job_id), seen_key(job_id)] {
        store.expire(&key, RESULTS_TTL).await?;
    }
    Ok(())
}

/// Starts a search for `query`: fills the first `limit` matches right away
/// and leaves the rest of the walk to the scatter job.
pub async fn start(ctx: &JobContext, query: &str, limit: usize) -> JobResult<AsyncSearchStart> {
    let job_id = new_job_id(query);
    let query_text = query.trim();
    let node = parse_query(query_text);
    let engine = engine_query(node.as_ref());

    let mut state = ScanState::default();
    let mut total_found = 0u64;
    while (total_found as usize) < limit && !state.exhausted {
        let matched = scan_chunk(ctx, node.as_ref(), &engine, &mut state).await?;
        total_found += append_unseen(ctx, &job_id, &matched).await?;
    }

    ctx.coordinator
        .store()
        .hash_set(
            &meta_key(&job_id),
            &[
                ("query", query.to_string()),
                ("query_text", query_text.to_string()),
            ],
        )
        .await?;
    let status = if state.exhausted {
        STATUS_COMPLETED
    } else {
        STATUS_RUNNING
    };
    write_meta(ctx, &job_id, status, total_found, &state).await?;

    if !state.exhausted {
        ctx.enqueue(Job::AsyncSearchScatter {
            job_id: job_id.clone(),
        })
        .await?;
    }

    let first = page(ctx, &job_id, 0, limit).await?;
    info!(
        "Async search {} started: {} matches after {} hits scanned",
        job_id, total_found, state.offset
    );
    Ok(AsyncSearchStart {
        job_id,
        ids: first.ids,
        total_found,
        next_cursor: first.next_cursor,
    })
}

/// Continues the walk of one search for up to the configured number of
/// chunks, then re-enqueues itself unless the engine is exhausted.
pub async fn scatter(ctx: &JobContext, job_id: &str) -> JobResult<JobOutcome> {
    let meta = ctx.coordinator.store().hash_get_all(&meta_key(job_id)).await?;
    if meta.is_empty() {
        debug!("Async search {} expired before scatter", job_id);
        return Ok(JobOutcome::Skipped("search expired"));
    }
    if meta.get("status").map(String::as_str) != Some(STATUS_RUNNING) {
        return Ok(JobOutcome::Skipped("search not running"));
    }

    let query_text = meta.get("query_text").cloned().unwrap_or_default();
    let node = parse_query(&query_text);
    let engine = engine_query(node.as_ref());
    let mut state = ScanState {
        offset: read_number(&meta, "next_offset") as usize,
        exhausted: false,
    };
    let mut total_found = read_number(&meta, "total_found");

    for _ in 0..ctx.config.async_search_chunks_per_run.max(1) {
        let matched = scan_chunk(ctx, node.as_ref(), &engine, &mut state).await?;
        total_found += append_unseen(ctx, job_id, &matched).await?;
        let status = if state.exhausted {
            STATUS_COMPLETED
        } else {
            STATUS_RUNNING
        };
        write_meta(ctx, job_id, status, total_found, &state).await?;
        if state.exhausted {
            break;
        }
    }

    if state.exhausted {
        info!(
            "Async search {} completed: {} matches, {} hits scanned",
            job_id, total_found, state.offset
        );
    } else {
        ctx.enqueue(Job::AsyncSearchScatter {
            job_id: job_id.to_string(),
        })
        .await?;
    }
    Ok(JobOutcome::Completed)
}

fn read_number(meta: &HashMap<String, String>, field: &str) -> u64 {
    meta.get(field)
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(0)
}

/// Reads `limit` accumulated ids from `offset`, dropping entries deleted
/// since they were found.
pub async fn page(
    ctx: &JobContext,
    job_id: &str,
    offset: usize,
    limit: usize,
) -> JobResult<AsyncSearchPage> {
    let store = ctx.coordinator.store();
    let meta = store.hash_get_all(&meta_key(job_id)).await?;
    let total_found = read_number(&meta, "total_found");

    let raw = store.list_range(&list_key(job_id), offset, limit).await?;
    let listed: Vec<i64> = raw.iter().filter_map(|id| id.parse().ok()).collect();
    if listed.is_empty() {
        return Ok(AsyncSearchPage {
            ids: Vec::new(),
            total_found,
            next_cursor: None,
        });
    }

    let active: HashSet<i64> = files::find_many(&ctx.pool, &listed)
        .await?
        .into_iter()
        .filter(|entry| !entry.is_deleted())
        .map(|entry| entry.id)
        .collect();
    let ids: Vec<i64> = listed.into_iter().filter(|id| active.contains(id)).collect();

    let next_cursor = (total_found > (offset + ids.len()) as u64).then_some(offset + limit);
    Ok(AsyncSearchPage {
        ids,
        total_found,
        next_cursor,
    })
}

pub async fn status(ctx: &JobContext, job_id: &str) -> JobResult<AsyncSearchStatus> {
    let meta = ctx.coordinator.store().hash_get_all(&meta_key(job_id)).await?;
    Ok(AsyncSearchStatus {
        status: meta
            .get("status")
            .cloned()
            .unwrap_or_else(|| STATUS_UNKNOWN.to_string()),
        total_found: read_number(&meta, "total_found"),
        scanned: read_number(&meta, "scanned"),
        updated_at: meta.get("updated_at").cloned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_query_drops_negations() {
        let node = parse_query("beach -night (dog OR cat)");
        assert_eq!(engine_query(node.as_ref()), "beach dog cat");
    }

    #[test]
    fn test_engine_query_without_positive_terms_is_empty() {
        assert_eq!(engine_query(parse_query("  ((  ").as_ref()), "");
        assert_eq!(engine_query(parse_query("(wedding").as_ref()), "");
        assert_eq!(engine_query(parse_query(" -night ").as_ref()), "");
    }

    #[test]
    fn test_job_ids_are_distinct() {
        let a = new_job_id("beach");
        let b = new_job_id("beach");
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }
}
