mod common;

use async_trait::async_trait;
use chrono::Utc;
use common::{harness, harness_with};
use pixdex::coordination::{JobState, ReindexStatus};
use pixdex::db::{files, DbPool, NewCatalogEntry};
use pixdex::jobs::{admin, async_search, dispatch, metadata, Job, JobContext};
use pixdex::preview_renderer::ImageRenderer;
use pixdex::search::{SearchDocument, SearchHits, SearchIndex, SearchResult};
use std::sync::Arc;

async fn insert_entries(pool: &DbPool, count: usize) -> Vec<i64> {
    let mut ids = Vec::new();
    for i in 0..count {
        let id = files::insert(
            pool,
            &NewCatalogEntry {
                original_key: format!("/photos/{}.jpg", i),
                filename: format!("{}.jpg", i),
                ext: "jpg".to_string(),
                mime: "image/jpeg".to_string(),
                size_bytes: 100,
                mtime: Utc::now(),
            },
        )
        .await
        .unwrap();
        ids.push(id);
    }
    ids
}

async fn tag(ctx: &JobContext, file_id: i64, keywords: &[&str]) {
    let wanted: Vec<(String, String)> = keywords
        .iter()
        .map(|k| (k.to_lowercase(), k.to_string()))
        .collect();
    metadata::reconcile(ctx, file_id, &files::MetadataUpdate::default(), &wanted)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_reindex_runs_in_chunks() {
    let h = harness_with(|config| config.reindex_chunk_size = 2, Arc::new(ImageRenderer)).await;
    let ids = insert_entries(h.pool(), 5).await;
    files::soft_delete(h.pool(), &[ids[4]]).await.unwrap();

    dispatch(&h.ctx, &Job::StartReindex).await.unwrap();
    let chunks: Vec<Vec<i64>> = h
        .queue
        .pending()
        .await
        .unwrap()
        .into_iter()
        .filter_map(|job| match job {
            Job::ReindexChunk { file_ids } => Some(file_ids),
            _ => None,
        })
        .collect();
    assert_eq!(chunks, vec![ids[0..2].to_vec(), ids[2..4].to_vec()]);

    let running = admin::reindex_status(&h.ctx).await.unwrap();
    assert_eq!(running.status, JobState::Running);
    assert_eq!(running.total, 4);
    assert_eq!(running.completed, 0);

    h.drain().await;

    assert_eq!(h.search.len(), 4);
    assert!(h.search.document(ids[4]).is_none());
    let done = admin::reindex_status(&h.ctx).await.unwrap();
    assert_eq!(done.status, JobState::Completed);
    assert_eq!((done.completed, done.total), (4, 4));
}

#[tokio::test]
async fn test_reindex_completes_when_entry_deleted_mid_run() {
    let h = harness_with(|config| config.reindex_chunk_size = 2, Arc::new(ImageRenderer)).await;
    let ids = insert_entries(h.pool(), 4).await;

    dispatch(&h.ctx, &Job::StartReindex).await.unwrap();
    files::soft_delete(h.pool(), &[ids[0]]).await.unwrap();
    h.drain().await;

    let done = admin::reindex_status(&h.ctx).await.unwrap();
    assert_eq!(done.status, JobState::Completed);
    assert_eq!((done.completed, done.total), (4, 4));
    assert_eq!(h.search.len(), 3);
    assert!(h.search.document(ids[0]).is_none());
}

#[tokio::test]
async fn test_reindex_of_empty_catalog_completes() {
    let h = harness().await;
    dispatch(&h.ctx, &Job::StartReindex).await.unwrap();

    let status = h
        .ctx
        .coordinator
        .status::<ReindexStatus>()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.status, JobState::Completed);
    assert!(h.queue.pending().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_upsert_of_deleted_entry_removes_document() {
    let h = harness().await;
    let ids = insert_entries(h.pool(), 1).await;
    tag(&h.ctx, ids[0], &["Beach"]).await;

    dispatch(&h.ctx, &Job::UpsertSearchDoc { file_id: ids[0] })
        .await
        .unwrap();
    let doc = h.search.document(ids[0]).unwrap();
    assert_eq!(doc.keywords, vec!["Beach"]);
    assert!(!doc.deleted);

    files::soft_delete(h.pool(), &[ids[0]]).await.unwrap();
    dispatch(&h.ctx, &Job::UpsertSearchDoc { file_id: ids[0] })
        .await
        .unwrap();
    assert!(h.search.document(ids[0]).is_none());
    assert!(h.search.ensure_calls() >= 2);
}

#[tokio::test]
async fn test_async_search_applies_negation() {
    let h = harness().await;
    let ids = insert_entries(h.pool(), 4).await;
    tag(&h.ctx, ids[0], &["Beach"]).await;
    tag(&h.ctx, ids[1], &["Beach", "Night"]).await;
    tag(&h.ctx, ids[2], &["Night"]).await;
    tag(&h.ctx, ids[3], &["Beach", "Dog"]).await;
    dispatch(&h.ctx, &Job::StartReindex).await.unwrap();
    h.drain().await;

    let started = async_search::start(&h.ctx, "beach -night", 10).await.unwrap();
    h.drain().await;

    assert_eq!(started.ids, vec![ids[0], ids[3]]);
    assert_eq!(started.total_found, 2);
    assert_eq!(started.next_cursor, None);
    let status = async_search::status(&h.ctx, &started.job_id).await.unwrap();
    assert_eq!(status.status, "completed");
}

#[tokio::test]
async fn test_async_search_pure_negation_and_malformed_query() {
    let h = harness().await;
    let ids = insert_entries(h.pool(), 2).await;
    tag(&h.ctx, ids[0], &["Wedding"]).await;
    tag(&h.ctx, ids[1], &["Studio"]).await;
    dispatch(&h.ctx, &Job::StartReindex).await.unwrap();
    h.drain().await;

    let negated = async_search::start(&h.ctx, "-studio", 10).await.unwrap();
    assert_eq!(negated.ids, vec![ids[0]]);
    assert_eq!(negated.total_found, 1);

    // Unbalanced parens parse to nothing and match every entry
    let malformed = async_search::start(&h.ctx, "(wedding", 10).await.unwrap();
    assert_eq!(malformed.ids, vec![ids[0], ids[1]]);
    assert_eq!(
        async_search::status(&h.ctx, &malformed.job_id).await.unwrap().status,
        "completed"
    );
}

/// Engine stand-in whose consecutive pages overlap.
struct OverlappingIndex {
    ids: Vec<i64>,
}

#[async_trait]
impl SearchIndex for OverlappingIndex {
    async fn ensure_index(&self) -> SearchResult<()> {
        Ok(())
    }

    async fn upsert(&self, _documents: &[SearchDocument]) -> SearchResult<()> {
        Ok(())
    }

    async fn delete(&self, _id: i64) -> SearchResult<()> {
        Ok(())
    }

    async fn search(&self, _query: &str, limit: usize, offset: usize) -> SearchResult<SearchHits> {
        let ids = self.ids.iter().skip(offset).take(limit).copied().collect();
        Ok(SearchHits {
            ids,
            estimated_total_hits: Some(self.ids.len() as u64),
        })
    }
}

#[tokio::test]
async fn test_async_search_deduplicates_and_pages() {
    let mut h = harness_with(
        |config| {
            config.async_search_chunk_size = 3;
            config.async_search_chunks_per_run = 1;
        },
        Arc::new(ImageRenderer),
    )
    .await;
    let ids = insert_entries(h.pool(), 5).await;
    let [a, b, c, d, e] = [ids[0], ids[1], ids[2], ids[3], ids[4]];
    h.ctx.search = Arc::new(OverlappingIndex {
        ids: vec![a, b, c, b, d, a, e],
    });
    h.worker = pixdex::jobs::Worker::new(h.ctx.clone(), h.queue.clone());

    let started = async_search::start(&h.ctx, "", 2).await.unwrap();
    assert_eq!(started.ids, vec![a, b]);
    assert_eq!(started.total_found, 3);
    assert_eq!(started.next_cursor, Some(2));
    assert_eq!(
        async_search::status(&h.ctx, &started.job_id).await.unwrap().status,
        "running"
    );

    h.drain().await;

    let status = async_search::status(&h.ctx, &started.job_id).await.unwrap();
    assert_eq!(status.status, "completed");
    assert_eq!(status.total_found, 5);
    assert_eq!(status.scanned, 7);

    let all = async_search::page(&h.ctx, &started.job_id, 0, 10).await.unwrap();
    assert_eq!(all.ids, vec![a, b, c, d, e]);
    assert_eq!(all.next_cursor, None);

    let middle = async_search::page(&h.ctx, &started.job_id, 2, 2).await.unwrap();
    assert_eq!(middle.ids, vec![c, d]);
    assert_eq!(middle.next_cursor, Some(4));
}

#[tokio::test]
async fn test_async_search_unknown_job() {
    let h = harness().await;
    let status = async_search::status(&h.ctx, "nope").await.unwrap();
    assert_eq!(status.status, "unknown");
    assert_eq!(status.total_found, 0);

    let page = async_search::page(&h.ctx, "nope", 0, 10).await.unwrap();
    assert!(page.ids.is_empty());
    assert_eq!(page.next_cursor, None);
}
