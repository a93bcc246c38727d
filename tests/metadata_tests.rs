mod common;

use chrono::{TimeZone, Utc};
use common::{harness, keyword_counts, write_image};
use pixdex::coordination::{BackfillStatus, JobState, BACKFILL_LOCK_KEY};
use pixdex::db::{files, keywords, Orientation};
use pixdex::jobs::{admin, dispatch, metadata, Job, JobOutcome};
use pixdex::metadata_extractor::ExtractedMetadata;
use std::time::Duration;

fn probed(keywords: &[&str]) -> ExtractedMetadata {
    ExtractedMetadata {
        mime: Some("image/png".to_string()),
        width: Some(8),
        height: Some(4),
        shot_at: Some(Utc.with_ymd_and_hms(2023, 7, 1, 9, 30, 0).unwrap()),
        title: Some("Evening".to_string()),
        description: None,
        keywords: keywords.iter().map(|k| k.to_string()).collect(),
    }
}

#[tokio::test]
async fn test_keyword_counts_follow_reconciliation() {
    let h = harness().await;
    let a = write_image(h.root(), "a.png", 8, 4);
    let b = write_image(h.root(), "b.png", 8, 4);
    h.probe.set(&a, probed(&["Beach", " beach ", "Sunset"]));
    h.probe.set(&b, probed(&["Sunset"]));

    admin::refresh_all(&h.ctx).await.unwrap();
    h.drain().await;

    assert_eq!(
        keyword_counts(h.pool()).await,
        vec![("beach".to_string(), 1), ("sunset".to_string(), 2)]
    );

    let a_id = files::load_known(h.pool()).await.unwrap()[&a.to_string_lossy().into_owned()].id;
    let entry = files::find_by_id(h.pool(), a_id).await.unwrap().unwrap();
    assert_eq!(entry.orientation, Orientation::Landscape);
    assert_eq!(entry.title.as_deref(), Some("Evening"));
    let doc = h.search.document(a_id).unwrap();
    assert_eq!(doc.keywords_norm, vec!["beach", "sunset"]);

    // Replace the keyword set: one kept, one dropped, one new
    h.probe.set(&a, probed(&["Sunset", "Dog"]));
    admin::reextract(&h.ctx, a_id).await.unwrap();
    h.drain().await;

    assert_eq!(
        keyword_counts(h.pool()).await,
        vec![
            ("beach".to_string(), 0),
            ("dog".to_string(), 1),
            ("sunset".to_string(), 2)
        ]
    );
    let mut conn = h.pool().acquire().await.unwrap();
    assert_eq!(keywords::count_mismatches(&mut conn).await.unwrap(), 0);
    drop(conn);

    // Deleting a file releases its keywords
    std::fs::remove_file(&b).unwrap();
    admin::refresh_all(&h.ctx).await.unwrap();
    h.drain().await;

    assert_eq!(
        keyword_counts(h.pool()).await,
        vec![
            ("beach".to_string(), 0),
            ("dog".to_string(), 1),
            ("sunset".to_string(), 1)
        ]
    );
    let mut conn = h.pool().acquire().await.unwrap();
    assert_eq!(keywords::count_mismatches(&mut conn).await.unwrap(), 0);
}

#[tokio::test]
async fn test_first_display_form_wins() {
    let h = harness().await;
    let a = write_image(h.root(), "a.png", 4, 4);
    let b = write_image(h.root(), "b.png", 4, 4);
    h.probe.set(&a, probed(&["New York"]));
    h.probe.set(&b, probed(&["new  YORK"]));

    admin::refresh_all(&h.ctx).await.unwrap();
    h.drain().await;

    let displays: Vec<(String, String)> =
        sqlx::query_as("SELECT value_norm, value_display FROM keywords")
            .fetch_all(h.pool())
            .await
            .unwrap();
    assert_eq!(displays.len(), 1);
    assert_eq!(displays[0].0, "new york");
    assert_eq!(keyword_counts(h.pool()).await, vec![("new york".to_string(), 2)]);
}

#[tokio::test]
async fn test_capture_time_survives_empty_probe() {
    let h = harness().await;
    let a = write_image(h.root(), "a.png", 4, 4);
    h.probe.set(&a, probed(&[]));

    admin::refresh_all(&h.ctx).await.unwrap();
    h.drain().await;
    let id = files::load_known(h.pool()).await.unwrap()[&a.to_string_lossy().into_owned()].id;

    h.probe.set(&a, ExtractedMetadata::default());
    admin::reextract(&h.ctx, id).await.unwrap();
    h.drain().await;

    let entry = files::find_by_id(h.pool(), id).await.unwrap().unwrap();
    assert_eq!(
        entry.shot_at,
        Some(Utc.with_ymd_and_hms(2023, 7, 1, 9, 30, 0).unwrap())
    );
    assert!(entry.title.is_none());
}

#[tokio::test]
async fn test_reconcile_ignores_deleted_entry() {
    let h = harness().await;
    let a = write_image(h.root(), "a.png", 4, 4);
    h.probe.set(&a, probed(&["Beach"]));
    admin::refresh_all(&h.ctx).await.unwrap();
    h.drain().await;
    let id = files::load_known(h.pool()).await.unwrap()[&a.to_string_lossy().into_owned()].id;

    files::soft_delete(h.pool(), &[id]).await.unwrap();
    let delta = metadata::reconcile(
        &h.ctx,
        id,
        &files::MetadataUpdate::default(),
        &[("dog".to_string(), "Dog".to_string())],
    )
    .await
    .unwrap();

    assert!(delta.is_none());
    assert_eq!(keyword_counts(h.pool()).await, vec![("beach".to_string(), 0)]);
    assert!(admin::reextract(&h.ctx, id).await.is_err());
}

#[tokio::test]
async fn test_metadata_and_search_jobs_defer_while_exclusive() {
    let h = harness().await;
    let a = write_image(h.root(), "a.png", 4, 4);
    h.probe.set(&a, probed(&["Beach"]));
    admin::refresh_all(&h.ctx).await.unwrap();
    h.drain().await;
    let id = files::load_known(h.pool()).await.unwrap()[&a.to_string_lossy().into_owned()].id;

    h.ctx.coordinator.set_preview_exclusive(true).await.unwrap();
    h.probe.set(&a, probed(&["Dog"]));

    let outcome = dispatch(&h.ctx, &Job::ExtractMetadata { file_id: id })
        .await
        .unwrap();
    assert_eq!(outcome, JobOutcome::Deferred(h.ctx.config.defer_delay));
    let outcome = dispatch(&h.ctx, &Job::UpsertSearchDoc { file_id: id })
        .await
        .unwrap();
    assert!(matches!(outcome, JobOutcome::Deferred(_)));

    // Nothing changed; both jobs wait in the queue
    assert_eq!(keyword_counts(h.pool()).await, vec![("beach".to_string(), 1)]);
    let pending = h.queue.pending().await.unwrap();
    assert!(pending.contains(&Job::ExtractMetadata { file_id: id }));
    assert!(pending.contains(&Job::UpsertSearchDoc { file_id: id }));
    let due_in = h.queue.next_due_in().await.unwrap().unwrap();
    assert!(due_in > Duration::from_secs(30));
}

#[tokio::test]
async fn test_backfill_recovers_stuck_lock() {
    let h = harness().await;
    let a = write_image(h.root(), "a.png", 4, 4);
    let b = write_image(h.root(), "b.png", 4, 4);
    admin::refresh_all(&h.ctx).await.unwrap();
    h.drain().await;

    let shot_at = Utc.with_ymd_and_hms(2020, 2, 2, 2, 2, 2).unwrap();
    h.probe.set(
        &a,
        ExtractedMetadata {
            shot_at: Some(shot_at),
            ..Default::default()
        },
    );

    // A crashed worker left the lock behind without publishing anything
    assert!(h
        .ctx
        .coordinator
        .try_lock(BACKFILL_LOCK_KEY, Duration::from_secs(3600))
        .await
        .unwrap());

    let outcome = dispatch(&h.ctx, &Job::BackfillShotAt).await.unwrap();
    assert_eq!(outcome, JobOutcome::Completed);

    let status = h
        .ctx
        .coordinator
        .status::<BackfillStatus>()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.status, JobState::Completed);
    assert_eq!(status.total, 2);
    assert_eq!(status.processed, 2);
    assert_eq!(status.updated, 1);

    let known = files::load_known(h.pool()).await.unwrap();
    let a_entry = files::find_by_id(h.pool(), known[&a.to_string_lossy().into_owned()].id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(a_entry.shot_at, Some(shot_at));
    let b_entry = files::find_by_id(h.pool(), known[&b.to_string_lossy().into_owned()].id)
        .await
        .unwrap()
        .unwrap();
    assert!(b_entry.shot_at.is_none());

    // The lock was released
    assert!(h
        .ctx
        .coordinator
        .try_lock(BACKFILL_LOCK_KEY, Duration::from_secs(1))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_backfill_skips_when_lock_shows_progress() {
    let h = harness().await;
    h.ctx
        .coordinator
        .publish(&BackfillStatus {
            status: JobState::Running,
            total: 10,
            processed: 3,
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(h
        .ctx
        .coordinator
        .try_lock(BACKFILL_LOCK_KEY, Duration::from_secs(3600))
        .await
        .unwrap());

    let outcome = dispatch(&h.ctx, &Job::BackfillShotAt).await.unwrap();
    assert!(matches!(outcome, JobOutcome::Skipped(_)));
}
