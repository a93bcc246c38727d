use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::path::Path;
use walkdir::WalkDir;

use super::{Job, JobContext, JobError, JobOutcome, JobResult};
use crate::db::{files, index_runs, mtime_from_system, IndexRunStatus, NewCatalogEntry, ScanCounters};
use crate::mimetype_detector;

/// Unifies separators, collapses repeated slashes, drops a trailing slash
/// and case-folds, so paths from config and from the walk compare equal.
pub fn normalize_path(raw: &str) -> String {
    let unified = raw.replace('\\', "/");
    let mut normalized = String::with_capacity(unified.len());
    let mut previous_slash = false;
    for c in unified.chars() {
        if c == '/' {
            if previous_slash {
                continue;
            }
            previous_slash = true;
        } else {
            previous_slash = false;
        }
        normalized.push(c);
    }
    if normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }
    normalized.to_lowercase()
}

/// Directory prefixes the scanner never descends into.
#[derive(Debug, Clone, Default)]
pub struct Exclusions {
    prefixes: Vec<String>,
}

impl Exclusions {
    /// Relative entries resolve against `root`.
    pub fn new(root: &Path, raw: &[String]) -> Self {
        let prefixes = raw
            .iter()
            .map(|entry| entry.trim())
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                let path = Path::new(entry);
                let absolute = if path.is_absolute() {
                    path.to_path_buf()
                } else {
                    root.join(path)
                };
                normalize_path(&absolute.to_string_lossy())
            })
            .collect();
        Self { prefixes }
    }

    /// True when `path` is an excluded directory or lies beneath one.
    pub fn is_excluded(&self, path: &Path) -> bool {
        let normalized = normalize_path(&path.to_string_lossy());
        self.prefixes.iter().any(|prefix| {
            if normalized == *prefix {
                return true;
            }
            if prefix.ends_with('/') {
                normalized.starts_with(prefix.as_str())
            } else {
                normalized.len() > prefix.len()
                    && normalized.starts_with(prefix.as_str())
                    && normalized.as_bytes()[prefix.len()] == b'/'
            }
        })
    }
}

async fn ensure_not_cancelled(ctx: &JobContext, run_id: i64) -> JobResult<()> {
    if ctx.coordinator.is_cancelled(run_id).await? {
        return Err(JobError::Cancelled(run_id));
    }
    Ok(())
}

/// Reconciles the filesystem tree under the configured root with the catalog
/// for index run `run_id`.
pub async fn scan_storage(ctx: &JobContext, run_id: i64) -> JobResult<JobOutcome> {
    match index_runs::find(&ctx.pool, run_id).await? {
        Some(run) if run.status == IndexRunStatus::Running => {}
        Some(run) => {
            debug!("Index run {} already {}, not scanning again", run_id, run.status);
            return Ok(JobOutcome::Skipped("index run already finished"));
        }
        None => return Ok(JobOutcome::Skipped("index run not found")),
    }

    let root = ctx.config.filesystem_root.clone();
    let mut counters = ScanCounters::default();

    if !root.exists() {
        warn!("Filesystem root does not exist: {}", root.display());
        index_runs::finish(
            &ctx.pool,
            run_id,
            &counters,
            IndexRunStatus::Failed,
            Some("filesystem root missing"),
        )
        .await?;
        return Ok(JobOutcome::Skipped("filesystem root missing"));
    }

    info!("Scanning {} (index run {})", root.display(), run_id);

    match reconcile(ctx, run_id, &root, &mut counters).await {
        Ok(()) => {
            index_runs::finish(&ctx.pool, run_id, &counters, IndexRunStatus::Completed, None)
                .await?;
            ctx.enqueue(Job::GcPreviews).await?;
            info!(
                "Index run {} completed: {} scanned, {} created, {} updated, {} restored, {} deleted",
                run_id,
                counters.scanned,
                counters.created,
                counters.updated,
                counters.restored,
                counters.deleted
            );
            Ok(JobOutcome::Completed)
        }
        Err(JobError::Cancelled(id)) => {
            warn!("Index run {} cancelled after {} files", id, counters.scanned);
            index_runs::finish(&ctx.pool, id, &counters, IndexRunStatus::Failed, Some("cancelled"))
                .await?;
            ctx.coordinator.clear_cancel(id).await?;
            Err(JobError::Cancelled(id))
        }
        Err(e) => {
            error!("Index run {} failed: {}", run_id, e);
            let message = e.to_string();
            index_runs::finish(
                &ctx.pool,
                run_id,
                &counters,
                IndexRunStatus::Failed,
                Some(&message),
            )
            .await?;
            Err(e)
        }
    }
}

async fn reconcile(
    ctx: &JobContext,
    run_id: i64,
    root: &Path,
    counters: &mut ScanCounters,
) -> JobResult<()> {
    let known = files::load_known(&ctx.pool).await?;
    let missing_keywords = files::ids_missing_keywords(&ctx.pool).await?;
    let missing_text = files::ids_missing_text(&ctx.pool).await?;
    let missing_preview = files::ids_missing_preview(&ctx.pool).await?;

    let exclusions = Exclusions::new(root, &ctx.config.exclude_paths);
    let allowed: HashSet<&str> = ctx
        .config
        .allowed_extensions
        .iter()
        .map(|ext| ext.as_str())
        .collect();
    let checkpoint_every = ctx.config.scan_checkpoint_every.max(1) as i64;
    let mut seen: HashSet<String> = HashSet::new();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| !(entry.file_type().is_dir() && exclusions.is_excluded(entry.path())));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry: {}", e);
                continue;
            }
        };

        if entry.file_type().is_dir() {
            ensure_not_cancelled(ctx, run_id).await?;
            continue;
        }
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let Some(ext) = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_lowercase())
        else {
            continue;
        };
        if !allowed.contains(ext.as_str()) {
            continue;
        }

        ensure_not_cancelled(ctx, run_id).await?;

        let (size_bytes, mtime) = match entry.metadata() {
            Ok(meta) => match meta.modified() {
                Ok(modified) => (meta.len() as i64, mtime_from_system(modified)),
                Err(e) => {
                    warn!("No modification time for {}: {}", path.display(), e);
                    continue;
                }
            },
            Err(e) => {
                warn!("Failed to stat {}: {}", path.display(), e);
                continue;
            }
        };

        let key = path.to_string_lossy().into_owned();
        counters.scanned += 1;

        match known.get(&key) {
            None => {
                let filename = path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| key.clone());
                let id = files::insert(
                    &ctx.pool,
                    &NewCatalogEntry {
                        original_key: key.clone(),
                        filename,
                        ext: ext.clone(),
                        mime: mimetype_detector::mime_string(path),
                        size_bytes,
                        mtime,
                    },
                )
                .await?;
                ctx.enqueue(Job::ExtractMetadata { file_id: id }).await?;
                counters.created += 1;
            }
            Some(row) if row.deleted_at.is_some() => {
                files::restore(&ctx.pool, row.id, size_bytes, mtime).await?;
                ctx.enqueue(Job::ExtractMetadata { file_id: row.id }).await?;
                ctx.enqueue(Job::UpsertSearchDoc { file_id: row.id }).await?;
                counters.restored += 1;
            }
            Some(row) if row.size_bytes != size_bytes || row.mtime != mtime => {
                files::update_stat(&ctx.pool, row.id, size_bytes, mtime).await?;
                ctx.enqueue(Job::ExtractMetadata { file_id: row.id }).await?;
                counters.updated += 1;
            }
            Some(row) => {
                if missing_keywords.contains(&row.id) || missing_text.contains(&row.id) {
                    ctx.enqueue(Job::ExtractMetadata { file_id: row.id }).await?;
                }
                if missing_preview.contains(&row.id) {
                    ctx.enqueue(Job::GeneratePreview { file_id: row.id }).await?;
                }
            }
        }

        seen.insert(key);

        if counters.scanned % checkpoint_every == 0 {
            index_runs::checkpoint(&ctx.pool, run_id, counters).await?;
            debug!("Index run {} checkpoint: {} scanned", run_id, counters.scanned);
        }
    }

    let stale: Vec<i64> = known
        .values()
        .filter(|row| row.deleted_at.is_none() && !seen.contains(&row.original_key))
        .map(|row| row.id)
        .collect();
    let deleted = files::soft_delete(&ctx.pool, &stale).await?;
    for id in &deleted {
        ctx.enqueue(Job::RemoveSearchDoc { file_id: *id }).await?;
    }
    counters.deleted += deleted.len() as i64;

    Ok(())
}
