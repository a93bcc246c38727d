#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use pixdex::config::Config;
use pixdex::coordination::{Coordinator, MemoryCoordinationStore};
use pixdex::db::{create_in_memory_pool, DbPool};
use pixdex::jobs::{JobContext, SqliteJobQueue, Worker};
use pixdex::metadata_extractor::ScriptedProbe;
use pixdex::preview_renderer::{ImageRenderer, PreviewRenderer};
use pixdex::search::{MemorySearchIndex, SearchIndex};
use tempfile::TempDir;

pub struct Harness {
    pub ctx: JobContext,
    pub worker: Worker,
    pub queue: Arc<SqliteJobQueue>,
    pub probe: Arc<ScriptedProbe>,
    pub search: Arc<MemorySearchIndex>,
    pub originals: TempDir,
    pub previews: TempDir,
}

impl Harness {
    pub fn pool(&self) -> &DbPool {
        &self.ctx.pool
    }

    pub fn root(&self) -> &Path {
        self.originals.path()
    }

    /// Runs every queued job, delayed ones included.
    pub async fn drain(&self) -> usize {
        self.worker.run_until_idle(true).await.unwrap()
    }
}

pub fn test_config(originals: &Path, previews: &Path) -> Config {
    let mut config = Config::default();
    config.filesystem_root = originals.to_path_buf();
    config.previews.previews_root = previews.to_path_buf();
    config.previews.check_delay = Duration::ZERO;
    config.previews.max_dimension = 64;
    config.workers = 1;
    config.retry_delay = Duration::ZERO;
    config.reindex_delay = Duration::ZERO;
    config.defer_delay = Duration::from_secs(60);
    config.scan_checkpoint_every = 2;
    config
}

pub async fn harness() -> Harness {
    harness_with(|_| {}, Arc::new(ImageRenderer)).await
}

pub async fn harness_with(
    configure: impl FnOnce(&mut Config),
    renderer: Arc<dyn PreviewRenderer>,
) -> Harness {
    let originals = TempDir::new().unwrap();
    let previews = TempDir::new().unwrap();
    let mut config = test_config(originals.path(), previews.path());
    configure(&mut config);

    let pool = create_in_memory_pool().await.unwrap();
    let queue = Arc::new(SqliteJobQueue::new(pool.clone(), &config));
    let probe = Arc::new(ScriptedProbe::new());
    let search = Arc::new(MemorySearchIndex::default());

    let ctx = JobContext {
        pool,
        config: Arc::new(config),
        queue: queue.clone(),
        coordinator: Coordinator::new(Arc::new(MemoryCoordinationStore::new())),
        search: search.clone() as Arc<dyn SearchIndex>,
        probe: probe.clone(),
        renderer,
    };
    let worker = Worker::new(ctx.clone(), queue.clone());

    Harness {
        ctx,
        worker,
        queue,
        probe,
        search,
        originals,
        previews,
    }
}

/// Writes a small PNG at `relative` under `root`, creating parent folders.
pub fn write_image(root: &Path, relative: &str, width: u32, height: u32) -> PathBuf {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    let img = image::RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x * 7) as u8, (y * 5) as u8, 128])
    });
    img.save(&path).unwrap();
    path
}

pub async fn active_count(pool: &DbPool) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM files WHERE deleted_at IS NULL")
        .fetch_one(pool)
        .await
        .unwrap()
}

pub async fn keyword_counts(pool: &DbPool) -> Vec<(String, i64)> {
    sqlx::query_as("SELECT value_norm, usage_count FROM keywords ORDER BY value_norm")
        .fetch_all(pool)
        .await
        .unwrap()
}
