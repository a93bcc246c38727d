use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info};
use mimalloc::MiMalloc;
use std::sync::Arc;
use tokio::sync::watch;

use pixdex::config::Config;
use pixdex::db::create_db_pool;
use pixdex::jobs::{admin, Job, JobContext, JobQueue, SqliteJobQueue, Worker};
use pixdex::scheduler::IndexScheduler;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(author, version, about = "Media catalog indexer and job runner", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the worker and the scheduler until interrupted (default)
    Serve,
    /// Scan storage, fill in missing metadata and previews, then reindex
    Rescan,
    /// Rebuild every search document in chunks
    Reindex,
    /// Delete previews of soft-deleted files
    GcPreviews,
    /// Delete preview files no record points at
    CleanupOrphans,
    /// Regenerate missing previews in rounds, holding off metadata and search jobs
    RefreshPreviews,
    /// Fill in missing capture times
    BackfillShotAt,
    /// Extract metadata again for one file
    Reextract { file_id: i64 },
    /// Cancel the running index run
    CancelIndex,
    /// Print index, preview, reindex, orphan cleanup and queue status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let config = Config::from_env().context("Invalid configuration")?;

    info!("Filesystem root: {}", config.filesystem_root.display());
    info!("Previews root: {}", config.previews.previews_root.display());
    info!("Database: {}", config.db_path);

    let pool = create_db_pool(&config.db_path)
        .await
        .with_context(|| format!("Failed to open database {}", config.db_path))?;
    let queue = Arc::new(SqliteJobQueue::new(pool.clone(), &config));
    let ctx = JobContext::from_config(pool, config, queue.clone());
    let worker = Worker::new(ctx.clone(), queue.clone());

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => return serve(ctx, worker).await,
        Commands::Rescan => {
            let run_id = admin::refresh_all(&ctx).await?;
            info!("Index run {} started", run_id);
        }
        Commands::Reindex => {
            queue.enqueue(Job::StartReindex, None).await?;
        }
        Commands::GcPreviews => {
            queue.enqueue(Job::GcPreviews, None).await?;
        }
        Commands::CleanupOrphans => admin::request_orphan_cleanup(&ctx).await?,
        Commands::RefreshPreviews => admin::refresh_previews(&ctx).await?,
        Commands::BackfillShotAt => {
            queue.enqueue(Job::BackfillShotAt, None).await?;
        }
        Commands::Reextract { file_id } => admin::reextract(&ctx, file_id).await?,
        Commands::CancelIndex => {
            let run_id = admin::cancel_index_run(&ctx, None).await?;
            println!("Cancellation requested for index run {}", run_id);
            return Ok(());
        }
        Commands::Status => return print_status(&ctx, &queue).await,
    }

    let executed = worker.run_until_idle(true).await?;
    info!("Queue drained after {} jobs", executed);
    print_status(&ctx, &queue).await
}

async fn serve(ctx: JobContext, worker: Worker) -> Result<()> {
    let scheduler = IndexScheduler::new(ctx);
    let _scheduler_handle = scheduler.start();
    scheduler.run_startup_refresh().await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
        let _ = shutdown_tx.send(true);
    });

    worker.run(shutdown_rx).await?;
    Ok(())
}

async fn print_status(ctx: &JobContext, queue: &SqliteJobQueue) -> Result<()> {
    let status = serde_json::json!({
        "index": admin::index_status(ctx).await?,
        "previews": admin::preview_status(ctx).await?,
        "reindex": admin::reindex_status(ctx).await?,
        "orphan_cleanup": admin::orphan_status(ctx).await?,
        "queue": queue.counts().await?,
    });
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}
