use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

use super::queue::FailureAction;
use super::{dispatch, ClaimedJob, JobContext, JobOutcome, JobResult, SqliteJobQueue};

const IDLE_POLL: Duration = Duration::from_secs(2);

static WORKER_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Claims jobs from the queue and runs up to `concurrency` of them at once.
#[derive(Clone)]
pub struct Worker {
    ctx: JobContext,
    queue: Arc<SqliteJobQueue>,
    concurrency: usize,
    owner: String,
}

impl Worker {
    pub fn new(ctx: JobContext, queue: Arc<SqliteJobQueue>) -> Self {
        let concurrency = ctx.config.workers.max(1);
        Self {
            ctx,
            queue,
            concurrency,
            owner: format!(
                "worker-{}-{}",
                std::process::id(),
                WORKER_SEQUENCE.fetch_add(1, Ordering::Relaxed)
            ),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn context(&self) -> &JobContext {
        &self.ctx
    }

    pub fn queue(&self) -> &Arc<SqliteJobQueue> {
        &self.queue
    }

    /// Runs jobs until nothing is claimable and nothing is in flight. With
    /// `include_delayed` it also sleeps until delayed jobs come due, so the
    /// queue ends up empty apart from dead letters. Returns how many jobs ran.
    pub async fn run_until_idle(&self, include_delayed: bool) -> JobResult<usize> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        let mut executed = 0usize;

        loop {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };

            if let Some(claimed) = self.queue.claim(&self.owner).await? {
                let worker = self.clone();
                tasks.spawn(async move {
                    worker.execute(claimed).await;
                    drop(permit);
                });
                executed += 1;
                continue;
            }
            drop(permit);

            // In-flight jobs may enqueue follow-ups
            if let Some(joined) = tasks.join_next().await {
                joined?;
                continue;
            }

            if !include_delayed {
                break;
            }
            match self.queue.next_due_in().await? {
                Some(wait) => {
                    debug!("Queue idle, next job due in {:?}", wait);
                    tokio::time::sleep(wait).await;
                }
                None => break,
            }
        }

        Ok(executed)
    }

    /// Runs until `shutdown` flips to true (or its sender is dropped), then
    /// lets in-flight jobs finish.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> JobResult<()> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        info!("Worker {} running {} jobs at a time", self.owner, self.concurrency);

        loop {
            if *shutdown.borrow() {
                break;
            }
            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    error!("Job task panicked: {}", e);
                }
            }

            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.changed() => break,
            };

            let wait = match self.queue.claim(&self.owner).await {
                Ok(Some(claimed)) => {
                    let worker = self.clone();
                    tasks.spawn(async move {
                        worker.execute(claimed).await;
                        drop(permit);
                    });
                    continue;
                }
                Ok(None) => match self.queue.next_due_in().await {
                    Ok(Some(due)) => due.min(IDLE_POLL),
                    Ok(None) => IDLE_POLL,
                    Err(e) => {
                        error!("Failed to read queue: {}", e);
                        IDLE_POLL
                    }
                },
                Err(e) => {
                    error!("Failed to claim job: {}", e);
                    IDLE_POLL
                }
            };
            drop(permit);

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => break,
            }
        }

        if !tasks.is_empty() {
            info!("Waiting for {} in-flight jobs", tasks.len());
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Job task panicked: {}", e);
            }
        }
        info!("Worker {} stopped", self.owner);
        Ok(())
    }

    /// Keeps renewing the lease of a running job so long jobs (a storage
    /// walk) are not redelivered mid-run. Returns once the lease is lost.
    async fn keep_lease(&self, id: i64) {
        let every = (self.queue.lease_duration() / 3).max(Duration::from_millis(50));
        loop {
            tokio::time::sleep(every).await;
            match self.queue.renew(id, &self.owner).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!("Lost the lease of job {}", id);
                    return;
                }
                Err(e) => warn!("Failed to renew lease of job {}: {}", id, e),
            }
        }
    }

    async fn execute(&self, claimed: ClaimedJob) {
        let kind = claimed.job.kind();
        let work = dispatch(&self.ctx, &claimed.job);
        tokio::pin!(work);
        let heartbeat = self.keep_lease(claimed.id);
        tokio::pin!(heartbeat);
        let finished = tokio::select! {
            result = &mut work => Some(result),
            _ = &mut heartbeat => None,
        };
        let result = match finished {
            Some(result) => result,
            None => work.await,
        };
        match result {
            Ok(outcome) => {
                match outcome {
                    JobOutcome::Completed => debug!("{} job {} completed", kind, claimed.id),
                    JobOutcome::Deferred(delay) => {
                        debug!("{} job {} deferred by {:?}", kind, claimed.id, delay)
                    }
                    JobOutcome::Skipped(reason) => {
                        debug!("{} job {} skipped: {}", kind, claimed.id, reason)
                    }
                }
                if let Err(e) = self.queue.ack(claimed.id).await {
                    error!("Failed to acknowledge {} job {}: {}", kind, claimed.id, e);
                }
            }
            Err(err) => match self.queue.fail(&claimed, &err).await {
                Ok(FailureAction::Retried) => {
                    warn!("{} job {} failed, will retry: {}", kind, claimed.id, err)
                }
                Ok(FailureAction::DeadLettered) => {
                    error!("{} job {} dead-lettered: {}", kind, claimed.id, err)
                }
                Ok(FailureAction::Discarded) => info!("{} job {} dropped: {}", kind, claimed.id, err),
                Err(e) => error!(
                    "Failed to record failure of {} job {} ({}): {}",
                    kind, claimed.id, err, e
                ),
            },
        }
    }
}
