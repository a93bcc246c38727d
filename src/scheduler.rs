use clokwerk::{Job, Scheduler, TimeUnits};
use log::{error, info, warn};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::runtime::Handle;

use crate::jobs::{admin, JobContext};

/// Periodic triggers: the nightly refresh-all and an hourly sweep of expired
/// coordination keys. Jobs themselves run on the worker; the scheduler only
/// enqueues.
#[derive(Clone)]
pub struct IndexScheduler {
    ctx: JobContext,
    runtime: Handle,
}

impl IndexScheduler {
    /// Must be called from within a tokio runtime.
    pub fn new(ctx: JobContext) -> Self {
        Self {
            ctx,
            runtime: Handle::current(),
        }
    }

    pub fn start(&self) -> JoinHandle<()> {
        let mut scheduler = Scheduler::new();

        match self.ctx.config.nightly_scan_at.clone() {
            Some(at) => {
                let ctx = self.ctx.clone();
                let runtime = self.runtime.clone();
                scheduler.every(1.day()).at(&at).run(move || {
                    runtime.block_on(async {
                        info!("Starting scheduled refresh");
                        match admin::refresh_all(&ctx).await {
                            Ok(run_id) => info!("Scheduled refresh queued index run {}", run_id),
                            Err(e) => error!("Scheduled refresh failed: {}", e),
                        }
                    });
                });
                info!("Nightly refresh scheduled at {}", at);
            }
            None => warn!("Nightly refresh disabled"),
        }

        let store = self.ctx.coordinator.store().clone();
        let runtime = self.runtime.clone();
        scheduler.every(1.hour()).run(move || {
            runtime.block_on(async {
                match store.sweep_expired().await {
                    Ok(0) => {}
                    Ok(removed) => info!("Swept {} expired coordination keys", removed),
                    Err(e) => error!("Coordination sweep failed: {}", e),
                }
            });
        });

        thread::spawn(move || loop {
            scheduler.run_pending();
            thread::sleep(Duration::from_secs(60));
        })
    }

    /// Queues a refresh right away, as the server does on startup.
    pub async fn run_startup_refresh(&self) {
        match admin::refresh_all(&self.ctx).await {
            Ok(run_id) => info!("Startup refresh queued index run {}", run_id),
            Err(e) => error!("Startup refresh failed: {}", e),
        }
    }
}
