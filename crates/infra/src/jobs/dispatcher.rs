//! Background dispatcher: starts eligible jobs as capacity allows.
//!
//! Each pass asks the store for eligible jobs in scheduling order and hands
//! them to the coordinator, which applies the per-tenant gate. Passes run
//! every `poll_interval`, and early whenever the coordinator signals that a
//! slot was released or new work was submitted.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use plansight_ai::TenantScope;
use plansight_core::TenantId;

use super::coordinator::{ExecuteOptions, ExecuteOutcome, ExecutionCoordinator};
use crate::config::AppConfig;
use crate::error::JobError;

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// How often to run a pass when nothing wakes the loop
    pub poll_interval: Duration,
    /// Jobs considered per pass
    pub batch_size: usize,
    /// Age after which a `Processing` job with no live attempt is failed
    pub stale_after: Duration,
    /// How long shutdown waits for running attempts
    pub shutdown_grace: Duration,
    /// Name for logging
    pub name: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 20,
            stale_after: Duration::from_secs(600),
            shutdown_grace: Duration::from_secs(30),
            name: "job-dispatcher".to_string(),
        }
    }
}

impl DispatcherConfig {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            batch_size: config.scheduler.batch_size.max(1),
            stale_after: config.stale_after(),
            name: config.execution.worker_id.clone(),
            ..Default::default()
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

/// Dispatcher runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct DispatcherStats {
    pub passes: u64,
    pub attempts_started: u64,
    pub jobs_queued: u64,
    pub stale_recovered: u64,
    pub errors: u64,
    pub last_pass_at: Option<DateTime<Utc>>,
    pub uptime_secs: u64,
}

/// What one pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub considered: usize,
    pub started: usize,
    pub queued: usize,
    pub skipped: usize,
}

/// Handle to control a running dispatcher.
#[derive(Debug)]
pub struct DispatcherHandle {
    shutdown: CancellationToken,
    join: JoinHandle<()>,
    stats: Arc<Mutex<DispatcherStats>>,
}

impl DispatcherHandle {
    /// Stop scheduling new attempts and wait for the loop to exit.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.join.await {
            error!(error = %e, "dispatcher task ended abnormally");
        }
    }

    /// Get current dispatcher statistics.
    pub fn stats(&self) -> DispatcherStats {
        lock(&self.stats).clone()
    }
}

pub struct Dispatcher {
    coordinator: Arc<ExecutionCoordinator>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(coordinator: Arc<ExecutionCoordinator>, config: DispatcherConfig) -> Self {
        Self {
            coordinator,
            config,
        }
    }

    /// One scheduling pass over every tenant.
    ///
    /// Tenants at their concurrency limit are excluded from the fetch, so a
    /// long backlog from one tenant never hides startable jobs of another.
    /// When a tenant fills up mid-pass the store is asked again without it.
    pub async fn run_pass(&self) -> Result<PassSummary, JobError> {
        let now = Utc::now();
        let mut saturated: HashSet<TenantId> =
            self.coordinator.gate().saturated().into_iter().collect();
        let mut summary = PassSummary::default();

        loop {
            let excluding: Vec<TenantId> = saturated.iter().copied().collect();
            let eligible = self
                .coordinator
                .store()
                .eligible(TenantScope::Any, now, self.config.batch_size, &excluding)
                .await?;
            let fetched = eligible.len();
            summary.considered += fetched;

            let mut newly_saturated = false;
            for job in eligible {
                match self
                    .coordinator
                    .execute(job.tenant_id, job.id, ExecuteOptions::default())
                    .await
                {
                    Ok(ExecuteOutcome::Started(_)) => summary.started += 1,
                    Ok(ExecuteOutcome::Queued(_)) => {
                        summary.queued += 1;
                        newly_saturated |= saturated.insert(job.tenant_id);
                    }
                    // Raced with another writer; the next pass sees the new state.
                    Err(JobError::Conflict(_)) | Err(JobError::NotFound(_)) => summary.skipped += 1,
                    Err(e) => return Err(e),
                }
            }

            // Each extra round excludes one more tenant, so this terminates.
            if !newly_saturated || fetched < self.config.batch_size || summary.started >= self.config.batch_size {
                break;
            }
        }
        Ok(summary)
    }

    /// Spawn the dispatcher loop on the current runtime.
    pub fn spawn(self) -> DispatcherHandle {
        let shutdown = CancellationToken::new();
        let stats = Arc::new(Mutex::new(DispatcherStats::default()));

        let join = tokio::spawn(dispatcher_loop(self, shutdown.clone(), Arc::clone(&stats)));

        DispatcherHandle {
            shutdown,
            join,
            stats,
        }
    }

    async fn recover_stale(&self, stats: &Mutex<DispatcherStats>) {
        match self.coordinator.recover_stale(self.config.stale_after).await {
            Ok(0) => {}
            Ok(n) => {
                info!(dispatcher = %self.config.name, recovered = n, "failed stale attempts");
                lock(stats).stale_recovered += n as u64;
            }
            Err(e) => {
                error!(dispatcher = %self.config.name, error = %e, "stale attempt recovery failed");
                lock(stats).errors += 1;
            }
        }
    }

    async fn drain(&self) {
        let deadline = Instant::now() + self.config.shutdown_grace;
        while self.coordinator.running_count() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let remaining = self.coordinator.running_count();
        if remaining > 0 {
            warn!(
                dispatcher = %self.config.name,
                remaining,
                "shutdown grace elapsed with attempts still running"
            );
        }
    }
}

async fn dispatcher_loop(
    dispatcher: Dispatcher,
    shutdown: CancellationToken,
    stats: Arc<Mutex<DispatcherStats>>,
) {
    let name = dispatcher.config.name.clone();
    info!(dispatcher = %name, "job dispatcher started");
    let start_time = Instant::now();
    let wake = dispatcher.coordinator.wakeup();

    dispatcher.recover_stale(&stats).await;
    let mut last_stale_check = Instant::now();

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        if last_stale_check.elapsed() >= dispatcher.config.stale_after / 2 {
            dispatcher.recover_stale(&stats).await;
            last_stale_check = Instant::now();
        }

        match dispatcher.run_pass().await {
            Ok(summary) => {
                if summary.considered > 0 {
                    debug!(
                        dispatcher = %name,
                        considered = summary.considered,
                        started = summary.started,
                        queued = summary.queued,
                        skipped = summary.skipped,
                        "scheduling pass"
                    );
                }
                let mut s = lock(&stats);
                s.passes += 1;
                s.attempts_started += summary.started as u64;
                s.jobs_queued += summary.queued as u64;
                s.last_pass_at = Some(Utc::now());
                s.uptime_secs = start_time.elapsed().as_secs();
            }
            Err(e) => {
                error!(dispatcher = %name, error = %e, "scheduling pass failed");
                lock(&stats).errors += 1;
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = wake.notified() => {}
            _ = tokio::time::sleep(dispatcher.config.poll_interval) => {}
        }
    }

    dispatcher.drain().await;
    info!(dispatcher = %name, "job dispatcher stopped");
}

fn lock(stats: &Mutex<DispatcherStats>) -> MutexGuard<'_, DispatcherStats> {
    stats.lock().unwrap_or_else(PoisonError::into_inner)
}
