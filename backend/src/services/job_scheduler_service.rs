//! Scheduler Loop
//!
//! One background task owns the poll loop and a job store that is not
//! shared with request handlers. Every tick it:
//!
//! 1. Prunes finished executions from its in-flight set
//! 2. Converts timed-out running jobs into a retry or a failure, signalling
//!    the local execution to stop and aborting it if it does not
//! 3. Computes how many more jobs fit under `max_concurrent_tasks`
//! 4. Launches that many eligible pending jobs, oldest first, skipping
//!    retries that are still inside their backoff window
//!
//! Store errors never end the loop: transient ones trigger a reconnect,
//! everything else is logged and the next tick tries again.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::models::{backoff_delay, Job, JobStatus, LogLevel};
use crate::registry::HandlerRegistry;
use crate::services::cancellation::CancellationToken;
use crate::services::job_runner::{retry_or_fail, run_job, RunOutcome};
use crate::store::{JobStore, StoreError};

const RUNNING_SCAN_LIMIT: i64 = 1000;
const READINESS_INITIAL_DELAY: Duration = Duration::from_millis(250);
const READINESS_MAX_DELAY: Duration = Duration::from_secs(5);

struct InFlight {
    handle: JoinHandle<RunOutcome>,
    token: CancellationToken,
    /// Set once the job timed out; the execution is aborted after `timeout_grace`.
    expired_at: Option<Instant>,
}

/// Counters from one poll tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub timed_out: usize,
    pub launched: usize,
    /// Slots in use once this tick's launches are counted.
    pub occupancy: usize,
}

pub struct JobSchedulerService {
    store: Arc<dyn JobStore>,
    registry: Arc<HandlerRegistry>,
    config: SchedulerConfig,
    in_flight: HashMap<String, InFlight>,
}

/// Owner-side handle of a started scheduler.
pub struct SchedulerHandle {
    shutdown: CancellationToken,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stops polling, drains in-flight jobs and waits for the loop to exit.
    pub async fn shutdown(self) {
        info!("🛑 Stopping job scheduler...");
        self.shutdown.cancel();
        if let Err(e) = self.join.await {
            error!("Job scheduler task ended abnormally: {}", e);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

impl JobSchedulerService {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<HandlerRegistry>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            registry,
            config,
            in_flight: HashMap::new(),
        }
    }

    /// Spawns the poll loop onto the runtime.
    pub fn start(self) -> SchedulerHandle {
        let shutdown = CancellationToken::new();
        let join = tokio::spawn(self.run(shutdown.clone()));
        SchedulerHandle { shutdown, join }
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    async fn run(mut self, shutdown: CancellationToken) {
        info!(
            "🚀 Starting job scheduler (max {} concurrent, polling every {:?}, handlers: {:?})",
            self.config.max_concurrent_tasks,
            self.config.poll_interval,
            self.registry.list_registered()
        );

        if self.wait_for_store(&shutdown).await {
            loop {
                match self.tick().await {
                    Ok(report) if report.launched > 0 || report.timed_out > 0 => {
                        debug!("Scheduler tick: {:?}", report);
                    }
                    Ok(_) => {}
                    Err(e) => self.recover(e).await,
                }

                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    _ = shutdown.cancelled() => break,
                }
            }
        }

        self.drain().await;
        self.store.close().await;
        info!("✅ Job scheduler stopped");
    }

    /// Bounded wait for the store to accept queries.
    ///
    /// Returns false only if shutdown was requested while waiting. Giving up
    /// after `startup_max_wait` still returns true; the loop then relies on
    /// its own error recovery.
    async fn wait_for_store(&self, shutdown: &CancellationToken) -> bool {
        let deadline = Instant::now() + self.config.startup_max_wait;
        let mut delay = READINESS_INITIAL_DELAY;

        loop {
            match self.store.ping().await {
                Ok(()) => {
                    info!("🔌 Job store is ready");
                    return true;
                }
                Err(e) if e.is_retryable() && Instant::now() + delay < deadline => {
                    warn!("Job store not ready ({}), retrying in {:?}", e, delay);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.cancelled() => return false,
                    }
                    delay = (delay * 2).min(READINESS_MAX_DELAY);
                }
                Err(e) => {
                    warn!(
                        "Job store still unavailable after waiting up to {:?}, polling anyway: {}",
                        self.config.startup_max_wait, e
                    );
                    return true;
                }
            }
        }
    }

    /// Runs one poll cycle.
    pub async fn tick(&mut self) -> Result<TickReport, StoreError> {
        self.prune_in_flight();
        let mut report = TickReport::default();

        let running = self
            .store
            .list(Some(JobStatus::Running), RUNNING_SCAN_LIMIT, 0)
            .await?;
        let mut running_ids: HashSet<String> = HashSet::with_capacity(running.len());
        for job in running {
            if self.store.check_timeout(&job.job_id).await? {
                self.expire(&job).await?;
                report.timed_out += 1;
            } else {
                running_ids.insert(job.job_id);
            }
        }

        // A local execution that already claimed its job is counted once, via the store
        let unclaimed_local = self
            .in_flight
            .keys()
            .filter(|id| !running_ids.contains(*id))
            .count();
        let running_count = self.store.running_count().await?.max(0) as usize;
        let occupancy = running_count + unclaimed_local;
        let admission = self.config.max_concurrent_tasks.saturating_sub(occupancy);
        report.occupancy = occupancy;

        if admission == 0 {
            return Ok(report);
        }

        let now = Utc::now();
        let candidates = self
            .store
            .list(Some(JobStatus::Pending), self.config.pending_scan_limit, 0)
            .await?;
        let selected: Vec<Job> = candidates
            .into_iter()
            .filter(|job| !self.in_flight.contains_key(&job.job_id))
            .filter(|job| backoff_elapsed(job, now, self.config.max_backoff_secs))
            .take(admission)
            .collect();

        for job in selected {
            self.launch(job.job_id);
            report.launched += 1;
        }
        report.occupancy += report.launched;

        Ok(report)
    }

    /// Retry-or-fail for a job that ran past its timeout.
    ///
    /// A local execution of it is told to stop and stays in the in-flight set
    /// until it ends or is aborted after `timeout_grace`, so the job is not
    /// relaunched next to it. Whatever it reports later is discarded.
    async fn expire(&mut self, job: &Job) -> Result<(), StoreError> {
        let message = format!("job exceeded timeout of {}s", job.timeout_seconds);
        warn!("⏰ Job {} [{}]: {}", job.job_id, job.job_type, message);
        self.store
            .append_log(&job.job_id, LogLevel::Warning, &message)
            .await?;
        retry_or_fail(self.store.as_ref(), &job.job_id, job.retry_count, &message).await?;

        if let Some(f) = self.in_flight.get_mut(&job.job_id) {
            f.token.cancel();
            f.expired_at.get_or_insert_with(Instant::now);
        }
        Ok(())
    }

    fn launch(&mut self, job_id: String) {
        let token = CancellationToken::new();
        let handle = tokio::spawn(run_job(
            self.store.clone(),
            self.registry.clone(),
            job_id.clone(),
            token.clone(),
        ));
        debug!("Launched job {}", job_id);
        self.in_flight.insert(
            job_id,
            InFlight {
                handle,
                token,
                expired_at: None,
            },
        );
    }

    fn prune_in_flight(&mut self) {
        let grace = self.config.timeout_grace;
        for (job_id, f) in &self.in_flight {
            if f.expired_at.is_some_and(|at| at.elapsed() >= grace) && !f.handle.is_finished() {
                warn!(
                    "Job {} ignored its timeout for {:?}, aborting the execution",
                    job_id, grace
                );
                f.handle.abort();
            }
        }
        self.in_flight.retain(|_, f| !f.handle.is_finished());
    }

    async fn recover(&self, error: StoreError) {
        if error.is_retryable() {
            warn!("Job store connection lost ({}), reconnecting", error);
            if let Err(e) = self.store.reconnect().await {
                error!("Failed to reconnect job store: {}", e);
            }
        } else {
            error!("Scheduler tick failed: {}", error);
        }
    }

    /// Signals every in-flight job, waits up to `shutdown_timeout`, then
    /// aborts whatever is left.
    async fn drain(&mut self) {
        if self.in_flight.is_empty() {
            info!("No running jobs to wait for during shutdown");
            return;
        }

        let in_flight: Vec<InFlight> = self.in_flight.drain().map(|(_, f)| f).collect();
        info!(
            "Graceful shutdown: cancelling {} in-flight job(s) (timeout: {:?})",
            in_flight.len(),
            self.config.shutdown_timeout
        );

        for f in &in_flight {
            f.token.cancel();
        }
        let abort_handles: Vec<_> = in_flight.iter().map(|f| f.handle.abort_handle()).collect();
        let started = Instant::now();

        match tokio::time::timeout(
            self.config.shutdown_timeout,
            join_all(in_flight.into_iter().map(|f| f.handle)),
        )
        .await
        {
            Ok(_) => info!("All in-flight jobs finished in {:?}", started.elapsed()),
            Err(_) => {
                warn!(
                    "Graceful shutdown timeout ({:?}) exceeded, aborting remaining jobs",
                    self.config.shutdown_timeout
                );
                for handle in abort_handles {
                    handle.abort();
                }
            }
        }
    }
}

/// Backoff gate for retried jobs: `min(2^retry_count, max_backoff_secs)`
/// seconds since the job was last reset for retry.
pub fn backoff_elapsed(job: &Job, now: DateTime<Utc>, max_backoff_secs: u64) -> bool {
    if job.retry_count <= 0 {
        return true;
    }
    match job.retried_at.or(job.started_at) {
        Some(since) => now - since >= backoff_delay(job.retry_count, max_backoff_secs),
        None => true,
    }
}
