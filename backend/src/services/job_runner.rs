//! Job Runner
//!
//! Executes one job attempt end to end: claim it, resolve its handler, run
//! it, and turn the outcome into a state transition. Nothing a handler does
//! (error or panic) escapes this boundary.

use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::models::{Job, JobParams, JobStatus, LogLevel};
use crate::registry::HandlerRegistry;
use crate::services::cancellation::CancellationToken;
use crate::store::{AttemptFailure, JobStore, StoreError};

/// Error returned by a job handler. Its text becomes the job's `error_message`.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("{0}")]
    Failed(String),
    #[error("job was cancelled")]
    Cancelled,
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// What happened to one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Missing, no longer pending, or claimed by someone else.
    Skipped,
    Completed,
    /// Failed with retries left; the job is pending again.
    Retrying,
    Failed,
    Cancelled,
    /// The job changed state underneath us (timed out, cancelled) so the result was dropped.
    Discarded,
    /// A store error interrupted the attempt and the job could not be handed
    /// back either; timeout detection will pick it up.
    Aborted,
}

/// Progress and log sink handed to a handler, bound to one job.
#[derive(Clone)]
pub struct JobContext {
    job_id: String,
    store: Arc<dyn JobStore>,
    token: CancellationToken,
}

impl JobContext {
    pub fn new(job_id: impl Into<String>, store: Arc<dyn JobStore>, token: CancellationToken) -> Self {
        Self {
            job_id: job_id.into(),
            store,
            token,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub async fn report_progress(&self, current: i64, total: i64) -> Result<(), JobError> {
        if !self.store.update_progress(&self.job_id, current, total).await? {
            debug!("Progress update ignored, job {} no longer exists", self.job_id);
        }
        Ok(())
    }

    /// Appends a job log line. Failing to persist it never fails the job.
    pub async fn log(&self, level: LogLevel, message: impl AsRef<str>) {
        let message = message.as_ref();
        match level {
            LogLevel::Info => info!(job_id = %self.job_id, "{}", message),
            LogLevel::Warning => warn!(job_id = %self.job_id, "{}", message),
            LogLevel::Error => error!(job_id = %self.job_id, "{}", message),
        }
        if let Err(e) = self.store.append_log(&self.job_id, level, message).await {
            warn!("Failed to persist log line for job {}: {}", self.job_id, e);
        }
    }

    pub async fn info(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Info, message).await
    }

    pub async fn warn(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Warning, message).await
    }

    pub async fn error(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Error, message).await
    }

    /// True once the scheduler asked running work to stop.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    /// Cooperative cancellation point.
    ///
    /// Returns `JobError::Cancelled` if the scheduler is shutting down or the
    /// job was cancelled through the API. A store hiccup is not a cancellation.
    pub async fn checkpoint(&self) -> Result<(), JobError> {
        if self.token.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        match self.store.get(&self.job_id).await {
            Ok(Some(job)) if job.status == JobStatus::Cancelled => Err(JobError::Cancelled),
            Ok(_) => Ok(()),
            Err(e) => {
                warn!("Cancellation check failed for job {}: {}", self.job_id, e);
                Ok(())
            }
        }
    }
}

/// Terminal writes after a claim are retried this many times on transient
/// store errors before the attempt gives up.
const TERMINAL_WRITE_ATTEMPTS: u32 = 3;
const TERMINAL_WRITE_BACKOFF: Duration = Duration::from_millis(200);

/// One claimed execution of a job. `attempt` is the `retry_count` the job was
/// claimed with and identifies this execution in guarded writes.
struct Claim {
    job: Job,
    attempt: i32,
}

/// Runs one attempt of `job_id`. Never fails; store errors are logged and
/// reported as `RunOutcome::Aborted`.
pub async fn run_job(
    store: Arc<dyn JobStore>,
    registry: Arc<HandlerRegistry>,
    job_id: String,
    token: CancellationToken,
) -> RunOutcome {
    let claim = match claim(store.as_ref(), &job_id).await {
        Ok(Some(claim)) => claim,
        Ok(None) => return RunOutcome::Skipped,
        Err(e) => {
            error!("❌ Could not claim job {}: {}", job_id, e);
            return RunOutcome::Aborted;
        }
    };

    match execute(&store, &registry, &claim, token).await {
        Ok(outcome) => outcome,
        Err(e) => release(store.as_ref(), &claim, &e).await,
    }
}

async fn claim(store: &dyn JobStore, job_id: &str) -> Result<Option<Claim>, StoreError> {
    match store.get(job_id).await? {
        Some(job) if job.status == JobStatus::Pending => {}
        Some(job) => {
            debug!("Job {} is {}, not starting it", job_id, job.status);
            return Ok(None);
        }
        None => {
            debug!("Job {} disappeared before it could start", job_id);
            return Ok(None);
        }
    }

    if !store.start(job_id).await? {
        debug!("Job {} was claimed or cancelled concurrently", job_id);
        return Ok(None);
    }

    // Re-read so the attempt matches the row this claim actually won
    match store.get(job_id).await? {
        Some(job) if job.status == JobStatus::Running => Ok(Some(Claim {
            attempt: job.retry_count,
            job,
        })),
        _ => Ok(None),
    }
}

async fn execute(
    store: &Arc<dyn JobStore>,
    registry: &HandlerRegistry,
    claim: &Claim,
    token: CancellationToken,
) -> Result<RunOutcome, StoreError> {
    let job = &claim.job;
    let job_id = job.job_id.as_str();

    info!(
        "🏃 Starting job: {} [{}] (attempt {})",
        job_id,
        job.job_type,
        claim.attempt + 1
    );

    let Some(handler) = registry.get_handler(&job.job_type) else {
        let message = format!("no handler for type '{}'", job.job_type);
        error!("❌ Job {} failed: {}", job_id, message);
        record(store.as_ref(), job_id, LogLevel::Error, &message).await;
        persist(job_id, || store.complete(job_id, false, Some(message.as_str()))).await?;
        return Ok(RunOutcome::Failed);
    };

    let params = JobParams::from(store.get_params(job_id).await?);
    let ctx = JobContext::new(job_id, store.clone(), token);
    let started = Instant::now();

    let result = match AssertUnwindSafe(handler.run(ctx, params))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(panic) => Err(JobError::Failed(format!(
            "handler panicked: {}",
            panic_message(panic.as_ref())
        ))),
    };
    let duration_ms = started.elapsed().as_millis();

    match result {
        Ok(()) => {
            if persist(job_id, || store.complete(job_id, true, None)).await? {
                info!("✅ Job completed: {} (duration: {}ms)", job_id, duration_ms);
                record(store.as_ref(), job_id, LogLevel::Info, "job completed").await;
                Ok(RunOutcome::Completed)
            } else {
                warn!(
                    "Job {} finished after it left the running state, result discarded",
                    job_id
                );
                Ok(RunOutcome::Discarded)
            }
        }
        Err(JobError::Cancelled) => {
            let cancelled_here =
                persist(job_id, || store.cancel_attempt(job_id, claim.attempt)).await?;
            let cancelled = cancelled_here
                || matches!(
                    store.get(job_id).await?,
                    Some(current) if current.status == JobStatus::Cancelled
                );
            if !cancelled {
                // Timed out and requeued (or failed) while the handler was winding down
                debug!("Job {} stopped after this attempt lost it, nothing to cancel", job_id);
                return Ok(RunOutcome::Discarded);
            }
            info!("🛑 Job cancelled: {} (after {}ms)", job_id, duration_ms);
            record(store.as_ref(), job_id, LogLevel::Warning, "job cancelled").await;
            Ok(RunOutcome::Cancelled)
        }
        Err(e) => {
            let message = e.to_string();
            error!("❌ Job failed: {} - {}", job_id, message);
            record(store.as_ref(), job_id, LogLevel::Error, &message).await;
            retry_or_fail(store.as_ref(), job_id, claim.attempt, &message).await
        }
    }
}

/// Hands a claimed job back after a store error interrupted its attempt, so
/// it does not sit in `running` until its timeout.
async fn release(store: &dyn JobStore, claim: &Claim, cause: &StoreError) -> RunOutcome {
    let job_id = claim.job.job_id.as_str();
    error!("❌ Job {} interrupted by store error: {}", job_id, cause);
    let message = format!("store error: {}", cause);

    match retry_or_fail(store, job_id, claim.attempt, &message).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(
                "Could not release job {}, leaving it to timeout detection: {}",
                job_id, e
            );
            RunOutcome::Aborted
        }
    }
}

/// Shared decision for failed and timed-out attempts: reset to pending while
/// retries remain, otherwise mark the job failed with `error_message`.
///
/// One guarded write, so a handler failure racing a timeout expiry of the
/// same attempt counts the retry once.
pub async fn retry_or_fail(
    store: &dyn JobStore,
    job_id: &str,
    attempt: i32,
    error_message: &str,
) -> Result<RunOutcome, StoreError> {
    match persist(job_id, || store.fail_attempt(job_id, attempt, error_message)).await? {
        AttemptFailure::Requeued => {
            info!("🔁 Job {} will retry (retry {})", job_id, attempt + 1);
            Ok(RunOutcome::Retrying)
        }
        AttemptFailure::Failed => {
            warn!(
                "Job {} failed permanently after {} attempt(s)",
                job_id,
                attempt + 1
            );
            Ok(RunOutcome::Failed)
        }
        AttemptFailure::Stale => {
            debug!("Attempt {} of job {} no longer owns it", attempt + 1, job_id);
            Ok(RunOutcome::Discarded)
        }
    }
}

/// Retries a terminal write on transient store errors.
async fn persist<T, F, Fut>(job_id: &str, mut write: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut tries = 1;
    loop {
        match write().await {
            Err(e) if e.is_retryable() && tries < TERMINAL_WRITE_ATTEMPTS => {
                warn!(
                    "Recording outcome of job {} failed ({}), retrying ({}/{})",
                    job_id, e, tries, TERMINAL_WRITE_ATTEMPTS
                );
                tokio::time::sleep(TERMINAL_WRITE_BACKOFF * tries).await;
                tries += 1;
            }
            other => return other,
        }
    }
}

/// Appends a job log line; a failed write is logged, never fatal.
async fn record(store: &dyn JobStore, job_id: &str, level: LogLevel, message: &str) {
    if let Err(e) = store.append_log(job_id, level, message).await {
        warn!("Failed to persist log line for job {}: {}", job_id, e);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewJob;
    use crate::store::InMemoryJobStore;

    fn setup(registry: HandlerRegistry) -> (Arc<InMemoryJobStore>, Arc<dyn JobStore>, Arc<HandlerRegistry>) {
        let memory = Arc::new(InMemoryJobStore::new());
        let store: Arc<dyn JobStore> = memory.clone();
        (memory, store, Arc::new(registry))
    }

    async fn run(store: &Arc<dyn JobStore>, registry: &Arc<HandlerRegistry>, job_id: &str) -> RunOutcome {
        run_job(
            store.clone(),
            registry.clone(),
            job_id.to_string(),
            CancellationToken::new(),
        )
        .await
    }

    async fn always_fails(_ctx: JobContext, _params: JobParams) -> Result<(), JobError> {
        Err(JobError::Failed("upstream returned 503".to_string()))
    }

    async fn import_rows(ctx: JobContext, params: JobParams) -> Result<(), JobError> {
        let rows = params.get_i64("rows")?.unwrap_or(0);
        ctx.report_progress(rows, rows).await?;
        ctx.info(format!("imported {} rows", rows)).await;
        Ok(())
    }

    async fn explode(_ctx: JobContext, _params: JobParams) -> Result<(), JobError> {
        panic!("index out of range")
    }

    async fn cancelled_mid_run(ctx: JobContext, _params: JobParams) -> Result<(), JobError> {
        // Simulates a cancel request arriving while the handler works
        ctx.store.cancel(ctx.job_id()).await?;
        ctx.checkpoint().await?;
        Ok(())
    }

    async fn wait_for_shutdown(ctx: JobContext, _params: JobParams) -> Result<(), JobError> {
        ctx.cancellation_token().cancelled().await;
        ctx.checkpoint().await
    }

    fn failing_registry() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.register("flaky", always_fails);
        registry
    }

    #[tokio::test]
    async fn test_successful_run_completes_job() {
        let mut registry = HandlerRegistry::new();
        registry.register("import", import_rows);
        let (_, store, registry) = setup(registry);
        let job = store
            .create(NewJob::new("import").param("rows", "40"))
            .await
            .unwrap();

        assert_eq!(run(&store, &registry, &job.job_id).await, RunOutcome::Completed);

        let job = store.get(&job.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!((job.progress, job.total), (40, 40));
        assert!(job.completed_at.is_some());
        let logs = store.get_logs(&job.job_id).await.unwrap();
        assert!(logs.iter().any(|l| l.message == "imported 40 rows"));
    }

    #[tokio::test]
    async fn test_failure_with_retries_left_resets_to_pending() {
        let (_, store, registry) = setup(failing_registry());
        let job = store.create(NewJob::new("flaky")).await.unwrap();

        assert_eq!(run(&store, &registry, &job.job_id).await, RunOutcome::Retrying);

        let job = store.get(&job.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 1);
        assert!(job.started_at.is_none());
    }

    #[tokio::test]
    async fn test_failure_without_retries_marks_failed() {
        let (_, store, registry) = setup(failing_registry());
        let job = store
            .create(NewJob::new("flaky").max_retries(0))
            .await
            .unwrap();

        assert_eq!(run(&store, &registry, &job.job_id).await, RunOutcome::Failed);

        let job = store.get(&job.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some("upstream returned 503"));
    }

    #[tokio::test]
    async fn test_missing_handler_is_fatal() {
        let (_, store, registry) = setup(HandlerRegistry::new());
        let job = store.create(NewJob::new("ghost")).await.unwrap();

        assert_eq!(run(&store, &registry, &job.job_id).await, RunOutcome::Failed);

        let job = store.get(&job.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 0);
        assert!(job.error_message.unwrap().contains("no handler for type"));
    }

    #[tokio::test]
    async fn test_panicking_handler_is_contained() {
        let mut registry = HandlerRegistry::new();
        registry.register("explode", explode);
        let (_, store, registry) = setup(registry);
        let job = store
            .create(NewJob::new("explode").max_retries(0))
            .await
            .unwrap();

        assert_eq!(run(&store, &registry, &job.job_id).await, RunOutcome::Failed);

        let job = store.get(&job.job_id).await.unwrap().unwrap();
        assert!(job.error_message.unwrap().contains("index out of range"));
    }

    #[tokio::test]
    async fn test_non_pending_job_is_skipped() {
        let (_, store, registry) = setup(failing_registry());
        let job = store.create(NewJob::new("flaky")).await.unwrap();
        store.cancel(&job.job_id).await.unwrap();

        assert_eq!(run(&store, &registry, &job.job_id).await, RunOutcome::Skipped);
        assert_eq!(run(&store, &registry, "missing").await, RunOutcome::Skipped);

        let job = store.get(&job.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.started_at.is_none());
    }

    #[tokio::test]
    async fn test_checkpoint_observes_api_cancellation() {
        let mut registry = HandlerRegistry::new();
        registry.register("long", cancelled_mid_run);
        let (_, store, registry) = setup(registry);
        let job = store.create(NewJob::new("long")).await.unwrap();

        assert_eq!(run(&store, &registry, &job.job_id).await, RunOutcome::Cancelled);

        let job = store.get(&job.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.error_message.is_none());
    }

    #[tokio::test]
    async fn test_token_cancellation_cancels_job() {
        let mut registry = HandlerRegistry::new();
        registry.register("long", wait_for_shutdown);
        let (_, store, registry) = setup(registry);
        let job = store.create(NewJob::new("long")).await.unwrap();
        let token = CancellationToken::new();
        token.cancel();

        let outcome = run_job(store.clone(), registry, job.job_id.clone(), token).await;

        assert_eq!(outcome, RunOutcome::Cancelled);
        let job = store.get(&job.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_retry_or_fail_ignores_jobs_not_running() {
        let (_, store, _) = setup(HandlerRegistry::new());
        let job = store.create(NewJob::new("flaky")).await.unwrap();

        let outcome = retry_or_fail(store.as_ref(), &job.job_id, 0, "late").await.unwrap();

        assert_eq!(outcome, RunOutcome::Discarded);
        let job = store.get(&job.job_id).await.unwrap().unwrap();
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_retry_or_fail_counts_racing_reports_once() {
        let (_, store, _) = setup(HandlerRegistry::new());
        let job = store
            .create(NewJob::new("flaky").max_retries(1))
            .await
            .unwrap();
        store.start(&job.job_id).await.unwrap();

        let first = retry_or_fail(store.as_ref(), &job.job_id, 0, "boom").await.unwrap();
        let second = retry_or_fail(store.as_ref(), &job.job_id, 0, "job exceeded timeout of 1s")
            .await
            .unwrap();

        assert_eq!(first, RunOutcome::Retrying);
        assert_eq!(second, RunOutcome::Discarded);
        let job = store.get(&job.job_id).await.unwrap().unwrap();
        assert_eq!(job.retry_count, 1);
        assert!(job.retry_count <= job.max_retries);
    }

    async fn requeued_then_stopped(ctx: JobContext, _params: JobParams) -> Result<(), JobError> {
        // The scheduler expires this attempt, then the handler sees the signal
        ctx.store
            .fail_attempt(ctx.job_id(), 0, "job exceeded timeout of 1s")
            .await?;
        Err(JobError::Cancelled)
    }

    #[tokio::test]
    async fn test_stale_attempt_does_not_cancel_requeued_job() {
        let mut registry = HandlerRegistry::new();
        registry.register("long", requeued_then_stopped);
        let (_, store, registry) = setup(registry);
        let job = store.create(NewJob::new("long")).await.unwrap();

        assert_eq!(run(&store, &registry, &job.job_id).await, RunOutcome::Discarded);

        let job = store.get(&job.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 1);
        assert!(job.cancelled_at.is_none());
    }

    fn registry_failing_store_after_handler(memory: Arc<InMemoryJobStore>, failures: usize) -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.register("import", move |_ctx: JobContext, _p: JobParams| {
            let memory = memory.clone();
            async move {
                memory.fail_next(failures);
                Ok::<(), JobError>(())
            }
        });
        registry
    }

    #[tokio::test]
    async fn test_transient_error_on_completion_is_retried() {
        let memory = Arc::new(InMemoryJobStore::new());
        let store: Arc<dyn JobStore> = memory.clone();
        let registry = Arc::new(registry_failing_store_after_handler(memory.clone(), 2));
        let job = store.create(NewJob::new("import")).await.unwrap();

        assert_eq!(run(&store, &registry, &job.job_id).await, RunOutcome::Completed);

        let job = store.get(&job.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_unrecordable_completion_hands_job_back() {
        let memory = Arc::new(InMemoryJobStore::new());
        let store: Arc<dyn JobStore> = memory.clone();
        let registry = Arc::new(registry_failing_store_after_handler(memory.clone(), 3));
        let job = store.create(NewJob::new("import")).await.unwrap();

        assert_eq!(run(&store, &registry, &job.job_id).await, RunOutcome::Retrying);

        let job = store.get(&job.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 1);
        assert!(job.started_at.is_none());
    }

    #[tokio::test]
    async fn test_store_outage_before_claim_aborts_attempt() {
        let (memory, store, registry) = setup(failing_registry());
        let job = store.create(NewJob::new("flaky")).await.unwrap();
        memory.fail_next(1);

        assert_eq!(run(&store, &registry, &job.job_id).await, RunOutcome::Aborted);

        let job = store.get(&job.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
    }
}
