//! Job Record Store
//!
//! Persistence and atomic state transitions for jobs, their parameters and
//! their log lines. Every mutating call is a single guarded write, and none
//! of them fail on a missing job: callers check the returned `bool`/`Option`.
//! The scheduler loop runs unattended and depends on that to survive benign
//! races (a job cancelled while its timeout is being checked, a job claimed
//! by an earlier tick, ...).

mod memory;
mod postgres;

pub use memory::InMemoryJobStore;
pub use postgres::PgJobStore;

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

use crate::models::{Job, JobLogLine, JobStatus, LogLevel, NewJob};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Validation error: {0}")]
    Validation(String),
}

impl StoreError {
    /// Connection-level failures that a reconnect can fix.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Unavailable(_) => true,
            StoreError::Db(e) => is_transient_db_error(e),
            StoreError::Validation(_) => false,
        }
    }
}

fn is_transient_db_error(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => match db.code() {
            // 08xxx connection exceptions, 57P01 admin shutdown, 57P03 cannot connect now
            Some(code) => code.starts_with("08") || code == "57P01" || code == "57P03",
            None => false,
        },
        other => {
            let msg = other.to_string().to_lowercase();
            msg.contains("connection reset") || msg.contains("starting up")
        }
    }
}

/// Where a failed attempt left its job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptFailure {
    /// Back to pending with the retry counted.
    Requeued,
    /// No retries left, now failed.
    Failed,
    /// The attempt no longer owns the row: the job left `running`, or a
    /// later attempt holds it.
    Stale,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Inserts a pending job together with its params.
    async fn create(&self, new_job: NewJob) -> Result<Job, StoreError>;

    async fn get(&self, job_id: &str) -> Result<Option<Job>, StoreError>;

    async fn get_params(&self, job_id: &str) -> Result<HashMap<String, String>, StoreError>;

    /// Pending jobs come back oldest first, everything else newest first.
    async fn list(
        &self,
        status: Option<JobStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Job>, StoreError>;

    async fn count(&self, status: Option<JobStatus>) -> Result<i64, StoreError>;

    async fn update_progress(&self, job_id: &str, current: i64, total: i64)
        -> Result<bool, StoreError>;

    /// Claims a pending job: `pending -> running`.
    async fn start(&self, job_id: &str) -> Result<bool, StoreError>;

    /// `running -> completed|failed`.
    async fn complete(
        &self,
        job_id: &str,
        success: bool,
        error_message: Option<&str>,
    ) -> Result<bool, StoreError>;

    /// `pending|running -> cancelled`. False once the job is terminal.
    async fn cancel(&self, job_id: &str) -> Result<bool, StoreError>;

    async fn increment_retry(&self, job_id: &str) -> Result<bool, StoreError>;

    /// `running|failed -> pending`, keeping `retry_count`.
    async fn reset_for_retry(&self, job_id: &str) -> Result<bool, StoreError>;

    /// Records a failed attempt as one atomic write. `attempt` is the
    /// `retry_count` the attempt was claimed with; the write only applies
    /// while the job is still running under that attempt.
    async fn fail_attempt(
        &self,
        job_id: &str,
        attempt: i32,
        error_message: &str,
    ) -> Result<AttemptFailure, StoreError>;

    /// `running -> cancelled`, only for the attempt that still owns the row.
    async fn cancel_attempt(&self, job_id: &str, attempt: i32) -> Result<bool, StoreError>;

    async fn check_timeout(&self, job_id: &str) -> Result<bool, StoreError>;

    async fn running_count(&self) -> Result<i64, StoreError>;

    async fn append_log(&self, job_id: &str, level: LogLevel, message: &str)
        -> Result<(), StoreError>;

    async fn get_logs(&self, job_id: &str) -> Result<Vec<JobLogLine>, StoreError>;

    /// Cheap round trip used by the scheduler's readiness wait.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Drops and rebuilds the underlying connection(s).
    async fn reconnect(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn close(&self) {}
}

pub(crate) fn validate_new_job(new_job: &NewJob) -> Result<(), StoreError> {
    if new_job.job_type.trim().is_empty() {
        return Err(StoreError::Validation("job_type must not be empty".to_string()));
    }
    if new_job.max_retries < 0 {
        return Err(StoreError::Validation("max_retries must not be negative".to_string()));
    }
    if new_job.timeout_seconds <= 0 {
        return Err(StoreError::Validation("timeout_seconds must be positive".to_string()));
    }
    Ok(())
}

/// Progress never goes negative and never exceeds a known total.
pub(crate) fn clamp_progress(current: i64, total: i64) -> (i64, i64) {
    let total = total.max(0);
    let current = current.max(0);
    if total > 0 {
        (current.min(total), total)
    } else {
        (current, total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_is_retryable() {
        assert!(StoreError::Unavailable("starting up".into()).is_retryable());
        assert!(StoreError::Db(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(!StoreError::Db(sqlx::Error::RowNotFound).is_retryable());
        assert!(!StoreError::Validation("bad".into()).is_retryable());
    }

    #[test]
    fn test_clamp_progress() {
        assert_eq!(clamp_progress(15, 10), (10, 10));
        assert_eq!(clamp_progress(-3, 10), (0, 10));
        assert_eq!(clamp_progress(7, 0), (7, 0));
        assert_eq!(clamp_progress(4, -1), (4, 0));
    }

    #[test]
    fn test_empty_job_type_rejected() {
        assert!(validate_new_job(&NewJob::new("  ")).is_err());
        assert!(validate_new_job(&NewJob::new("heartbeat").timeout_seconds(0)).is_err());
        assert!(validate_new_job(&NewJob::new("heartbeat")).is_ok());
    }
}
