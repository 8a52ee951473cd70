//! In-memory job store.
//!
//! Same contract as the PostgreSQL store, kept behind a single mutex so each
//! call is one atomic step. Used by tests and for running the scheduler
//! without a database.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{clamp_progress, validate_new_job, AttemptFailure, JobStore, StoreError};
use crate::models::{Job, JobLogLine, JobStatus, LogLevel, NewJob};

#[derive(Default)]
struct MemoryState {
    // Insertion order doubles as creation order
    jobs: Vec<Job>,
    params: HashMap<String, HashMap<String, String>>,
    logs: Vec<JobLogLine>,
}

impl MemoryState {
    fn job_mut(&mut self, job_id: &str) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|j| j.job_id == job_id)
    }
}

#[derive(Default)]
pub struct InMemoryJobStore {
    state: Mutex<MemoryState>,
    failures_pending: AtomicUsize,
    reconnects: AtomicUsize,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` calls fail with a retryable `Unavailable` error.
    pub fn fail_next(&self, n: usize) {
        self.failures_pending.store(n, Ordering::SeqCst);
    }

    pub fn reconnect_count(&self) -> usize {
        self.reconnects.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        let taken = self
            .failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match taken {
            Ok(_) => Err(StoreError::Unavailable("the database system is starting up".to_string())),
            Err(_) => Ok(()),
        }
    }

    /// Applies `f` to the job if it is currently in one of `from`.
    fn transition(
        &self,
        job_id: &str,
        from: &[JobStatus],
        f: impl FnOnce(&mut Job),
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock();
        match state.job_mut(job_id) {
            Some(job) if from.contains(&job.status) => {
                f(job);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, new_job: NewJob) -> Result<Job, StoreError> {
        self.check_available()?;
        validate_new_job(&new_job)?;
        let job = Job::new(&new_job);
        let mut state = self.state.lock();
        state.params.insert(job.job_id.clone(), new_job.params);
        state.jobs.push(job.clone());
        Ok(job)
    }

    async fn get(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        self.check_available()?;
        let state = self.state.lock();
        Ok(state.jobs.iter().find(|j| j.job_id == job_id).cloned())
    }

    async fn get_params(&self, job_id: &str) -> Result<HashMap<String, String>, StoreError> {
        self.check_available()?;
        let state = self.state.lock();
        Ok(state.params.get(job_id).cloned().unwrap_or_default())
    }

    async fn list(
        &self,
        status: Option<JobStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Job>, StoreError> {
        self.check_available()?;
        let state = self.state.lock();
        let matching = state
            .jobs
            .iter()
            .filter(|j| status.map_or(true, |s| j.status == s))
            .cloned();
        let ordered: Vec<Job> = if status == Some(JobStatus::Pending) {
            matching.collect()
        } else {
            matching.rev().collect()
        };
        Ok(ordered
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn count(&self, status: Option<JobStatus>) -> Result<i64, StoreError> {
        self.check_available()?;
        let state = self.state.lock();
        let count = state
            .jobs
            .iter()
            .filter(|j| status.map_or(true, |s| j.status == s))
            .count();
        Ok(count as i64)
    }

    async fn update_progress(
        &self,
        job_id: &str,
        current: i64,
        total: i64,
    ) -> Result<bool, StoreError> {
        let (current, total) = clamp_progress(current, total);
        self.transition(
            job_id,
            &[
                JobStatus::Pending,
                JobStatus::Running,
                JobStatus::Completed,
                JobStatus::Failed,
                JobStatus::Cancelled,
            ],
            |job| {
                job.progress = current;
                job.total = total;
            },
        )
    }

    async fn start(&self, job_id: &str) -> Result<bool, StoreError> {
        self.transition(job_id, &[JobStatus::Pending], |job| {
            job.status = JobStatus::Running;
            job.started_at = Some(Utc::now());
        })
    }

    async fn complete(
        &self,
        job_id: &str,
        success: bool,
        error_message: Option<&str>,
    ) -> Result<bool, StoreError> {
        self.transition(job_id, &[JobStatus::Running], |job| {
            if success {
                job.status = JobStatus::Completed;
                job.error_message = None;
            } else {
                job.status = JobStatus::Failed;
                job.error_message = Some(error_message.unwrap_or("job failed").to_string());
            }
            job.completed_at = Some(Utc::now());
        })
    }

    async fn cancel(&self, job_id: &str) -> Result<bool, StoreError> {
        self.transition(job_id, &[JobStatus::Pending, JobStatus::Running], |job| {
            let now = Utc::now();
            job.status = JobStatus::Cancelled;
            job.cancelled_at = Some(now);
            job.completed_at = Some(now);
        })
    }

    async fn increment_retry(&self, job_id: &str) -> Result<bool, StoreError> {
        self.transition(job_id, &[JobStatus::Running, JobStatus::Failed], |job| {
            job.retry_count += 1;
        })
    }

    async fn reset_for_retry(&self, job_id: &str) -> Result<bool, StoreError> {
        self.transition(job_id, &[JobStatus::Running, JobStatus::Failed], |job| {
            job.status = JobStatus::Pending;
            job.started_at = None;
            job.completed_at = None;
            job.retried_at = Some(Utc::now());
        })
    }

    async fn fail_attempt(
        &self,
        job_id: &str,
        attempt: i32,
        error_message: &str,
    ) -> Result<AttemptFailure, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock();
        let now = Utc::now();
        match state.job_mut(job_id) {
            Some(job) if job.status == JobStatus::Running && job.retry_count == attempt => {
                if job.retries_remaining() {
                    job.status = JobStatus::Pending;
                    job.retry_count += 1;
                    job.started_at = None;
                    job.completed_at = None;
                    job.retried_at = Some(now);
                    Ok(AttemptFailure::Requeued)
                } else {
                    job.status = JobStatus::Failed;
                    job.error_message = Some(error_message.to_string());
                    job.completed_at = Some(now);
                    Ok(AttemptFailure::Failed)
                }
            }
            _ => Ok(AttemptFailure::Stale),
        }
    }

    async fn cancel_attempt(&self, job_id: &str, attempt: i32) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock();
        match state.job_mut(job_id) {
            Some(job) if job.status == JobStatus::Running && job.retry_count == attempt => {
                let now = Utc::now();
                job.status = JobStatus::Cancelled;
                job.cancelled_at = Some(now);
                job.completed_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn check_timeout(&self, job_id: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let state = self.state.lock();
        let now = Utc::now();
        Ok(state
            .jobs
            .iter()
            .find(|j| j.job_id == job_id)
            .map_or(false, |job| job.is_timed_out(now)))
    }

    async fn running_count(&self) -> Result<i64, StoreError> {
        self.count(Some(JobStatus::Running)).await
    }

    async fn append_log(
        &self,
        job_id: &str,
        level: LogLevel,
        message: &str,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        let mut state = self.state.lock();
        if state.jobs.iter().any(|j| j.job_id == job_id) {
            state.logs.push(JobLogLine {
                job_id: job_id.to_string(),
                level,
                message: message.to_string(),
                created_at: Utc::now(),
            });
        }
        Ok(())
    }

    async fn get_logs(&self, job_id: &str) -> Result<Vec<JobLogLine>, StoreError> {
        self.check_available()?;
        let state = self.state.lock();
        Ok(state
            .logs
            .iter()
            .filter(|l| l.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check_available()
    }

    async fn reconnect(&self) -> Result<(), StoreError> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
