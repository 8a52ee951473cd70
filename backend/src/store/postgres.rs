use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};

use super::{clamp_progress, validate_new_job, AttemptFailure, JobStore, StoreError};
use crate::db::job_queries;
use crate::models::{Job, JobLogLine, JobStatus, LogLevel, NewJob};

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// PostgreSQL-backed job store.
///
/// Holds its own pool. The scheduler builds one with `connect_lazy` so its
/// polling never competes with request handlers for connections, and can
/// swap the pool out after a connection-level failure.
pub struct PgJobStore {
    pool: RwLock<PgPool>,
    database_url: Option<String>,
    max_connections: u32,
}

impl PgJobStore {
    /// Wraps an existing pool. `reconnect` is a no-op for stores built this way.
    pub fn new(pool: PgPool) -> Self {
        let max_connections = pool.options().get_max_connections();
        Self {
            pool: RwLock::new(pool),
            database_url: None,
            max_connections,
        }
    }

    /// Builds a dedicated pool that connects on first use.
    pub fn connect_lazy(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = build_pool(database_url, max_connections)?;
        Ok(Self {
            pool: RwLock::new(pool),
            database_url: Some(database_url.to_string()),
            max_connections,
        })
    }

    fn pool(&self) -> PgPool {
        self.pool.read().clone()
    }
}

fn build_pool(database_url: &str, max_connections: u32) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect_lazy(database_url)?;
    Ok(pool)
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create(&self, new_job: NewJob) -> Result<Job, StoreError> {
        validate_new_job(&new_job)?;
        let job = Job::new(&new_job);
        let created = job_queries::insert_job(&self.pool(), &job, &new_job.params).await?;
        Ok(created)
    }

    async fn get(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        Ok(job_queries::fetch_one(&self.pool(), job_id).await?)
    }

    async fn get_params(&self, job_id: &str) -> Result<HashMap<String, String>, StoreError> {
        Ok(job_queries::fetch_params(&self.pool(), job_id).await?)
    }

    async fn list(
        &self,
        status: Option<JobStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Job>, StoreError> {
        Ok(job_queries::fetch_page(&self.pool(), status, limit.max(0), offset.max(0)).await?)
    }

    async fn count(&self, status: Option<JobStatus>) -> Result<i64, StoreError> {
        Ok(job_queries::count(&self.pool(), status).await?)
    }

    async fn update_progress(
        &self,
        job_id: &str,
        current: i64,
        total: i64,
    ) -> Result<bool, StoreError> {
        let (current, total) = clamp_progress(current, total);
        let rows = job_queries::update_progress(&self.pool(), job_id, current, total).await?;
        Ok(rows > 0)
    }

    async fn start(&self, job_id: &str) -> Result<bool, StoreError> {
        let rows = job_queries::mark_started(&self.pool(), job_id, Utc::now()).await?;
        Ok(rows > 0)
    }

    async fn complete(
        &self,
        job_id: &str,
        success: bool,
        error_message: Option<&str>,
    ) -> Result<bool, StoreError> {
        let (status, error_message) = if success {
            (JobStatus::Completed, None)
        } else {
            (JobStatus::Failed, Some(error_message.unwrap_or("job failed")))
        };
        let rows =
            job_queries::mark_completed(&self.pool(), job_id, status, error_message, Utc::now())
                .await?;
        Ok(rows > 0)
    }

    async fn cancel(&self, job_id: &str) -> Result<bool, StoreError> {
        let rows = job_queries::mark_cancelled(&self.pool(), job_id, Utc::now()).await?;
        Ok(rows > 0)
    }

    async fn increment_retry(&self, job_id: &str) -> Result<bool, StoreError> {
        let rows = job_queries::increment_retry(&self.pool(), job_id).await?;
        Ok(rows > 0)
    }

    async fn reset_for_retry(&self, job_id: &str) -> Result<bool, StoreError> {
        let rows = job_queries::reset_for_retry(&self.pool(), job_id, Utc::now()).await?;
        Ok(rows > 0)
    }

    async fn fail_attempt(
        &self,
        job_id: &str,
        attempt: i32,
        error_message: &str,
    ) -> Result<AttemptFailure, StoreError> {
        let status =
            job_queries::fail_attempt(&self.pool(), job_id, attempt, error_message, Utc::now())
                .await?;
        // The statement only ever lands on pending or failed
        Ok(match status.as_deref() {
            None => AttemptFailure::Stale,
            Some("pending") => AttemptFailure::Requeued,
            Some(_) => AttemptFailure::Failed,
        })
    }

    async fn cancel_attempt(&self, job_id: &str, attempt: i32) -> Result<bool, StoreError> {
        let rows = job_queries::cancel_attempt(&self.pool(), job_id, attempt, Utc::now()).await?;
        Ok(rows > 0)
    }

    async fn check_timeout(&self, job_id: &str) -> Result<bool, StoreError> {
        let job = job_queries::fetch_one(&self.pool(), job_id).await?;
        Ok(job.map_or(false, |job| job.is_timed_out(Utc::now())))
    }

    async fn running_count(&self) -> Result<i64, StoreError> {
        Ok(job_queries::count(&self.pool(), Some(JobStatus::Running)).await?)
    }

    async fn append_log(
        &self,
        job_id: &str,
        level: LogLevel,
        message: &str,
    ) -> Result<(), StoreError> {
        job_queries::insert_log(&self.pool(), job_id, level, message, Utc::now()).await?;
        Ok(())
    }

    async fn get_logs(&self, job_id: &str) -> Result<Vec<JobLogLine>, StoreError> {
        Ok(job_queries::fetch_logs(&self.pool(), job_id).await?)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        job_queries::ping(&self.pool()).await?;
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), StoreError> {
        let Some(url) = self.database_url.as_deref() else {
            warn!("Store was built from a shared pool, skipping reconnect");
            return Ok(());
        };
        let fresh = build_pool(url, self.max_connections)?;
        let old = std::mem::replace(&mut *self.pool.write(), fresh);
        old.close().await;
        info!("🔌 Rebuilt job store connection pool");
        Ok(())
    }

    async fn close(&self) {
        self.pool().close().await;
    }
}
