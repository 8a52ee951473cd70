//! Producer-facing job operations used by the HTTP layer.
//!
//! Request handlers only create, read and cancel jobs here; executing them is
//! the scheduler's business.

use tracing::info;

use crate::errors::AppError;
use crate::models::{
    CreateJobResponse, JobLogLine, JobStatus, JobStatusView, JobSummary, ListJobsQuery,
    ListJobsResponse, NewJob,
};
use crate::registry::HandlerRegistry;
use crate::store::JobStore;

pub const DEFAULT_LIST_LIMIT: i64 = 50;
pub const MAX_LIST_LIMIT: i64 = 500;

pub async fn create_job(
    store: &dyn JobStore,
    registry: &HandlerRegistry,
    new_job: NewJob,
) -> Result<CreateJobResponse, AppError> {
    if new_job.job_type.trim().is_empty() {
        return Err(AppError::Validation("job_type is required".to_string()));
    }
    if !registry.contains(&new_job.job_type) {
        return Err(AppError::Validation(format!(
            "no handler registered for job type '{}'",
            new_job.job_type
        )));
    }

    let job = store.create(new_job).await?;
    info!("📥 Queued job {} [{}]", job.job_id, job.job_type);

    Ok(CreateJobResponse {
        job_id: job.job_id,
        status: job.status,
    })
}

pub async fn get_job_status(store: &dyn JobStore, job_id: &str) -> Result<JobStatusView, AppError> {
    store
        .get(job_id)
        .await?
        .map(JobStatusView::from)
        .ok_or(AppError::NotFound)
}

/// Cancels a pending or running job. Running handlers stop at their next checkpoint.
pub async fn cancel_job(store: &dyn JobStore, job_id: &str) -> Result<JobStatusView, AppError> {
    if store.cancel(job_id).await? {
        info!("🛑 Cancellation requested for job {}", job_id);
        return get_job_status(store, job_id).await;
    }

    match store.get(job_id).await? {
        None => Err(AppError::NotFound),
        Some(job) => Err(AppError::Conflict(format!(
            "job {} is already {}",
            job_id, job.status
        ))),
    }
}

pub async fn list_jobs(
    store: &dyn JobStore,
    query: ListJobsQuery,
) -> Result<ListJobsResponse, AppError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
    let offset = query.offset.unwrap_or(0).max(0);

    let jobs = store.list(query.status, limit, offset).await?;
    let total = store.count(query.status).await?;

    Ok(ListJobsResponse {
        jobs: jobs.into_iter().map(JobSummary::from).collect(),
        total,
        limit,
        offset,
    })
}

pub async fn get_job_logs(store: &dyn JobStore, job_id: &str) -> Result<Vec<JobLogLine>, AppError> {
    if store.get(job_id).await?.is_none() {
        return Err(AppError::NotFound);
    }
    Ok(store.get_logs(job_id).await?)
}

/// True if a job of `job_type` is pending or running. Producers use this to
/// keep a job type single-flight.
pub async fn has_active_job(store: &dyn JobStore, job_type: &str) -> Result<bool, AppError> {
    for status in [JobStatus::Pending, JobStatus::Running] {
        let jobs = store.list(Some(status), MAX_LIST_LIMIT, 0).await?;
        if jobs.iter().any(|j| j.job_type == job_type) {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobParams;
    use crate::services::job_runner::{JobContext, JobError};
    use crate::store::InMemoryJobStore;

    async fn noop(_ctx: JobContext, _params: JobParams) -> Result<(), JobError> {
        Ok(())
    }

    fn registry() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.register("refresh_prices", noop);
        registry
    }

    #[tokio::test]
    async fn test_create_requires_registered_handler() {
        let store = InMemoryJobStore::new();

        let err = create_job(&store, &registry(), NewJob::new("mystery"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let err = create_job(&store, &registry(), NewJob::new(""))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let created = create_job(&store, &registry(), NewJob::new("refresh_prices"))
            .await
            .unwrap();
        assert_eq!(created.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_status_of_unknown_job_is_not_found() {
        let store = InMemoryJobStore::new();
        assert!(matches!(
            get_job_status(&store, "nope").await,
            Err(AppError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_cancel_terminal_job_conflicts() {
        let store = InMemoryJobStore::new();
        let created = create_job(&store, &registry(), NewJob::new("refresh_prices"))
            .await
            .unwrap();

        let view = cancel_job(&store, &created.job_id).await.unwrap();
        assert_eq!(view.status, JobStatus::Cancelled);

        let err = cancel_job(&store, &created.job_id).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        assert!(matches!(
            cancel_job(&store, "nope").await,
            Err(AppError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_list_clamps_paging() {
        let store = InMemoryJobStore::new();
        for _ in 0..3 {
            create_job(&store, &registry(), NewJob::new("refresh_prices"))
                .await
                .unwrap();
        }

        let page = list_jobs(
            &store,
            ListJobsQuery {
                status: Some(JobStatus::Pending),
                limit: Some(0),
                offset: Some(-4),
            },
        )
        .await
        .unwrap();

        assert_eq!(page.limit, 1);
        assert_eq!(page.offset, 0);
        assert_eq!(page.jobs.len(), 1);
        assert_eq!(page.total, 3);
    }

    #[tokio::test]
    async fn test_has_active_job() {
        let store = InMemoryJobStore::new();
        assert!(!has_active_job(&store, "refresh_prices").await.unwrap());

        let created = create_job(&store, &registry(), NewJob::new("refresh_prices"))
            .await
            .unwrap();
        assert!(has_active_job(&store, "refresh_prices").await.unwrap());

        store.cancel(&created.job_id).await.unwrap();
        assert!(!has_active_job(&store, "refresh_prices").await.unwrap());
    }
}
