use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use http::StatusCode;
use tracing::{error, info};

use crate::errors::AppError;
use crate::models::{
    CreateJobResponse, JobLogLine, JobStatusView, ListJobsQuery, ListJobsResponse, NewJob,
};
use crate::services::job_service;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(create_job).get(list_jobs))
        .route("/types", get(list_job_types))
        .route("/:job_id", get(get_job))
        .route("/:job_id/cancel", post(cancel_job))
        .route("/:job_id/logs", get(get_job_logs))
}

/// POST /api/jobs - Queue a new job
pub async fn create_job(
    State(state): State<AppState>,
    Json(data): Json<NewJob>,
) -> Result<(StatusCode, Json<CreateJobResponse>), AppError> {
    info!("POST /api/jobs - Queueing {} job", data.job_type);
    let created = job_service::create_job(state.store.as_ref(), &state.registry, data)
        .await
        .map_err(|e| {
            error!("Failed to queue job: {}", e);
            e
        })?;
    Ok((StatusCode::ACCEPTED, Json(created)))
}

/// GET /api/jobs - List jobs, optionally filtered by status
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<ListJobsResponse>, AppError> {
    info!("GET /api/jobs - Listing jobs");
    let page = job_service::list_jobs(state.store.as_ref(), query).await?;
    Ok(Json(page))
}

/// GET /api/jobs/types - Registered job types
pub async fn list_job_types(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.registry.list_registered())
}

/// GET /api/jobs/:job_id - Job status and progress
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobStatusView>, AppError> {
    info!("GET /api/jobs/{} - Fetching job status", job_id);
    let view = job_service::get_job_status(state.store.as_ref(), &job_id).await?;
    Ok(Json(view))
}

/// POST /api/jobs/:job_id/cancel - Request cancellation
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobStatusView>, AppError> {
    info!("POST /api/jobs/{}/cancel - Cancelling job", job_id);
    let view = job_service::cancel_job(state.store.as_ref(), &job_id).await?;
    Ok(Json(view))
}

/// GET /api/jobs/:job_id/logs - Log lines in the order they were written
pub async fn get_job_logs(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<Vec<JobLogLine>>, AppError> {
    info!("GET /api/jobs/{}/logs - Fetching job logs", job_id);
    let logs = job_service::get_job_logs(state.store.as_ref(), &job_id).await?;
    Ok(Json(logs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::create_app;
    use crate::jobs;
    use crate::models::JobStatus;
    use crate::registry::HandlerRegistry;
    use crate::store::{InMemoryJobStore, JobStore};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app() -> (Arc<dyn JobStore>, Router) {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let mut registry = HandlerRegistry::new();
        jobs::register_all(&mut registry);
        let state = AppState {
            store: store.clone(),
            registry: Arc::new(registry),
        };
        (store, create_app(state))
    }

    async fn body_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_create_then_fetch_job() {
        let (_, app) = app();

        let response = app
            .clone()
            .oneshot(
                Request::post("/api/jobs")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"job_type":"heartbeat","params":{"steps":"2"},"max_retries":1}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let created: CreateJobResponse = body_json(response).await;
        assert_eq!(created.status, JobStatus::Pending);

        let response = app
            .oneshot(
                Request::get(format!("/api/jobs/{}", created.job_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let view: JobStatusView = body_json(response).await;
        assert_eq!(view.max_retries, 1);
        assert_eq!(view.percent, 0.0);
    }

    #[tokio::test]
    async fn test_unknown_job_type_is_bad_request() {
        let (_, app) = app();

        let response = app
            .oneshot(
                Request::post("/api/jobs")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"job_type":"launch_rockets"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_cancel_twice_conflicts() {
        let (store, app) = app();
        let job = store.create(NewJob::new("heartbeat")).await.unwrap();
        let uri = format!("/api/jobs/{}/cancel", job.job_id);

        let first = app
            .clone()
            .oneshot(Request::post(&uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app
            .oneshot(Request::post(&uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_missing_job_is_not_found() {
        let (_, app) = app();

        let response = app
            .oneshot(Request::get("/api/jobs/nope/logs").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_list_filters_by_status() {
        let (store, app) = app();
        let job = store.create(NewJob::new("heartbeat")).await.unwrap();
        store.create(NewJob::new("heartbeat")).await.unwrap();
        store.cancel(&job.job_id).await.unwrap();

        let response = app
            .oneshot(
                Request::get("/api/jobs?status=pending&limit=10")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let page: ListJobsResponse = body_json(response).await;
        assert_eq!(page.total, 1);
        assert_eq!(page.jobs.len(), 1);
        assert_eq!(page.jobs[0].status, JobStatus::Pending);
    }
}
