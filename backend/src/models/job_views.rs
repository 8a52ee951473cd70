use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::{Job, JobStatus};

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateJobResponse {
    pub job_id: String,
    pub status: JobStatus,
}

/// Caller-facing status of a single job.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobStatusView {
    pub job_id: String,
    pub job_type: String,
    pub status: JobStatus,
    pub progress: i64,
    pub total: i64,
    pub percent: f64,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl From<Job> for JobStatusView {
    fn from(job: Job) -> Self {
        let percent = job.percent();
        Self {
            job_id: job.job_id,
            job_type: job.job_type,
            status: job.status,
            progress: job.progress,
            total: job.total,
            percent,
            error_message: job.error_message,
            retry_count: job.retry_count,
            max_retries: job.max_retries,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            cancelled_at: job.cancelled_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: String,
    pub job_type: String,
    pub status: JobStatus,
    pub percent: f64,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<Job> for JobSummary {
    fn from(job: Job) -> Self {
        let percent = job.percent();
        Self {
            job_id: job.job_id,
            job_type: job.job_type,
            status: job.status,
            percent,
            created_by: job.created_by,
            created_at: job.created_at,
            completed_at: job.completed_at,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<JobStatus>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListJobsResponse {
    pub jobs: Vec<JobSummary>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}
