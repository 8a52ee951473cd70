mod job;
mod job_log;
mod job_params;
mod job_views;

pub use job::{
    backoff_delay, is_timed_out, Job, JobStatus, NewJob, ParseStatusError, DEFAULT_MAX_RETRIES,
    DEFAULT_TIMEOUT_SECONDS,
};
pub use job_log::{JobLogLine, LogLevel};
pub use job_params::JobParams;
pub use job_views::{CreateJobResponse, JobStatusView, JobSummary, ListJobsQuery, ListJobsResponse};
