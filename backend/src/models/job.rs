use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_MAX_RETRIES: i32 = 3;
pub const DEFAULT_TIMEOUT_SECONDS: i32 = 14_400;

/// Lifecycle state of a job.
///
/// `pending -> running -> {completed, failed, cancelled}`, with
/// `running|failed -> pending` on the retry path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Pending)
                | (Failed, Pending)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown job status: {0}")]
pub struct ParseStatusError(pub String);

impl FromStr for JobStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

impl TryFrom<String> for JobStatus {
    type Error = ParseStatusError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

// One persisted unit of background work.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Job {
    pub job_id: String,
    pub job_type: String,
    #[sqlx(try_from = "String")]
    pub status: JobStatus,
    pub progress: i64,
    pub total: i64,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub timeout_seconds: i32,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub retried_at: Option<DateTime<Utc>>,
}

impl Job {
    pub(crate) fn new(new_job: &NewJob) -> Self {
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            job_type: new_job.job_type.clone(),
            status: JobStatus::Pending,
            progress: 0,
            total: 0,
            error_message: None,
            retry_count: 0,
            max_retries: new_job.max_retries,
            timeout_seconds: new_job.timeout_seconds,
            created_by: new_job.created_by.clone(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            cancelled_at: None,
            retried_at: None,
        }
    }

    pub fn percent(&self) -> f64 {
        if self.total <= 0 {
            return 0.0;
        }
        (self.progress as f64 / self.total as f64 * 100.0).min(100.0)
    }

    pub fn retries_remaining(&self) -> bool {
        self.retry_count < self.max_retries
    }

    pub fn is_timed_out(&self, now: DateTime<Utc>) -> bool {
        is_timed_out(self.status, self.started_at, self.timeout_seconds, now)
    }
}

/// Input for `JobStore::create`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub job_type: String,
    #[serde(default)]
    pub params: HashMap<String, String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: i32,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: i32,
    #[serde(default)]
    pub created_by: Option<String>,
}

fn default_max_retries() -> i32 {
    DEFAULT_MAX_RETRIES
}

fn default_timeout_seconds() -> i32 {
    DEFAULT_TIMEOUT_SECONDS
}

impl NewJob {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            params: HashMap::new(),
            max_retries: DEFAULT_MAX_RETRIES,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            created_by: None,
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn timeout_seconds(mut self, timeout_seconds: i32) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    pub fn created_by(mut self, actor: impl Into<String>) -> Self {
        self.created_by = Some(actor.into());
        self
    }
}

/// True iff the job is running and has been for longer than its timeout.
pub fn is_timed_out(
    status: JobStatus,
    started_at: Option<DateTime<Utc>>,
    timeout_seconds: i32,
    now: DateTime<Utc>,
) -> bool {
    match (status, started_at) {
        (JobStatus::Running, Some(started)) => {
            now - started > Duration::seconds(i64::from(timeout_seconds))
        }
        _ => false,
    }
}

/// Delay before the `retry_count`-th retry becomes eligible: `min(2^n, cap)` seconds.
pub fn backoff_delay(retry_count: i32, max_backoff_secs: u64) -> Duration {
    let exp = retry_count.clamp(0, 32) as u32;
    let secs = 2u64.saturating_pow(exp).min(max_backoff_secs);
    Duration::seconds(secs as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_text() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("paused".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_state_machine_edges() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Failed.can_transition_to(JobStatus::Pending));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Pending));
        assert!(!JobStatus::Cancelled.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Completed));
    }

    #[test]
    fn test_timeout_is_deterministic() {
        let started = Utc::now();
        let now = started + Duration::seconds(11);

        assert!(is_timed_out(JobStatus::Running, Some(started), 10, now));
        assert!(!is_timed_out(JobStatus::Running, Some(started), 11, now));
        assert!(!is_timed_out(JobStatus::Pending, Some(started), 10, now));
        assert!(!is_timed_out(JobStatus::Running, None, 10, now));
        // Same inputs, same answer
        assert_eq!(
            is_timed_out(JobStatus::Running, Some(started), 10, now),
            is_timed_out(JobStatus::Running, Some(started), 10, now)
        );
    }

    #[test]
    fn test_backoff_is_capped() {
        assert_eq!(backoff_delay(1, 60), Duration::seconds(2));
        assert_eq!(backoff_delay(3, 60), Duration::seconds(8));
        assert_eq!(backoff_delay(6, 60), Duration::seconds(60));
        assert_eq!(backoff_delay(40, 60), Duration::seconds(60));
        assert_eq!(backoff_delay(2, 0), Duration::seconds(0));
    }

    #[test]
    fn test_percent_handles_zero_total() {
        let mut job = Job::new(&NewJob::new("heartbeat"));
        assert_eq!(job.percent(), 0.0);
        job.progress = 5;
        job.total = 20;
        assert_eq!(job.percent(), 25.0);
    }
}
