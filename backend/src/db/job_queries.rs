use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::HashMap;

use crate::models::{Job, JobLogLine, JobStatus, LogLevel};

const JOB_COLUMNS: &str = "job_id, job_type, status, progress, total, error_message, \
     retry_count, max_retries, timeout_seconds, created_by, \
     created_at, started_at, completed_at, cancelled_at, retried_at";

pub async fn insert_job(
    pool: &PgPool,
    job: &Job,
    params: &HashMap<String, String>,
) -> Result<Job, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let inserted = sqlx::query_as::<_, Job>(&format!(
        "INSERT INTO jobs (job_id, job_type, status, progress, total, retry_count,
                           max_retries, timeout_seconds, created_by, created_at)
         VALUES ($1, $2, $3, 0, 0, 0, $4, $5, $6, $7)
         RETURNING {}",
        JOB_COLUMNS
    ))
    .bind(&job.job_id)
    .bind(&job.job_type)
    .bind(JobStatus::Pending.as_str())
    .bind(job.max_retries)
    .bind(job.timeout_seconds)
    .bind(&job.created_by)
    .bind(job.created_at)
    .fetch_one(&mut *tx)
    .await?;

    for (key, value) in params {
        sqlx::query("INSERT INTO job_params (job_id, key, value) VALUES ($1, $2, $3)")
            .bind(&job.job_id)
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(inserted)
}

pub async fn fetch_one(pool: &PgPool, job_id: &str) -> Result<Option<Job>, sqlx::Error> {
    sqlx::query_as::<_, Job>(&format!("SELECT {} FROM jobs WHERE job_id = $1", JOB_COLUMNS))
        .bind(job_id)
        .fetch_optional(pool)
        .await
}

pub async fn fetch_params(
    pool: &PgPool,
    job_id: &str,
) -> Result<HashMap<String, String>, sqlx::Error> {
    let rows: Vec<(String, String)> =
        sqlx::query_as("SELECT key, value FROM job_params WHERE job_id = $1")
            .bind(job_id)
            .fetch_all(pool)
            .await?;
    Ok(rows.into_iter().collect())
}

pub async fn fetch_page(
    pool: &PgPool,
    status: Option<JobStatus>,
    limit: i64,
    offset: i64,
) -> Result<Vec<Job>, sqlx::Error> {
    // Pending queues are served oldest first
    let order = match status {
        Some(JobStatus::Pending) => "ASC",
        _ => "DESC",
    };
    sqlx::query_as::<_, Job>(&format!(
        "SELECT {} FROM jobs
         WHERE ($1::TEXT IS NULL OR status = $1)
         ORDER BY created_at {}
         LIMIT $2 OFFSET $3",
        JOB_COLUMNS, order
    ))
    .bind(status.map(|s| s.as_str()))
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
}

pub async fn count(pool: &PgPool, status: Option<JobStatus>) -> Result<i64, sqlx::Error> {
    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM jobs WHERE ($1::TEXT IS NULL OR status = $1)")
            .bind(status.map(|s| s.as_str()))
            .fetch_one(pool)
            .await?;
    Ok(count)
}

pub async fn update_progress(
    pool: &PgPool,
    job_id: &str,
    current: i64,
    total: i64,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("UPDATE jobs SET progress = $2, total = $3 WHERE job_id = $1")
        .bind(job_id)
        .bind(current)
        .bind(total)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn mark_started(
    pool: &PgPool,
    job_id: &str,
    now: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE jobs SET status = 'running', started_at = $2
         WHERE job_id = $1 AND status = 'pending'",
    )
    .bind(job_id)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn mark_completed(
    pool: &PgPool,
    job_id: &str,
    status: JobStatus,
    error_message: Option<&str>,
    now: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE jobs SET status = $2, error_message = $3, completed_at = $4
         WHERE job_id = $1 AND status = 'running'",
    )
    .bind(job_id)
    .bind(status.as_str())
    .bind(error_message)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn mark_cancelled(
    pool: &PgPool,
    job_id: &str,
    now: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE jobs SET status = 'cancelled', cancelled_at = $2, completed_at = $2
         WHERE job_id = $1 AND status IN ('pending', 'running')",
    )
    .bind(job_id)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn increment_retry(pool: &PgPool, job_id: &str) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE jobs SET retry_count = retry_count + 1
         WHERE job_id = $1 AND status IN ('running', 'failed')",
    )
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn reset_for_retry(
    pool: &PgPool,
    job_id: &str,
    now: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE jobs
         SET status = 'pending', started_at = NULL, completed_at = NULL, retried_at = $2
         WHERE job_id = $1 AND status IN ('running', 'failed')",
    )
    .bind(job_id)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Failed attempt in one statement: back to pending with the retry counted
/// while retries remain, failed otherwise. Returns the new status, or `None`
/// if `attempt` no longer owns the running row.
pub async fn fail_attempt(
    pool: &PgPool,
    job_id: &str,
    attempt: i32,
    error_message: &str,
    now: DateTime<Utc>,
) -> Result<Option<String>, sqlx::Error> {
    sqlx::query_scalar::<_, String>(
        "UPDATE jobs
         SET status = CASE WHEN retry_count < max_retries THEN 'pending' ELSE 'failed' END,
             retry_count = CASE WHEN retry_count < max_retries THEN retry_count + 1 ELSE retry_count END,
             started_at = CASE WHEN retry_count < max_retries THEN NULL ELSE started_at END,
             completed_at = CASE WHEN retry_count < max_retries THEN NULL ELSE $4 END,
             retried_at = CASE WHEN retry_count < max_retries THEN $4 ELSE retried_at END,
             error_message = CASE WHEN retry_count < max_retries THEN error_message ELSE $3 END
         WHERE job_id = $1 AND status = 'running' AND retry_count = $2
         RETURNING status",
    )
    .bind(job_id)
    .bind(attempt)
    .bind(error_message)
    .bind(now)
    .fetch_optional(pool)
    .await
}

pub async fn cancel_attempt(
    pool: &PgPool,
    job_id: &str,
    attempt: i32,
    now: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE jobs SET status = 'cancelled', cancelled_at = $3, completed_at = $3
         WHERE job_id = $1 AND status = 'running' AND retry_count = $2",
    )
    .bind(job_id)
    .bind(attempt)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn insert_log(
    pool: &PgPool,
    job_id: &str,
    level: LogLevel,
    message: &str,
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO job_logs (job_id, level, message, created_at)
         SELECT $1, $2, $3, $4 WHERE EXISTS (SELECT 1 FROM jobs WHERE job_id = $1)",
    )
    .bind(job_id)
    .bind(level.as_str())
    .bind(message)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn fetch_logs(pool: &PgPool, job_id: &str) -> Result<Vec<JobLogLine>, sqlx::Error> {
    sqlx::query_as::<_, JobLogLine>(
        "SELECT job_id, level, message, created_at
         FROM job_logs
         WHERE job_id = $1
         ORDER BY created_at ASC, id ASC",
    )
    .bind(job_id)
    .fetch_all(pool)
    .await
}

pub async fn ping(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}
