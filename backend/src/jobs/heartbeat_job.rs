use std::time::Duration;
use tracing::info;

use crate::models::JobParams;
use crate::services::job_runner::{JobContext, JobError};

pub const JOB_TYPE: &str = "heartbeat";

const DEFAULT_STEPS: i64 = 10;
const DEFAULT_INTERVAL_MS: i64 = 1000;

/// Diagnostic job used to check the scheduler end to end in a deployment.
///
/// Parameters:
/// - `steps` - number of iterations (default 10)
/// - `interval_ms` - pause between iterations (default 1000)
/// - `fail_at_step` - fail deliberately when this step is reached
pub async fn run_heartbeat(ctx: JobContext, params: JobParams) -> Result<(), JobError> {
    let steps = params.get_i64("steps")?.unwrap_or(DEFAULT_STEPS).max(0);
    let interval_ms = params
        .get_i64("interval_ms")?
        .unwrap_or(DEFAULT_INTERVAL_MS)
        .max(0);
    let fail_at_step = params.get_i64("fail_at_step")?;

    info!("💓 Heartbeat job {} running {} steps", ctx.job_id(), steps);
    ctx.report_progress(0, steps).await?;

    for step in 1..=steps {
        ctx.checkpoint().await?;

        tokio::time::sleep(Duration::from_millis(interval_ms as u64)).await;

        if fail_at_step == Some(step) {
            return Err(JobError::Failed(format!("heartbeat failed at step {}", step)));
        }

        ctx.report_progress(step, steps).await?;
    }

    ctx.info(format!("heartbeat finished {} steps", steps)).await;
    Ok(())
}
