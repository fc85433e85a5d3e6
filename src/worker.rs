// ABOUTME: Scheduler-agnostic entry points: run, resume, retry and cancel a job
// ABOUTME: Includes the external retry policy that re-invokes resumable failures after a backoff

use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use tracing::{info, warn};

use crate::context::EngineContext;
use crate::error::MigratorError;
use crate::models::{Job, JobId, JobKind, JobStatus};
use crate::phases::{self, JobOutcome};
use crate::store::Store;
use crate::sync;

/// Runs a pending job, or continues a resumable one on the same record.
pub async fn run_job(ctx: &EngineContext, job_id: JobId) -> Result<JobOutcome> {
    let job = ctx.store.job(job_id)?;
    match job.kind {
        JobKind::Migration => phases::execute(ctx, job_id).await,
        JobKind::IncrementalSync => sync::execute_sync(ctx, job_id).await,
    }
}

/// Checks that `job_id` may be resumed. With `force`, a job still marked running
/// (its worker died) is first turned into a resumable failure.
pub fn prepare_resume(ctx: &EngineContext, job_id: JobId, force: bool) -> Result<Job> {
    let job = ctx.store.job(job_id)?;
    match job.status {
        JobStatus::Running if force => {
            warn!(job_id, "treating running job as interrupted");
            ctx.store.mark_interrupted(job_id)?;
        }
        JobStatus::Running => {
            return Err(MigratorError::Validation(format!(
                "Job {} is still marked running. If its worker is gone, resume with --force",
                job_id
            ))
            .into())
        }
        JobStatus::Failed | JobStatus::Cancelled if job.resumable => {}
        JobStatus::Failed | JobStatus::Cancelled => {
            return Err(MigratorError::Validation(format!(
                "Job {} failed with a non-resumable error. Fix the cause and use retry to start over",
                job_id
            ))
            .into())
        }
        JobStatus::Pending => {}
        JobStatus::Completed => {
            return Err(MigratorError::Validation(format!(
                "Job {} already completed",
                job_id
            ))
            .into())
        }
    }
    ctx.store.job(job_id)
}

pub async fn resume_job(ctx: &EngineContext, job_id: JobId, force: bool) -> Result<JobOutcome> {
    prepare_resume(ctx, job_id, force)?;
    info!(job_id, "resuming job");
    run_job(ctx, job_id).await
}

/// Creates a new job record copying the finished job's parameters.
pub fn prepare_retry(ctx: &EngineContext, job_id: JobId) -> Result<Job> {
    let original = ctx.store.job(job_id)?;
    if !matches!(original.status, JobStatus::Failed | JobStatus::Cancelled) {
        return Err(MigratorError::Validation(format!(
            "Job {} is {}; only failed or cancelled jobs can be retried",
            job_id, original.status
        ))
        .into());
    }
    let job = ctx.store.create_retry_job(&original)?;
    info!(job_id = job.id, parent = job_id, "created retry job");
    Ok(job)
}

/// Starts over from `pending` on a new record.
pub async fn retry_job(ctx: &EngineContext, job_id: JobId) -> Result<JobOutcome> {
    let job = prepare_retry(ctx, job_id)?;
    run_job(ctx, job.id).await
}

/// Records the cancellation. A running worker notices it at its next checkpoint boundary.
pub fn cancel_job(store: &Store, job_id: JobId) -> Result<()> {
    let job = store.job(job_id)?;
    if !store.mark_cancelled(job_id)? {
        return Err(MigratorError::Validation(format!(
            "Job {} is already {} and cannot be cancelled",
            job_id, job.status
        ))
        .into());
    }
    info!(job_id, "cancellation requested");
    Ok(())
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Additional attempts after the first.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(15 * 60),
        }
    }
}

impl RetryPolicy {
    pub fn with_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Exponential backoff for the `attempt`-th retry (1-based) plus up to 20% jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);
        let jitter_ms = (delay.as_millis() / 5) as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        delay + Duration::from_millis(jitter)
    }
}

/// Runs the job and keeps resuming it while it fails resumably.
pub async fn run_with_retries(
    ctx: &EngineContext,
    job_id: JobId,
    policy: RetryPolicy,
) -> Result<JobOutcome> {
    let mut attempt = 0;
    loop {
        let err = match run_job(ctx, job_id).await {
            Ok(outcome) => return Ok(outcome),
            Err(err) => err,
        };
        let job = ctx.store.job(job_id)?;
        if job.status != JobStatus::Failed || !job.resumable || attempt >= policy.max_retries {
            return Err(err);
        }
        attempt += 1;
        ctx.store.increment_retry_count(job_id)?;
        let delay = policy.delay_for(attempt);
        warn!(
            job_id,
            attempt,
            max_retries = policy.max_retries,
            delay_secs = delay.as_secs(),
            "resumable failure, retrying: {:#}",
            err
        );
        tokio::time::sleep(delay).await;
    }
}
