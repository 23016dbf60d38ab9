//! Commands run by job workers.

use async_trait::async_trait;

use crate::command::{Command, CommandContext};
use crate::error::{EngineError, EntityKind};
use crate::events::RuntimeEvent;
use crate::job::{BackoffPolicy, JobHandlerType, JobState};
use crate::types::{add_duration, JobId, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// The walk resumed and the job row was deleted with it.
    Executed,
    /// The job is gone or no longer locked by this node.
    Skipped,
}

/// Resume the walk a job stands for. On success the job is deleted in the
/// same transaction as the tree changes.
#[derive(Debug, Clone)]
pub struct ExecuteJob {
    pub job_id: JobId,
    pub lock_owner: String,
}

#[async_trait]
impl Command for ExecuteJob {
    type Output = JobOutcome;

    fn name(&self) -> &'static str {
        "execute-job"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<JobOutcome, EngineError> {
        let now = ctx.now();
        let Some(job) = ctx.session.load_job(self.job_id).await? else {
            tracing::debug!(job_id = %self.job_id, "job already gone");
            return Ok(JobOutcome::Skipped);
        };
        if !job.is_locked_by(&self.lock_owner, now) {
            tracing::debug!(
                job_id = %self.job_id,
                lock_owner = ?job.lock_owner,
                "job no longer locked by this node"
            );
            return Ok(JobOutcome::Skipped);
        }

        let id = job.process_instance_id;
        let payload = job.payload()?;
        let tree = ctx.session.instance(id).await?;
        tree.remove_job(job.id);

        let execution_id = job.execution_id;
        let resumed = match job.handler_type {
            JobHandlerType::AsyncContinuation => {
                ctx.walk(id, |pvm| pvm.resume_async(execution_id, &payload))
                    .await?
            }
            JobHandlerType::TimerFire => {
                ctx.walk(id, |pvm| pvm.fire_timer(execution_id, &payload.activity_id))
                    .await?
            }
        };
        if !resumed {
            tracing::debug!(
                job_id = %job.id,
                execution_id = %execution_id,
                "job target moved on; job discarded"
            );
        }
        Ok(JobOutcome::Executed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobFailureOutcome {
    /// Unlocked and due again at `due_date`.
    Retrying {
        retries_left: u32,
        due_date: Timestamp,
    },
    /// Out of retries; excluded from polling until reset.
    Failed,
    Skipped,
}

/// Record a failed run: consume a retry and back off, or mark the job
/// `Failed` once no retries are left.
#[derive(Debug, Clone)]
pub struct RecordJobFailure {
    pub job_id: JobId,
    pub lock_owner: String,
    pub message: String,
}

#[async_trait]
impl Command for RecordJobFailure {
    type Output = JobFailureOutcome;

    fn name(&self) -> &'static str {
        "record-job-failure"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<JobFailureOutcome, EngineError> {
        let now = ctx.now();
        let config = ctx.services().config.job_executor.clone();
        let Some(job) = ctx.session.load_job(self.job_id).await? else {
            return Ok(JobFailureOutcome::Skipped);
        };
        if job.lock_owner.as_deref() != Some(self.lock_owner.as_str()) {
            return Ok(JobFailureOutcome::Skipped);
        }

        let id = job.process_instance_id;
        let tree = ctx.session.instance(id).await?;
        let job = tree
            .job_mut(self.job_id)
            .ok_or_else(|| EngineError::not_found(EntityKind::Job, self.job_id))?;
        job.lock_owner = None;
        job.lock_expiration_time = None;
        job.exception_message = Some(self.message.clone());
        job.failures = job.failures.saturating_add(1);

        let outcome = if job.retries_left == 0 {
            job.state = JobState::Failed;
            tracing::warn!(
                job_id = %job.id,
                execution_id = %job.execution_id,
                error = %self.message,
                "job out of retries, marked failed"
            );
            JobFailureOutcome::Failed
        } else {
            job.retries_left -= 1;
            let delay = BackoffPolicy::from_config(&config).delay(job.failures);
            job.due_date = add_duration(now, delay);
            tracing::info!(
                job_id = %job.id,
                retries_left = job.retries_left,
                failures = job.failures,
                backoff_ms = delay.as_millis() as u64,
                error = %self.message,
                "job failed, will retry"
            );
            JobFailureOutcome::Retrying {
                retries_left: job.retries_left,
                due_date: job.due_date,
            }
        };
        let event = RuntimeEvent::JobFailed {
            job_id: job.id,
            retries_left: job.retries_left,
            message: self.message.clone(),
        };
        ctx.record(id, vec![event]);
        Ok(outcome)
    }
}
