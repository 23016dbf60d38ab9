//! Persisted units of deferred work: async continuations and timers.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::config::JobExecutorConfig;
use crate::error::EngineError;
use crate::types::{new_id, ExecutionId, JobId, ProcessInstanceId, Revision, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobHandlerType {
    /// Resume a walk suspended at an async-before/after boundary.
    AsyncContinuation,
    /// Signal a wait state whose timer has elapsed.
    TimerFire,
}

impl JobHandlerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AsyncContinuation => "async-continuation",
            Self::TimerFire => "timer-fire",
        }
    }
}

impl FromStr for JobHandlerType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "async-continuation" => Ok(Self::AsyncContinuation),
            "timer-fire" => Ok(Self::TimerFire),
            other => Err(anyhow::anyhow!("unknown job handler type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Active,
    /// Out of retries; ignored by the poller until retries are reset.
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for JobState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "failed" => Ok(Self::Failed),
            other => Err(anyhow::anyhow!("unknown job state '{other}'")),
        }
    }
}

/// Where an async continuation resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AsyncPhase {
    Before,
    After,
}

/// Decoded `handler_config`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPayload {
    pub activity_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<AsyncPhase>,
    /// Set when the job parks an async transition leaving `activity_id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub process_instance_id: ProcessInstanceId,
    pub execution_id: ExecutionId,
    pub due_date: Timestamp,
    pub handler_type: JobHandlerType,
    /// JSON-encoded [`JobPayload`].
    pub handler_config: String,
    pub lock_owner: Option<String>,
    pub lock_expiration_time: Option<Timestamp>,
    pub retries_left: u32,
    /// Consecutive failed runs; drives the backoff delay.
    pub failures: u32,
    pub exception_message: Option<String>,
    pub state: JobState,
    pub revision: Revision,
}

impl Job {
    fn new(
        process_instance_id: ProcessInstanceId,
        execution_id: ExecutionId,
        handler_type: JobHandlerType,
        payload: &JobPayload,
        due_date: Timestamp,
        retries: u32,
    ) -> Self {
        Self {
            id: new_id(),
            process_instance_id,
            execution_id,
            due_date,
            handler_type,
            handler_config: payload.encode(),
            lock_owner: None,
            lock_expiration_time: None,
            retries_left: retries,
            failures: 0,
            exception_message: None,
            state: JobState::Active,
            revision: 0,
        }
    }

    pub fn async_continuation(
        process_instance_id: ProcessInstanceId,
        execution_id: ExecutionId,
        activity_id: &str,
        phase: AsyncPhase,
        due_date: Timestamp,
        retries: u32,
    ) -> Self {
        let payload = JobPayload {
            activity_id: activity_id.to_string(),
            phase: Some(phase),
            transition_id: None,
        };
        Self::new(
            process_instance_id,
            execution_id,
            JobHandlerType::AsyncContinuation,
            &payload,
            due_date,
            retries,
        )
    }

    /// Continuation that takes `transition_id` out of `activity_id`.
    pub fn async_transition(
        process_instance_id: ProcessInstanceId,
        execution_id: ExecutionId,
        activity_id: &str,
        transition_id: &str,
        due_date: Timestamp,
        retries: u32,
    ) -> Self {
        let payload = JobPayload {
            activity_id: activity_id.to_string(),
            phase: None,
            transition_id: Some(transition_id.to_string()),
        };
        Self::new(
            process_instance_id,
            execution_id,
            JobHandlerType::AsyncContinuation,
            &payload,
            due_date,
            retries,
        )
    }

    pub fn timer(
        process_instance_id: ProcessInstanceId,
        execution_id: ExecutionId,
        activity_id: &str,
        due_date: Timestamp,
        retries: u32,
    ) -> Self {
        let payload = JobPayload {
            activity_id: activity_id.to_string(),
            phase: None,
            transition_id: None,
        };
        Self::new(
            process_instance_id,
            execution_id,
            JobHandlerType::TimerFire,
            &payload,
            due_date,
            retries,
        )
    }

    pub fn payload(&self) -> Result<JobPayload, EngineError> {
        serde_json::from_str(&self.handler_config).map_err(|e| {
            EngineError::Internal(anyhow::anyhow!(
                "job {} has unreadable handler config: {e}",
                self.id
            ))
        })
    }

    /// Due, active, and not held by a live lock.
    pub fn is_eligible(&self, now: Timestamp) -> bool {
        self.state == JobState::Active
            && self.due_date <= now
            && match (&self.lock_owner, self.lock_expiration_time) {
                (None, _) => true,
                (Some(_), Some(expiry)) => expiry < now,
                (Some(_), None) => false,
            }
    }

    pub fn is_locked_by(&self, owner: &str, now: Timestamp) -> bool {
        self.lock_owner.as_deref() == Some(owner)
            && self.lock_expiration_time.is_some_and(|t| t >= now)
    }
}

impl JobPayload {
    fn encode(&self) -> String {
        // Plain strings and a unit enum; serializing cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Exponential retry delay: `base * 2^(failures - 1)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn from_config(config: &JobExecutorConfig) -> Self {
        Self {
            base: Duration::from_millis(config.backoff_base_ms),
            max: Duration::from_millis(config.backoff_max_ms),
        }
    }

    /// Delay after the `failures`-th consecutive failure (1-based).
    pub fn delay(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max)
            .min(self.max)
    }
}
