use serde::{Deserialize, Serialize};

use crate::job::JobHandlerType;
use crate::types::{ExecutionId, JobId, ProcessInstanceId, Timestamp};

/// Runtime events: the audit trail of what a committed command did.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RuntimeEvent {
    InstanceStarted {
        process_definition_id: String,
        business_key: Option<String>,
    },
    InstanceEnded,
    InstanceCancelled {
        reason: Option<String>,
    },
    ActivityEntered {
        execution_id: ExecutionId,
        activity_id: String,
    },
    ActivityLeft {
        execution_id: ExecutionId,
        activity_id: String,
    },
    TransitionTaken {
        execution_id: ExecutionId,
        transition_id: String,
    },
    ExecutionForked {
        parent_id: ExecutionId,
        children: Vec<ExecutionId>,
    },
    ExecutionsJoined {
        activity_id: String,
        merged: Vec<ExecutionId>,
        continued_by: ExecutionId,
    },
    JobCreated {
        job_id: JobId,
        execution_id: ExecutionId,
        handler_type: JobHandlerType,
    },
    JobFailed {
        job_id: JobId,
        retries_left: u32,
        message: String,
    },
    ErrorRouted {
        execution_id: ExecutionId,
        error_code: String,
        handler_activity_id: String,
    },
    VariableSet {
        execution_id: ExecutionId,
        name: String,
    },
}

/// An event as seen by listeners, after the command committed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub process_instance_id: ProcessInstanceId,
    pub timestamp: Timestamp,
    pub event: RuntimeEvent,
}

/// Observer of committed runtime events. Called on the committing task;
/// implementations should return quickly.
pub trait EventListener: Send + Sync {
    fn on_event(&self, record: &EventRecord);
}

/// Writes every event to the `pvm_core::events` tracing target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventListener;

impl EventListener for TracingEventListener {
    fn on_event(&self, record: &EventRecord) {
        tracing::info!(
            process_instance_id = %record.process_instance_id,
            event = ?record.event,
            "runtime event"
        );
    }
}
