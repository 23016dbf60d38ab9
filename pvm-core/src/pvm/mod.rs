//! Process virtual machine.
//!
//! A [`Pvm`] walks the executions of one tree through the graph until every
//! token is parked: at a wait state, at an async boundary, inactive at a
//! join, or ended. Work is queued as [`Operation`]s on an agenda and drained
//! in order; the walk never blocks and never touches the store.

mod faults;
mod gateways;
mod operations;

use std::collections::VecDeque;

use crate::error::EngineError;
use crate::events::RuntimeEvent;
use crate::execution::ExecutionTree;
use crate::expression::ExpressionEvaluator;
use crate::graph::{Activity, Behavior, ProcessGraph};
use crate::handler::HandlerRegistry;
use crate::job::{AsyncPhase, JobHandlerType, JobPayload};
use crate::types::{ExecutionId, Timestamp};

/// Upper bound on operations per walk; a graph that loops without a wait
/// state trips it instead of spinning forever.
pub const MAX_OPERATIONS: usize = 10_000;

/// Collaborators and settings for one walk.
#[derive(Clone, Copy)]
pub struct PvmEnv<'a> {
    pub evaluator: &'a dyn ExpressionEvaluator,
    pub handlers: &'a HandlerRegistry,
    pub now: Timestamp,
    /// `retries_left` for jobs created during the walk.
    pub job_retries: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Operation {
    ExecuteActivity {
        execution: ExecutionId,
        skip_async: bool,
    },
    LeaveActivity {
        execution: ExecutionId,
        skip_async: bool,
    },
    TakeTransition {
        execution: ExecutionId,
        transition: String,
        skip_async: bool,
    },
    EndExecution {
        execution: ExecutionId,
    },
}

impl Operation {
    fn execution(&self) -> ExecutionId {
        match self {
            Self::ExecuteActivity { execution, .. }
            | Self::LeaveActivity { execution, .. }
            | Self::TakeTransition { execution, .. }
            | Self::EndExecution { execution } => *execution,
        }
    }
}

pub struct Pvm<'a> {
    graph: &'a ProcessGraph,
    tree: &'a mut ExecutionTree,
    env: PvmEnv<'a>,
    agenda: VecDeque<Operation>,
    events: Vec<RuntimeEvent>,
}

impl<'a> Pvm<'a> {
    pub fn new(graph: &'a ProcessGraph, tree: &'a mut ExecutionTree, env: PvmEnv<'a>) -> Self {
        Self {
            graph,
            tree,
            env,
            agenda: VecDeque::new(),
            events: Vec::new(),
        }
    }

    /// Events produced so far, in the order they happened.
    pub fn into_events(self) -> Vec<RuntimeEvent> {
        self.events
    }

    // ── Entry points ──

    /// Walk a freshly created tree from its root.
    pub fn start(&mut self) -> Result<(), EngineError> {
        let root = self.tree.process_instance_id();
        self.agenda.push_back(Operation::ExecuteActivity {
            execution: root,
            skip_async: false,
        });
        self.run()
    }

    /// Resume an execution suspended in a wait state.
    pub fn signal(&mut self, execution_id: ExecutionId) -> Result<(), EngineError> {
        let graph = self.graph;
        let e = self.tree.get(execution_id)?;
        if !e.is_active {
            return Err(EngineError::structural(format!(
                "execution {execution_id} is not active and cannot be signalled"
            )));
        }
        let activity = graph.require_activity(&e.activity_id)?;
        if !matches!(activity.behavior, Behavior::WaitState { .. }) {
            return Err(EngineError::structural(format!(
                "execution {execution_id} is at '{}', which is not a wait state",
                activity.id
            )));
        }
        if self
            .tree
            .has_job_of_type(execution_id, JobHandlerType::AsyncContinuation)
        {
            return Err(EngineError::structural(format!(
                "execution {execution_id} is waiting for an async continuation"
            )));
        }
        self.agenda.push_back(Operation::LeaveActivity {
            execution: execution_id,
            skip_async: false,
        });
        self.run()
    }

    /// Continue a walk parked at an async boundary: before or after an
    /// activity, or on an async transition. Returns `false` when the
    /// execution has moved on or gone, leaving nothing to resume.
    pub fn resume_async(
        &mut self,
        execution_id: ExecutionId,
        payload: &JobPayload,
    ) -> Result<bool, EngineError> {
        if !self.is_parked_at(execution_id, &payload.activity_id) {
            return Ok(false);
        }
        let op = match (&payload.transition_id, payload.phase) {
            (Some(transition), _) => Operation::TakeTransition {
                execution: execution_id,
                transition: transition.clone(),
                skip_async: true,
            },
            (None, Some(AsyncPhase::After)) => Operation::LeaveActivity {
                execution: execution_id,
                skip_async: true,
            },
            (None, _) => Operation::ExecuteActivity {
                execution: execution_id,
                skip_async: true,
            },
        };
        self.agenda.push_back(op);
        self.run()?;
        Ok(true)
    }

    /// Fire the timer of a wait state: the execution leaves as if signalled.
    pub fn fire_timer(
        &mut self,
        execution_id: ExecutionId,
        activity_id: &str,
    ) -> Result<bool, EngineError> {
        if !self.is_parked_at(execution_id, activity_id) {
            return Ok(false);
        }
        self.agenda.push_back(Operation::LeaveActivity {
            execution: execution_id,
            skip_async: false,
        });
        self.run()?;
        Ok(true)
    }

    fn is_parked_at(&self, execution_id: ExecutionId, activity_id: &str) -> bool {
        self.tree
            .get(execution_id)
            .is_ok_and(|e| e.is_active && e.activity_id == activity_id)
    }

    // ── Agenda ──

    fn run(&mut self) -> Result<(), EngineError> {
        let mut steps = 0usize;
        while let Some(op) = self.agenda.pop_front() {
            steps += 1;
            if steps > MAX_OPERATIONS {
                return Err(EngineError::structural(format!(
                    "walk exceeded {MAX_OPERATIONS} operations without reaching a wait state"
                )));
            }
            // Joins, terminate and error routing can remove executions that
            // still have work queued.
            if !self.tree.contains(op.execution()) {
                continue;
            }
            tracing::trace!(?op, "pvm operation");
            match op {
                Operation::ExecuteActivity {
                    execution,
                    skip_async,
                } => self.execute_activity(execution, skip_async)?,
                Operation::LeaveActivity {
                    execution,
                    skip_async,
                } => self.leave_activity(execution, skip_async)?,
                Operation::TakeTransition {
                    execution,
                    transition,
                    skip_async,
                } => self.take_transition(execution, &transition, skip_async)?,
                Operation::EndExecution { execution } => self.end_execution(execution)?,
            }
        }
        Ok(())
    }

    fn push(&mut self, op: Operation) {
        self.agenda.push_back(op);
    }

    fn emit(&mut self, event: RuntimeEvent) {
        self.events.push(event);
    }

    /// `execution` is the scope opened for `activity` (as opposed to the
    /// token that arrived at it).
    fn is_scope_for(&self, execution: ExecutionId, activity: &Activity) -> bool {
        let Ok(e) = self.tree.get(execution) else {
            return false;
        };
        if !e.is_scope || e.activity_id != activity.id {
            return false;
        }
        matches!(self.tree.parent(execution), Ok(Some(p)) if p.activity_id == activity.id)
    }
}

#[cfg(test)]
mod tests;
