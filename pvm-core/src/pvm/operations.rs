use super::*;
use crate::graph::{EndKind, Transition};
use crate::handler::{ActivityContext, HandlerError};
use crate::job::Job;
use crate::types::add_duration;
use std::time::Duration;

impl<'a> Pvm<'a> {
    pub(super) fn execute_activity(
        &mut self,
        execution: ExecutionId,
        skip_async: bool,
    ) -> Result<(), EngineError> {
        let graph: &'a ProcessGraph = self.graph;
        let activity = graph.require_activity(&self.tree.get(execution)?.activity_id)?;

        if activity.async_before && !skip_async {
            self.create_async_job(execution, activity, AsyncPhase::Before)?;
            return Ok(());
        }

        if activity.opens_scope() && !self.is_scope_for(execution, activity) {
            self.tree.get_mut(execution)?.is_active = false;
            let (first, skip) = match &activity.behavior {
                Behavior::SubProcess { initial } => {
                    self.emit(RuntimeEvent::ActivityEntered {
                        execution_id: execution,
                        activity_id: activity.id.clone(),
                    });
                    (initial.as_str(), false)
                }
                // The scope execution enters the activity itself.
                _ => (activity.id.as_str(), true),
            };
            let scope = self.tree.create_child(execution, first, true, false)?;
            self.push(Operation::ExecuteActivity {
                execution: scope,
                skip_async: skip,
            });
            return Ok(());
        }

        self.emit(RuntimeEvent::ActivityEntered {
            execution_id: execution,
            activity_id: activity.id.clone(),
        });

        match &activity.behavior {
            Behavior::Automatic { .. } => {
                if self.run_handler(execution, activity)? {
                    self.push(Operation::LeaveActivity {
                        execution,
                        skip_async: false,
                    });
                }
                Ok(())
            }
            // Gateways choose their way out when leaving, after any async
            // boundary.
            Behavior::Decision { .. } | Behavior::Fork => {
                self.push(Operation::LeaveActivity {
                    execution,
                    skip_async: false,
                });
                Ok(())
            }
            Behavior::Join { mode } => self.arrive_at_join(execution, activity, *mode),
            Behavior::WaitState { timer } => {
                if let Some(timer) = timer {
                    let due = add_duration(self.env.now, Duration::from_millis(timer.duration_ms));
                    let job = Job::timer(
                        self.tree.process_instance_id(),
                        execution,
                        &activity.id,
                        due,
                        self.env.job_retries,
                    );
                    self.add_job(job);
                }
                Ok(())
            }
            Behavior::SubProcess { .. } => Err(EngineError::structural(format!(
                "sub-process '{}' entered without opening its scope",
                activity.id
            ))),
            Behavior::End { kind } => match kind {
                EndKind::None => {
                    self.push(Operation::EndExecution { execution });
                    Ok(())
                }
                EndKind::Terminate => self.terminate(),
                EndKind::Error(code) => self.raise_fault(execution, activity, code),
            },
        }
    }

    /// Run the activity's handler. `Ok(false)` means a business fault was
    /// routed elsewhere and the execution must not leave normally.
    fn run_handler(
        &mut self,
        execution: ExecutionId,
        activity: &'a Activity,
    ) -> Result<bool, EngineError> {
        let Some(name) = activity.handler.as_deref() else {
            return Ok(true);
        };
        let handler = self.env.handlers.get(name).ok_or_else(|| {
            EngineError::InvalidDefinition(format!(
                "activity '{}' uses unregistered handler '{name}'",
                activity.id
            ))
        })?;

        let mut ctx = ActivityContext::new(&mut *self.tree, execution, &activity.id);
        let result = handler.execute(&mut ctx);
        for (owner, variable) in ctx.into_written() {
            self.emit(RuntimeEvent::VariableSet {
                execution_id: owner,
                name: variable,
            });
        }

        match result {
            Ok(()) => Ok(true),
            Err(HandlerError::Business { code, message }) => {
                tracing::debug!(
                    execution_id = %execution,
                    activity_id = %activity.id,
                    error_code = %code,
                    %message,
                    "business error raised by handler"
                );
                self.raise_fault(execution, activity, &code)?;
                Ok(false)
            }
            Err(HandlerError::Technical(e)) => Err(EngineError::HandlerExecution {
                activity_id: activity.id.clone(),
                message: format!("{e:#}"),
            }),
        }
    }

    pub(super) fn leave_activity(
        &mut self,
        execution: ExecutionId,
        skip_async: bool,
    ) -> Result<(), EngineError> {
        let graph: &'a ProcessGraph = self.graph;
        let activity = graph.require_activity(&self.tree.get(execution)?.activity_id)?;

        self.tree
            .remove_jobs_of_type(execution, JobHandlerType::TimerFire);

        if activity.async_after && !skip_async {
            self.create_async_job(execution, activity, AsyncPhase::After)?;
            return Ok(());
        }

        // Leaving a scoped activity closes its scope; the parent carries on.
        let mut current = execution;
        let parent = self.tree.get(execution)?.parent_id;
        if let (true, Some(parent)) = (self.is_scope_for(execution, activity), parent) {
            self.tree.remove_subtree(execution)?;
            self.tree.get_mut(parent)?.is_active = true;
            current = parent;
        }

        match &activity.behavior {
            Behavior::Decision { mode } => return self.decide(current, activity, *mode),
            Behavior::Fork => {
                self.emit(RuntimeEvent::ActivityLeft {
                    execution_id: current,
                    activity_id: activity.id.clone(),
                });
                return self.fork_to(current, graph.outgoing(&activity.id));
            }
            _ => {}
        }

        self.emit(RuntimeEvent::ActivityLeft {
            execution_id: current,
            activity_id: activity.id.clone(),
        });

        let parallel = matches!(activity.behavior, Behavior::Automatic { parallel: true });
        let taken = self.enabled_transitions(current, &activity.id, !parallel)?;
        match taken.len() {
            0 => self.push(Operation::EndExecution { execution: current }),
            1 => self.push(Operation::TakeTransition {
                execution: current,
                transition: taken[0].id.clone(),
                skip_async: false,
            }),
            _ => self.fork_to(current, taken)?,
        }
        Ok(())
    }

    /// Non-default outgoing transitions whose condition holds (or that have
    /// none), in declaration order. `first_only` stops at the first match.
    pub(super) fn enabled_transitions(
        &self,
        execution: ExecutionId,
        activity_id: &str,
        first_only: bool,
    ) -> Result<Vec<&'a Transition>, EngineError> {
        let graph: &'a ProcessGraph = self.graph;
        let vars = self.tree.visible_variables(execution)?;
        let mut out = Vec::new();
        for t in graph.outgoing(activity_id) {
            if t.is_default {
                continue;
            }
            let holds = match &t.condition {
                None => true,
                Some(expr) => self.env.evaluator.evaluate_condition(expr, &vars)?,
            };
            if holds {
                out.push(t);
                if first_only {
                    break;
                }
            }
        }
        Ok(out)
    }

    pub(super) fn take_transition(
        &mut self,
        execution: ExecutionId,
        transition_id: &str,
        skip_async: bool,
    ) -> Result<(), EngineError> {
        let transition = self.graph.transition(transition_id).ok_or_else(|| {
            EngineError::InvalidDefinition(format!("unknown transition '{transition_id}'"))
        })?;
        if transition.is_async && !skip_async {
            // The token stays on the source activity until the job runs.
            let job = Job::async_transition(
                self.tree.process_instance_id(),
                execution,
                &self.tree.get(execution)?.activity_id,
                &transition.id,
                self.env.now,
                self.env.job_retries,
            );
            self.add_job(job);
            return Ok(());
        }
        self.emit(RuntimeEvent::TransitionTaken {
            execution_id: execution,
            transition_id: transition.id.clone(),
        });
        self.tree.get_mut(execution)?.activity_id = transition.destination.clone();
        self.push(Operation::ExecuteActivity {
            execution,
            skip_async: false,
        });
        Ok(())
    }

    pub(super) fn end_execution(&mut self, execution: ExecutionId) -> Result<(), EngineError> {
        let e = self.tree.get(execution)?;
        let (is_concurrent, parent) = (e.is_concurrent, e.parent_id);
        match (is_concurrent, parent) {
            (true, Some(parent)) => {
                self.tree.remove_subtree(execution)?;
                self.tree.touch(parent);
                if self.tree.children(parent).is_empty() {
                    self.complete_scope(parent)
                } else {
                    // A branch that ends can unblock an inclusive join.
                    self.retry_inclusive_joins(parent)
                }
            }
            _ => self.complete_scope(execution),
        }
    }

    /// Every token of `scope` is done: end the instance, or close the
    /// sub-process scope and let its parent leave the sub-process activity.
    pub(super) fn complete_scope(&mut self, scope: ExecutionId) -> Result<(), EngineError> {
        let parent = self.tree.get(scope)?.parent_id;
        match parent {
            None => {
                self.tree.remove_subtree(scope)?;
                self.agenda.clear();
                self.emit(RuntimeEvent::InstanceEnded);
                Ok(())
            }
            Some(parent) => {
                self.tree.remove_subtree(scope)?;
                self.tree.get_mut(parent)?.is_active = true;
                self.push(Operation::LeaveActivity {
                    execution: parent,
                    skip_async: false,
                });
                Ok(())
            }
        }
    }

    pub(super) fn create_async_job(
        &mut self,
        execution: ExecutionId,
        activity: &Activity,
        phase: AsyncPhase,
    ) -> Result<(), EngineError> {
        let job = Job::async_continuation(
            self.tree.process_instance_id(),
            execution,
            &activity.id,
            phase,
            self.env.now,
            self.env.job_retries,
        );
        self.add_job(job);
        Ok(())
    }

    fn add_job(&mut self, job: Job) {
        self.emit(RuntimeEvent::JobCreated {
            job_id: job.id,
            execution_id: job.execution_id,
            handler_type: job.handler_type,
        });
        self.tree.add_job(job);
    }
}
