use super::*;
use crate::graph::ErrorHandler;

impl<'a> Pvm<'a> {
    /// Route a business fault raised by `execution` in `activity` to the
    /// nearest boundary handler, walking out through enclosing
    /// sub-processes. Unhandled at the top level, it fails the walk.
    pub(super) fn raise_fault(
        &mut self,
        execution: ExecutionId,
        activity: &'a Activity,
        error_code: &str,
    ) -> Result<(), EngineError> {
        let graph: &'a ProcessGraph = self.graph;
        let mut carrier = execution;
        let mut current = activity;

        loop {
            if let Some(handler) = find_handler(current, error_code) {
                if self.is_scope_for(carrier, current) {
                    if let Some(parent) = self.tree.get(carrier)?.parent_id {
                        carrier = parent;
                    }
                }
                return self.reroute(carrier, error_code, handler);
            }

            let Some(outer) = graph.enclosing(&current.id) else {
                tracing::debug!(
                    execution_id = %execution,
                    activity_id = %activity.id,
                    error_code,
                    "business fault unhandled"
                );
                return Err(EngineError::BusinessFault {
                    error_code: error_code.to_string(),
                    activity_id: activity.id.clone(),
                });
            };
            carrier = self.ancestor_at(carrier, &outer.id)?;
            current = outer;
        }
    }

    /// Nearest strict ancestor of `execution` positioned at `activity_id`.
    fn ancestor_at(
        &self,
        execution: ExecutionId,
        activity_id: &str,
    ) -> Result<ExecutionId, EngineError> {
        for id in self.tree.ancestors_inclusive(execution)?.into_iter().skip(1) {
            if self.tree.get(id)?.activity_id == activity_id {
                return Ok(id);
            }
        }
        Err(EngineError::structural(format!(
            "execution {execution} is not inside an execution of '{activity_id}'"
        )))
    }

    /// Cancel everything below `carrier` and move it to the handler target.
    fn reroute(
        &mut self,
        carrier: ExecutionId,
        error_code: &str,
        handler: &'a ErrorHandler,
    ) -> Result<(), EngineError> {
        self.tree.clear_children(carrier)?;
        self.tree
            .remove_jobs_of_type(carrier, JobHandlerType::TimerFire);
        self.tree
            .remove_jobs_of_type(carrier, JobHandlerType::AsyncContinuation);
        let c = self.tree.get_mut(carrier)?;
        c.is_active = true;
        c.activity_id = handler.target.clone();

        tracing::debug!(
            execution_id = %carrier,
            error_code,
            target = %handler.target,
            "business fault routed"
        );
        self.emit(RuntimeEvent::ErrorRouted {
            execution_id: carrier,
            error_code: error_code.to_string(),
            handler_activity_id: handler.target.clone(),
        });
        self.push(Operation::ExecuteActivity {
            execution: carrier,
            skip_async: false,
        });
        Ok(())
    }

    /// Terminate end: the whole instance ends now.
    pub(super) fn terminate(&mut self) -> Result<(), EngineError> {
        let root = self.tree.process_instance_id();
        self.tree.remove_subtree(root)?;
        self.agenda.clear();
        self.emit(RuntimeEvent::InstanceEnded);
        Ok(())
    }
}

/// Specific error code first, then a catch-all.
fn find_handler<'g>(activity: &'g Activity, error_code: &str) -> Option<&'g ErrorHandler> {
    activity
        .error_handlers
        .iter()
        .find(|h| h.error_code.as_deref() == Some(error_code))
        .or_else(|| activity.error_handlers.iter().find(|h| h.error_code.is_none()))
}
