use super::*;
use crate::graph::{DecisionMode, JoinMode, Transition};

impl<'a> Pvm<'a> {
    pub(super) fn decide(
        &mut self,
        execution: ExecutionId,
        activity: &'a Activity,
        mode: DecisionMode,
    ) -> Result<(), EngineError> {
        let graph: &'a ProcessGraph = self.graph;
        let first_only = mode == DecisionMode::Exclusive;
        let mut taken = self.enabled_transitions(execution, &activity.id, first_only)?;
        if taken.is_empty() {
            match graph.default_transition(&activity.id) {
                Some(default) => taken.push(default),
                None => {
                    return Err(EngineError::structural(format!(
                        "decision '{}' has no enabled transition and no default",
                        activity.id
                    )))
                }
            }
        }

        tracing::debug!(
            execution_id = %execution,
            activity_id = %activity.id,
            taken = ?taken.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(),
            "decision evaluated"
        );
        self.emit(RuntimeEvent::ActivityLeft {
            execution_id: execution,
            activity_id: activity.id.clone(),
        });
        self.fork_to(execution, taken)
    }

    /// Send `execution` down every transition. More than one transition
    /// splits it into concurrent children; a concurrent execution reuses
    /// itself for the first branch and adds siblings for the rest.
    pub(super) fn fork_to(
        &mut self,
        execution: ExecutionId,
        transitions: Vec<&'a Transition>,
    ) -> Result<(), EngineError> {
        if transitions.len() == 1 {
            self.push(Operation::TakeTransition {
                execution,
                transition: transitions[0].id.clone(),
                skip_async: false,
            });
            return Ok(());
        }
        if transitions.is_empty() {
            self.push(Operation::EndExecution { execution });
            return Ok(());
        }

        let e = self.tree.get(execution)?;
        let activity_id = e.activity_id.clone();
        let (container, mut branches) = match (e.is_concurrent, e.parent_id) {
            (true, Some(parent)) => (parent, vec![execution]),
            _ => {
                self.tree.get_mut(execution)?.is_active = false;
                (execution, Vec::new())
            }
        };
        while branches.len() < transitions.len() {
            branches.push(self.tree.create_child(container, &activity_id, false, true)?);
        }
        self.tree.touch(container);

        tracing::debug!(
            execution_id = %execution,
            branches = branches.len(),
            "fork"
        );
        self.emit(RuntimeEvent::ExecutionForked {
            parent_id: container,
            children: branches.clone(),
        });
        for (branch, t) in branches.into_iter().zip(transitions) {
            self.push(Operation::TakeTransition {
                execution: branch,
                transition: t.id.clone(),
                skip_async: false,
            });
        }
        Ok(())
    }

    pub(super) fn arrive_at_join(
        &mut self,
        execution: ExecutionId,
        activity: &'a Activity,
        mode: JoinMode,
    ) -> Result<(), EngineError> {
        let e = self.tree.get(execution)?;
        let (is_concurrent, parent) = (e.is_concurrent, e.parent_id);
        let parent = match (is_concurrent, parent) {
            (true, Some(parent)) => parent,
            _ => {
                // A lone token passes an inclusive join, or a parallel join
                // with a single incoming path. Anything else lost its fork.
                let incoming = self.graph.incoming(&activity.id).len();
                if mode == JoinMode::Parallel && incoming > 1 {
                    return Err(EngineError::structural(format!(
                        "execution {execution} reached join '{}' with no matching fork",
                        activity.id
                    )));
                }
                self.push(Operation::LeaveActivity {
                    execution,
                    skip_async: false,
                });
                return Ok(());
            }
        };

        self.tree.get_mut(execution)?.is_active = false;
        self.tree.touch(parent);
        self.try_merge(parent, activity, mode)?;
        Ok(())
    }

    /// Merge the children of `parent` waiting at `join` if no further
    /// arrival is expected. Returns whether the join fired.
    fn try_merge(
        &mut self,
        parent: ExecutionId,
        join: &'a Activity,
        mode: JoinMode,
    ) -> Result<bool, EngineError> {
        let graph: &'a ProcessGraph = self.graph;
        let mut arrived = Vec::new();
        let mut pending = Vec::new();
        for child in self.tree.children(parent) {
            let c = self.tree.get(*child)?;
            if !c.is_active && c.activity_id == join.id {
                arrived.push(c.id);
            } else {
                pending.push(c.activity_id.as_str());
            }
        }

        let ready = match mode {
            JoinMode::Parallel => arrived.len() >= graph.incoming(&join.id).len(),
            JoinMode::Inclusive => {
                !arrived.is_empty() && pending.iter().all(|a| !graph.can_reach(a, &join.id))
            }
        };
        if !ready {
            tracing::debug!(
                parent_id = %parent,
                join = %join.id,
                arrived = arrived.len(),
                "join waiting"
            );
            return Ok(false);
        }

        for id in &arrived {
            self.tree.remove_subtree(*id)?;
        }
        let continued = if self.tree.children(parent).is_empty() {
            let p = self.tree.get_mut(parent)?;
            p.is_active = true;
            p.activity_id = join.id.clone();
            parent
        } else {
            self.tree.create_child(parent, &join.id, false, true)?
        };

        tracing::debug!(
            parent_id = %parent,
            join = %join.id,
            merged = arrived.len(),
            continued_by = %continued,
            "join fired"
        );
        self.emit(RuntimeEvent::ExecutionsJoined {
            activity_id: join.id.clone(),
            merged: arrived,
            continued_by: continued,
        });
        self.push(Operation::LeaveActivity {
            execution: continued,
            skip_async: false,
        });
        Ok(true)
    }

    /// After a branch under `parent` ended, fire any inclusive join that was
    /// only waiting for it.
    pub(super) fn retry_inclusive_joins(&mut self, parent: ExecutionId) -> Result<(), EngineError> {
        let graph: &'a ProcessGraph = self.graph;
        let mut joins: Vec<&'a Activity> = Vec::new();
        for child in self.tree.children(parent) {
            let c = self.tree.get(*child)?;
            if c.is_active {
                continue;
            }
            if let Some(a) = graph.activity(&c.activity_id) {
                let inclusive = matches!(
                    a.behavior,
                    Behavior::Join {
                        mode: JoinMode::Inclusive
                    }
                );
                if inclusive && !joins.iter().any(|j| j.id == a.id) {
                    joins.push(a);
                }
            }
        }
        for join in joins {
            if self.tree.contains(parent) {
                self.try_merge(parent, join, JoinMode::Inclusive)?;
            }
        }
        Ok(())
    }
}
