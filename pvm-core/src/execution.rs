//! Execution tree: the runtime tokens of one process instance.
//!
//! Executions live in an arena keyed by id; parent/child links are ids, so
//! the tree has no ownership cycles. Variables and jobs of the instance are
//! held alongside so one command can mutate the whole aggregate and the
//! session can diff it on commit.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{EngineError, EntityKind};
use crate::job::{Job, JobHandlerType};
use crate::types::{new_id, ExecutionId, JobId, ProcessInstanceId, Revision, VariableId};
use crate::variables::VariableInstance;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub process_instance_id: ProcessInstanceId,
    pub process_definition_id: String,
    pub parent_id: Option<ExecutionId>,
    pub activity_id: String,
    pub is_active: bool,
    pub is_concurrent: bool,
    pub is_scope: bool,
    /// Set on the root only.
    pub business_key: Option<String>,
    pub revision: Revision,
}

impl Execution {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// Everything persisted for one process instance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceRecord {
    pub executions: Vec<Execution>,
    pub variables: Vec<VariableInstance>,
    pub jobs: Vec<Job>,
}

/// Nested, read-only view of a tree, for callers and tests.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionNode {
    pub id: ExecutionId,
    pub activity_id: String,
    pub is_active: bool,
    pub is_concurrent: bool,
    pub is_scope: bool,
    pub children: Vec<ExecutionNode>,
}

impl ExecutionNode {
    /// Active leaves, depth first.
    pub fn active_activities(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_active(&mut out);
        out
    }

    fn collect_active<'a>(&'a self, out: &mut Vec<&'a str>) {
        if self.is_active {
            out.push(&self.activity_id);
        }
        for c in &self.children {
            c.collect_active(out);
        }
    }

    pub fn count(&self) -> usize {
        1 + self.children.iter().map(ExecutionNode::count).sum::<usize>()
    }
}

// ---------------------------------------------------------------------------
// ExecutionTree
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ExecutionTree {
    process_instance_id: ProcessInstanceId,
    executions: BTreeMap<ExecutionId, Execution>,
    children: BTreeMap<ExecutionId, Vec<ExecutionId>>,
    pub(crate) variables: BTreeMap<VariableId, VariableInstance>,
    jobs: BTreeMap<JobId, Job>,
    touched: BTreeSet<ExecutionId>,
}

impl ExecutionTree {
    /// A fresh instance: one active root scope at `activity_id`.
    pub fn new_root(
        process_definition_id: &str,
        activity_id: &str,
        business_key: Option<String>,
    ) -> Self {
        let id = new_id();
        let root = Execution {
            id,
            process_instance_id: id,
            process_definition_id: process_definition_id.to_string(),
            parent_id: None,
            activity_id: activity_id.to_string(),
            is_active: true,
            is_concurrent: false,
            is_scope: true,
            business_key,
            revision: 0,
        };
        let mut tree = Self::empty(id);
        tree.executions.insert(id, root);
        tree
    }

    fn empty(process_instance_id: ProcessInstanceId) -> Self {
        Self {
            process_instance_id,
            executions: BTreeMap::new(),
            children: BTreeMap::new(),
            variables: BTreeMap::new(),
            jobs: BTreeMap::new(),
            touched: BTreeSet::new(),
        }
    }

    /// Rebuild from persisted rows. Fails if the rows do not form a tree.
    pub fn from_record(
        process_instance_id: ProcessInstanceId,
        record: InstanceRecord,
    ) -> Result<Self, EngineError> {
        let mut tree = Self::empty(process_instance_id);
        for e in record.executions {
            tree.executions.insert(e.id, e);
        }
        let links: Vec<(ExecutionId, ExecutionId)> = tree
            .executions
            .values()
            .filter_map(|e| e.parent_id.map(|p| (p, e.id)))
            .collect();
        for (parent, child) in links {
            tree.children.entry(parent).or_default().push(child);
        }
        for v in record.variables {
            tree.variables.insert(v.id, v);
        }
        for j in record.jobs {
            tree.jobs.insert(j.id, j);
        }
        tree.validate()?;
        Ok(tree)
    }

    pub fn to_record(&self) -> InstanceRecord {
        InstanceRecord {
            executions: self.executions.values().cloned().collect(),
            variables: self.variables.values().cloned().collect(),
            jobs: self.jobs.values().cloned().collect(),
        }
    }

    pub fn process_instance_id(&self) -> ProcessInstanceId {
        self.process_instance_id
    }

    /// True once the root has been removed (process ended or cancelled).
    pub fn is_ended(&self) -> bool {
        !self.executions.contains_key(&self.process_instance_id)
    }

    pub fn root(&self) -> Result<&Execution, EngineError> {
        self.get(self.process_instance_id)
    }

    pub fn process_definition_id(&self) -> Option<&str> {
        self.executions
            .get(&self.process_instance_id)
            .map(|r| r.process_definition_id.as_str())
    }

    pub fn get(&self, id: ExecutionId) -> Result<&Execution, EngineError> {
        self.executions
            .get(&id)
            .ok_or_else(|| EngineError::not_found(EntityKind::Execution, id))
    }

    pub fn get_mut(&mut self, id: ExecutionId) -> Result<&mut Execution, EngineError> {
        self.executions
            .get_mut(&id)
            .ok_or_else(|| EngineError::not_found(EntityKind::Execution, id))
    }

    pub fn contains(&self, id: ExecutionId) -> bool {
        self.executions.contains_key(&id)
    }

    pub fn executions(&self) -> impl Iterator<Item = &Execution> {
        self.executions.values()
    }

    pub fn children(&self, id: ExecutionId) -> &[ExecutionId] {
        self.children.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn parent(&self, id: ExecutionId) -> Result<Option<&Execution>, EngineError> {
        match self.get(id)?.parent_id {
            Some(p) => self.get(p).map(Some),
            None => Ok(None),
        }
    }

    /// `id` and its ancestors, nearest first.
    pub fn ancestors_inclusive(&self, id: ExecutionId) -> Result<Vec<ExecutionId>, EngineError> {
        let mut chain = Vec::new();
        let mut current = Some(id);
        while let Some(c) = current {
            let e = self.get(c)?;
            chain.push(c);
            current = e.parent_id;
            if chain.len() > self.executions.len() {
                return Err(EngineError::structural(format!(
                    "cycle in parent chain of execution {id}"
                )));
            }
        }
        Ok(chain)
    }

    /// Nearest execution, starting at `id`, that owns a variable scope.
    pub fn nearest_scope(&self, id: ExecutionId) -> Result<ExecutionId, EngineError> {
        for a in self.ancestors_inclusive(id)? {
            if self.get(a)?.is_scope {
                return Ok(a);
            }
        }
        Err(EngineError::structural(format!(
            "execution {id} has no enclosing scope"
        )))
    }

    /// Add a child under `parent`, active at `activity_id`.
    pub fn create_child(
        &mut self,
        parent: ExecutionId,
        activity_id: &str,
        is_scope: bool,
        is_concurrent: bool,
    ) -> Result<ExecutionId, EngineError> {
        let p = self.get(parent)?;
        let child = Execution {
            id: new_id(),
            process_instance_id: p.process_instance_id,
            process_definition_id: p.process_definition_id.clone(),
            parent_id: Some(parent),
            activity_id: activity_id.to_string(),
            is_active: true,
            is_concurrent,
            is_scope,
            business_key: None,
            revision: 0,
        };
        let id = child.id;
        self.executions.insert(id, child);
        self.children.entry(parent).or_default().push(id);
        Ok(id)
    }

    /// Remove `id` and all its descendants together with their variables and
    /// jobs. Returns the removed execution ids, deepest first.
    pub fn remove_subtree(&mut self, id: ExecutionId) -> Result<Vec<ExecutionId>, EngineError> {
        let parent = self.get(id)?.parent_id;
        let mut order = Vec::new();
        let mut stack = vec![id];
        while let Some(e) = stack.pop() {
            order.push(e);
            stack.extend(self.children(e).iter().copied());
        }
        order.reverse();

        let doomed: BTreeSet<ExecutionId> = order.iter().copied().collect();
        for e in &order {
            self.executions.remove(e);
            self.children.remove(e);
            self.touched.remove(e);
        }
        self.variables
            .retain(|_, v| !doomed.contains(&v.owner_execution_id));
        self.jobs.retain(|_, j| !doomed.contains(&j.execution_id));
        if let Some(p) = parent {
            if let Some(siblings) = self.children.get_mut(&p) {
                siblings.retain(|c| *c != id);
            }
        }
        Ok(order)
    }

    /// Remove only the descendants of `id`.
    pub fn clear_children(&mut self, id: ExecutionId) -> Result<(), EngineError> {
        for child in self.children(id).to_vec() {
            self.remove_subtree(child)?;
        }
        Ok(())
    }

    /// Force a revision bump on commit even if nothing else changed, so two
    /// commands racing on the same parent (e.g. branches arriving at one
    /// join) conflict instead of both succeeding.
    pub fn touch(&mut self, id: ExecutionId) {
        if self.executions.contains_key(&id) {
            self.touched.insert(id);
        }
    }

    pub fn is_touched(&self, id: ExecutionId) -> bool {
        self.touched.contains(&id)
    }

    // ── Jobs ──

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn job(&self, id: JobId) -> Option<&Job> {
        self.jobs.get(&id)
    }

    pub fn job_mut(&mut self, id: JobId) -> Option<&mut Job> {
        self.jobs.get_mut(&id)
    }

    pub fn add_job(&mut self, job: Job) {
        self.jobs.insert(job.id, job);
    }

    pub fn remove_job(&mut self, id: JobId) -> Option<Job> {
        self.jobs.remove(&id)
    }

    pub fn has_job_of_type(&self, execution_id: ExecutionId, kind: JobHandlerType) -> bool {
        self.jobs
            .values()
            .any(|j| j.execution_id == execution_id && j.handler_type == kind)
    }

    /// Drop every job of `kind` attached to `execution_id`.
    pub fn remove_jobs_of_type(&mut self, execution_id: ExecutionId, kind: JobHandlerType) {
        self.jobs
            .retain(|_, j| !(j.execution_id == execution_id && j.handler_type == kind));
    }

    // ── Invariants ──

    /// Check the structural invariants of the tree.
    pub fn validate(&self) -> Result<(), EngineError> {
        let roots: Vec<&Execution> = self.executions.values().filter(|e| e.is_root()).collect();
        if self.executions.is_empty() {
            return Ok(());
        }
        if roots.len() != 1 {
            return Err(EngineError::structural(format!(
                "process instance {} has {} root executions",
                self.process_instance_id,
                roots.len()
            )));
        }
        let root = roots[0];
        if root.id != self.process_instance_id || !root.is_scope {
            return Err(EngineError::structural(format!(
                "root execution {} must be the scope of instance {}",
                root.id, self.process_instance_id
            )));
        }
        for e in self.executions.values() {
            if let Some(p) = e.parent_id {
                let parent = self.get(p).map_err(|_| {
                    EngineError::structural(format!("execution {} has a dangling parent", e.id))
                })?;
                // Parents are scopes, fork containers, or inactive
                // executions suspended on a scope activity.
                let container = parent.is_scope || !parent.is_active;
                if !container {
                    return Err(EngineError::structural(format!(
                        "execution {} has an active non-scope parent {}",
                        e.id, p
                    )));
                }
                if e.is_concurrent && parent.is_active {
                    return Err(EngineError::structural(format!(
                        "concurrent execution {} under active parent {}",
                        e.id, p
                    )));
                }
            }
            self.ancestors_inclusive(e.id)?;
        }
        for v in self.variables.values() {
            if !self.executions.contains_key(&v.owner_execution_id) {
                return Err(EngineError::structural(format!(
                    "variable '{}' owned by missing execution {}",
                    v.name, v.owner_execution_id
                )));
            }
        }
        Ok(())
    }

    /// Nested view rooted at the instance root.
    pub fn snapshot(&self) -> Result<ExecutionNode, EngineError> {
        self.node(self.process_instance_id)
    }

    fn node(&self, id: ExecutionId) -> Result<ExecutionNode, EngineError> {
        let e = self.get(id)?;
        let children = self
            .children(id)
            .iter()
            .map(|c| self.node(*c))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ExecutionNode {
            id,
            activity_id: e.activity_id.clone(),
            is_active: e.is_active,
            is_concurrent: e.is_concurrent,
            is_scope: e.is_scope,
            children,
        })
    }
}
