//! Commands shipped with the engine. Job commands live in
//! [`crate::jobexecutor`].

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

use super::{Command, CommandContext};
use crate::error::{EngineError, EntityKind};
use crate::events::RuntimeEvent;
use crate::execution::{ExecutionNode, ExecutionTree};
use crate::job::{Job, JobState};
use crate::store::JobQuery;
use crate::types::{ExecutionId, JobId, ProcessInstanceId};

/// Which deployed definition to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefinitionRef {
    /// Latest version of a key.
    Key(String),
    /// An exact `"<key>:<version>"`.
    Id(String),
}

// ---------------------------------------------------------------------------
// StartProcessInstance
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StartProcessInstance {
    pub definition: DefinitionRef,
    pub business_key: Option<String>,
    pub variables: BTreeMap<String, Value>,
}

impl StartProcessInstance {
    pub fn by_key(key: impl Into<String>) -> Self {
        Self {
            definition: DefinitionRef::Key(key.into()),
            business_key: None,
            variables: BTreeMap::new(),
        }
    }

    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            definition: DefinitionRef::Id(id.into()),
            business_key: None,
            variables: BTreeMap::new(),
        }
    }

    pub fn business_key(mut self, key: impl Into<String>) -> Self {
        self.business_key = Some(key.into());
        self
    }

    pub fn variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    pub fn variables(mut self, variables: BTreeMap<String, Value>) -> Self {
        self.variables.extend(variables);
        self
    }
}

#[async_trait]
impl Command for StartProcessInstance {
    type Output = ProcessInstanceId;

    fn name(&self) -> &'static str {
        "start-process-instance"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<ProcessInstanceId, EngineError> {
        let definitions = &ctx.services().definitions;
        let definition = match &self.definition {
            DefinitionRef::Key(key) => definitions.latest(key)?,
            DefinitionRef::Id(id) => definitions.get(id)?,
        };

        let mut tree = ExecutionTree::new_root(
            &definition.id,
            definition.graph.initial(),
            self.business_key.clone(),
        );
        let id = tree.process_instance_id();
        let mut events = vec![RuntimeEvent::InstanceStarted {
            process_definition_id: definition.id.clone(),
            business_key: self.business_key.clone(),
        }];
        for (name, value) in &self.variables {
            tree.set_variable_local(id, name, value.clone())?;
            events.push(RuntimeEvent::VariableSet {
                execution_id: id,
                name: name.clone(),
            });
        }
        ctx.session.insert_instance(tree);
        ctx.record(id, events);

        ctx.walk(id, |pvm| pvm.start()).await?;
        tracing::debug!(
            process_instance_id = %id,
            definition_id = %definition.id,
            "process instance started"
        );
        Ok(id)
    }
}

// ---------------------------------------------------------------------------
// SignalExecution
// ---------------------------------------------------------------------------

/// Resume an execution parked in a wait state, optionally writing variables
/// first (visible-scope rule).
#[derive(Debug, Clone)]
pub struct SignalExecution {
    pub execution_id: ExecutionId,
    pub variables: BTreeMap<String, Value>,
}

impl SignalExecution {
    pub fn new(execution_id: ExecutionId) -> Self {
        Self {
            execution_id,
            variables: BTreeMap::new(),
        }
    }

    pub fn variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }
}

#[async_trait]
impl Command for SignalExecution {
    type Output = ();

    fn name(&self) -> &'static str {
        "signal-execution"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<(), EngineError> {
        let id = ctx.process_instance_of(self.execution_id).await?;
        let events = write_variables(ctx, id, self.execution_id, &self.variables, false).await?;
        ctx.record(id, events);
        ctx.walk(id, |pvm| pvm.signal(self.execution_id)).await
    }
}

// ---------------------------------------------------------------------------
// Variables
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SetVariables {
    pub execution_id: ExecutionId,
    pub variables: BTreeMap<String, Value>,
    /// Declare on `execution_id` itself, which must be a scope.
    pub local: bool,
}

#[async_trait]
impl Command for SetVariables {
    type Output = ();

    fn name(&self) -> &'static str {
        "set-variables"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<(), EngineError> {
        let id = ctx.process_instance_of(self.execution_id).await?;
        let events =
            write_variables(ctx, id, self.execution_id, &self.variables, self.local).await?;
        ctx.record(id, events);
        Ok(())
    }
}

async fn write_variables(
    ctx: &mut CommandContext,
    id: ProcessInstanceId,
    execution_id: ExecutionId,
    variables: &BTreeMap<String, Value>,
    local: bool,
) -> Result<Vec<RuntimeEvent>, EngineError> {
    if variables.is_empty() {
        return Ok(Vec::new());
    }
    let tree = ctx.session.instance(id).await?;
    let mut events = Vec::with_capacity(variables.len());
    for (name, value) in variables {
        let owner = if local {
            tree.set_variable_local(execution_id, name, value.clone())?;
            execution_id
        } else {
            tree.set_variable(execution_id, name, value.clone())?
        };
        events.push(RuntimeEvent::VariableSet {
            execution_id: owner,
            name: name.clone(),
        });
    }
    Ok(events)
}

/// Variables visible from an execution, or only its own when `local`.
#[derive(Debug, Clone)]
pub struct GetVariables {
    pub execution_id: ExecutionId,
    pub local: bool,
}

#[async_trait]
impl Command for GetVariables {
    type Output = BTreeMap<String, Value>;

    fn name(&self) -> &'static str {
        "get-variables"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<Self::Output, EngineError> {
        let id = ctx.process_instance_of(self.execution_id).await?;
        let tree = ctx.session.instance(id).await?;
        if self.local {
            tree.local_variables(self.execution_id)
        } else {
            tree.visible_variables(self.execution_id)
        }
    }
}

// ---------------------------------------------------------------------------
// Instance lifecycle
// ---------------------------------------------------------------------------

/// Delete the whole execution tree of an instance together with its
/// variables and jobs.
#[derive(Debug, Clone)]
pub struct CancelProcessInstance {
    pub process_instance_id: ProcessInstanceId,
    pub reason: Option<String>,
}

#[async_trait]
impl Command for CancelProcessInstance {
    type Output = ();

    fn name(&self) -> &'static str {
        "cancel-process-instance"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<(), EngineError> {
        let id = self.process_instance_id;
        let tree = ctx.session.instance(id).await?;
        let removed = tree.remove_subtree(id)?;
        tracing::info!(
            process_instance_id = %id,
            executions = removed.len(),
            reason = self.reason.as_deref().unwrap_or(""),
            "process instance cancelled"
        );
        ctx.record(
            id,
            vec![RuntimeEvent::InstanceCancelled {
                reason: self.reason.clone(),
            }],
        );
        Ok(())
    }
}

/// Read-only snapshot of a running instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessInstanceView {
    pub id: ProcessInstanceId,
    pub process_definition_id: String,
    pub business_key: Option<String>,
    pub root: ExecutionNode,
    /// Variables declared on the root scope.
    pub variables: BTreeMap<String, Value>,
    pub jobs: Vec<Job>,
}

#[derive(Debug, Clone)]
pub struct GetProcessInstance {
    pub process_instance_id: ProcessInstanceId,
}

#[async_trait]
impl Command for GetProcessInstance {
    type Output = ProcessInstanceView;

    fn name(&self) -> &'static str {
        "get-process-instance"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<ProcessInstanceView, EngineError> {
        let id = self.process_instance_id;
        let tree = ctx.session.instance(id).await?;
        let root = tree.root()?;
        Ok(ProcessInstanceView {
            id,
            process_definition_id: root.process_definition_id.clone(),
            business_key: root.business_key.clone(),
            root: tree.snapshot()?,
            variables: tree.local_variables(id)?,
            jobs: tree.jobs().cloned().collect(),
        })
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct ListJobs {
    pub query: JobQuery,
}

#[async_trait]
impl Command for ListJobs {
    type Output = Vec<Job>;

    fn name(&self) -> &'static str {
        "list-jobs"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<Vec<Job>, EngineError> {
        Ok(ctx.session.store().list_jobs(&self.query).await?)
    }
}

/// Manual reset of a job, typically one in `Failed` state: it becomes
/// active, unlocked and due immediately.
#[derive(Debug, Clone)]
pub struct SetJobRetries {
    pub job_id: JobId,
    pub retries: u32,
}

#[async_trait]
impl Command for SetJobRetries {
    type Output = ();

    fn name(&self) -> &'static str {
        "set-job-retries"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<(), EngineError> {
        let now = ctx.now();
        let job = ctx
            .session
            .load_job(self.job_id)
            .await?
            .ok_or_else(|| EngineError::not_found(EntityKind::Job, self.job_id))?;
        let tree = ctx.session.instance(job.process_instance_id).await?;
        let job = tree
            .job_mut(self.job_id)
            .ok_or_else(|| EngineError::not_found(EntityKind::Job, self.job_id))?;
        job.retries_left = self.retries;
        job.failures = 0;
        job.state = JobState::Active;
        job.lock_owner = None;
        job.lock_expiration_time = None;
        job.exception_message = None;
        job.due_date = now;
        tracing::info!(job_id = %self.job_id, retries = self.retries, "job retries reset");
        Ok(())
    }
}
