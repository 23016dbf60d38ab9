//! Engine facade: the services a node shares between commands, and the
//! single `execute` entry point.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::command::{
    CancelProcessInstance, Command, CommandExecutor, GetProcessInstance, GetVariables, Interceptor,
    ListJobs, ProcessInstanceView, SetJobRetries, SetVariables, SignalExecution,
    StartProcessInstance,
};
use crate::config::EngineConfig;
use crate::definitions::{DefinitionRegistry, DeployedDefinition};
use crate::error::EngineError;
use crate::events::EventListener;
use crate::expression::{ExpressionEvaluator, RhaiExpressionEvaluator};
use crate::graph::ProcessGraph;
use crate::handler::{ActivityContext, ActivityHandler, HandlerError, HandlerRegistry};
use crate::job::Job;
use crate::pvm::PvmEnv;
use crate::store::{JobQuery, MemoryStore, PersistenceSession};
use crate::types::{ExecutionId, JobId, ProcessInstanceId, Timestamp};

/// Collaborators shared by every command of one engine.
pub struct EngineServices {
    pub config: EngineConfig,
    pub store: Arc<dyn PersistenceSession>,
    pub definitions: DefinitionRegistry,
    pub handlers: HandlerRegistry,
    pub evaluator: Arc<dyn ExpressionEvaluator>,
    pub clock: Arc<dyn Clock>,
    pub listeners: Vec<Arc<dyn EventListener>>,
}

impl EngineServices {
    pub fn pvm_env(&self, now: Timestamp) -> PvmEnv<'_> {
        PvmEnv {
            evaluator: self.evaluator.as_ref(),
            handlers: &self.handlers,
            now,
            job_retries: self.config.job_executor.default_retries,
        }
    }
}

/// Cheap to clone; clones share the same services and chain.
#[derive(Clone)]
pub struct ProcessEngine {
    executor: Arc<CommandExecutor>,
}

impl ProcessEngine {
    pub fn builder() -> ProcessEngineBuilder {
        ProcessEngineBuilder::default()
    }

    pub async fn execute<C: Command>(&self, command: &C) -> Result<C::Output, EngineError> {
        self.executor.execute(command).await
    }

    pub fn services(&self) -> &Arc<EngineServices> {
        self.executor.services()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.services().config
    }

    pub fn store(&self) -> &Arc<dyn PersistenceSession> {
        &self.services().store
    }

    pub fn definitions(&self) -> &DefinitionRegistry {
        &self.services().definitions
    }

    pub fn now(&self) -> Timestamp {
        self.services().clock.now()
    }

    // ── Deployment ──

    /// Validate and deploy a graph. Every handler an activity names must
    /// already be registered.
    pub fn deploy(&self, graph: ProcessGraph) -> Result<Arc<DeployedDefinition>, EngineError> {
        let handlers = &self.services().handlers;
        let missing: Vec<String> = graph
            .activities()
            .filter_map(|a| a.handler.as_deref().map(|h| (a.id.as_str(), h)))
            .filter(|(_, h)| !handlers.contains(h))
            .map(|(a, h)| format!("activity '{a}' names unregistered handler '{h}'"))
            .collect();
        if !missing.is_empty() {
            return Err(EngineError::InvalidDefinition(missing.join("; ")));
        }
        self.definitions().deploy(graph)
    }

    pub fn deploy_yaml(&self, yaml: &str) -> Result<Arc<DeployedDefinition>, EngineError> {
        self.deploy(ProcessGraph::from_yaml_str(yaml)?)
    }

    // ── Convenience wrappers over the built-in commands ──

    pub async fn start_process(
        &self,
        key: &str,
        variables: BTreeMap<String, Value>,
    ) -> Result<ProcessInstanceId, EngineError> {
        self.execute(&StartProcessInstance::by_key(key).variables(variables))
            .await
    }

    pub async fn signal(
        &self,
        execution_id: ExecutionId,
        variables: BTreeMap<String, Value>,
    ) -> Result<(), EngineError> {
        self.execute(&SignalExecution {
            execution_id,
            variables,
        })
        .await
    }

    pub async fn set_variables(
        &self,
        execution_id: ExecutionId,
        variables: BTreeMap<String, Value>,
    ) -> Result<(), EngineError> {
        self.execute(&SetVariables {
            execution_id,
            variables,
            local: false,
        })
        .await
    }

    pub async fn variables(
        &self,
        execution_id: ExecutionId,
    ) -> Result<BTreeMap<String, Value>, EngineError> {
        self.execute(&GetVariables {
            execution_id,
            local: false,
        })
        .await
    }

    pub async fn cancel(
        &self,
        process_instance_id: ProcessInstanceId,
        reason: Option<String>,
    ) -> Result<(), EngineError> {
        self.execute(&CancelProcessInstance {
            process_instance_id,
            reason,
        })
        .await
    }

    pub async fn process_instance(
        &self,
        process_instance_id: ProcessInstanceId,
    ) -> Result<ProcessInstanceView, EngineError> {
        self.execute(&GetProcessInstance {
            process_instance_id,
        })
        .await
    }

    pub async fn jobs(&self, query: JobQuery) -> Result<Vec<Job>, EngineError> {
        self.execute(&ListJobs { query }).await
    }

    pub async fn set_job_retries(&self, job_id: JobId, retries: u32) -> Result<(), EngineError> {
        self.execute(&SetJobRetries { job_id, retries }).await
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct ProcessEngineBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn PersistenceSession>>,
    clock: Option<Arc<dyn Clock>>,
    evaluator: Option<Arc<dyn ExpressionEvaluator>>,
    handlers: HandlerRegistry,
    listeners: Vec<Arc<dyn EventListener>>,
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl ProcessEngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Defaults to a fresh [`MemoryStore`].
    pub fn store(mut self, store: Arc<dyn PersistenceSession>) -> Self {
        self.store = Some(store);
        self
    }

    /// Defaults to [`SystemClock`].
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Defaults to [`RhaiExpressionEvaluator`].
    pub fn evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn handler(mut self, name: impl Into<String>, handler: impl ActivityHandler + 'static) -> Self {
        self.handlers.register(name, handler);
        self
    }

    pub fn handler_fn<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut ActivityContext<'_>) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.handlers.register_fn(name, f);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn EventListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Add an interceptor right after the log interceptor, outside the
    /// retry loop. Added interceptors keep their order.
    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn build(self) -> ProcessEngine {
        let services = Arc::new(EngineServices {
            store: self
                .store
                .unwrap_or_else(|| Arc::new(MemoryStore::new())),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            evaluator: self
                .evaluator
                .unwrap_or_else(|| Arc::new(RhaiExpressionEvaluator::new())),
            definitions: DefinitionRegistry::new(),
            handlers: self.handlers,
            listeners: self.listeners,
            config: self.config,
        });
        tracing::debug!(
            node_id = %services.config.node_id,
            command_retries = services.config.command_retries,
            handlers = services.handlers.len(),
            "process engine built"
        );
        ProcessEngine {
            executor: Arc::new(CommandExecutor::default_chain(services, self.interceptors)),
        }
    }
}
