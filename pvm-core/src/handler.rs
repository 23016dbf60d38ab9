//! Synchronous work attached to `Automatic` activities.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::EngineError;
use crate::execution::ExecutionTree;
use crate::types::ExecutionId;

/// Failure raised by an [`ActivityHandler`].
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Modelled error, routed to boundary error handlers.
    #[error("business error {code}: {message}")]
    Business { code: String, message: String },

    /// Anything else. Fails the command; in a job it consumes a retry.
    #[error(transparent)]
    Technical(#[from] anyhow::Error),
}

impl From<EngineError> for HandlerError {
    fn from(err: EngineError) -> Self {
        Self::Technical(anyhow::Error::new(err))
    }
}

impl HandlerError {
    pub fn business(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Business {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// View of the executing token handed to a handler.
pub struct ActivityContext<'a> {
    tree: &'a mut ExecutionTree,
    execution_id: ExecutionId,
    activity_id: &'a str,
    written: Vec<(ExecutionId, String)>,
}

impl<'a> ActivityContext<'a> {
    pub(crate) fn new(
        tree: &'a mut ExecutionTree,
        execution_id: ExecutionId,
        activity_id: &'a str,
    ) -> Self {
        Self {
            tree,
            execution_id,
            activity_id,
            written: Vec::new(),
        }
    }

    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    pub fn activity_id(&self) -> &str {
        self.activity_id
    }

    pub fn process_instance_id(&self) -> ExecutionId {
        self.tree.process_instance_id()
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.tree.get_variable(self.execution_id, name).ok()
    }

    pub fn set_variable(&mut self, name: &str, value: Value) -> Result<(), EngineError> {
        let owner = self.tree.set_variable(self.execution_id, name, value)?;
        self.written.push((owner, name.to_string()));
        Ok(())
    }

    pub(crate) fn into_written(self) -> Vec<(ExecutionId, String)> {
        self.written
    }
}

pub trait ActivityHandler: Send + Sync {
    fn execute(&self, ctx: &mut ActivityContext<'_>) -> Result<(), HandlerError>;
}

impl<F> ActivityHandler for F
where
    F: Fn(&mut ActivityContext<'_>) -> Result<(), HandlerError> + Send + Sync,
{
    fn execute(&self, ctx: &mut ActivityContext<'_>) -> Result<(), HandlerError> {
        self(ctx)
    }
}

/// Named handlers, looked up by `Activity::handler`.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn ActivityHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: impl ActivityHandler + 'static) {
        self.handlers.insert(name.into(), Arc::new(handler));
    }

    /// Register a closure. Its signature is taken from the bound, so
    /// `|ctx| { .. }` needs no annotations.
    pub fn register_fn<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&mut ActivityContext<'_>) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.register(name, f);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ActivityHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("HandlerRegistry").field("handlers", &names).finish()
    }
}
