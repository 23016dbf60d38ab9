//! Command execution.
//!
//! Every state change goes through [`CommandExecutor::execute`]. A
//! [`Command`] is a plain data object; the executor runs it through an
//! ordered slice of [`Interceptor`]s composed once at engine build time:
//!
//! ```text
//! LogInterceptor -> (custom) -> RetryInterceptor -> ContextInterceptor -> TransactionInterceptor -> command
//! ```
//!
//! One command execution is one transaction. A retried command re-runs its
//! whole body against freshly loaded state.

mod builtin;
mod context;
mod interceptor;

pub use builtin::{
    CancelProcessInstance, DefinitionRef, GetProcessInstance, GetVariables, ListJobs,
    ProcessInstanceView, SetJobRetries, SetVariables, SignalExecution, StartProcessInstance,
};
pub use context::CommandContext;
pub use interceptor::{
    ContextInterceptor, LogInterceptor, RetryInterceptor, TransactionInterceptor,
};

use anyhow::anyhow;
use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;

use crate::engine::EngineServices;
use crate::error::EngineError;

/// Type-erased command result, as it travels through the chain.
pub type AnyOutput = Box<dyn Any + Send>;

#[async_trait]
pub trait Command: Send + Sync {
    type Output: Send + 'static;

    /// Short name for spans and logs.
    fn name(&self) -> &'static str;

    /// Body of the command. May run more than once per `execute` call.
    async fn execute(&self, ctx: &mut CommandContext) -> Result<Self::Output, EngineError>;
}

/// Object-safe view of a [`Command`], used by interceptors.
#[async_trait]
pub trait ErasedCommand: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute_erased(&self, ctx: &mut CommandContext) -> Result<AnyOutput, EngineError>;
}

#[async_trait]
impl<C: Command> ErasedCommand for C {
    fn name(&self) -> &'static str {
        Command::name(self)
    }

    async fn execute_erased(&self, ctx: &mut CommandContext) -> Result<AnyOutput, EngineError> {
        let out = self.execute(ctx).await?;
        Ok(Box::new(out))
    }
}

/// One link of the chain. Receives the remainder of the chain as `next`.
///
/// `ctx` is `None` until the [`ContextInterceptor`] has run.
#[async_trait]
pub trait Interceptor: Send + Sync {
    async fn intercept(
        &self,
        command: &dyn ErasedCommand,
        ctx: Option<&mut CommandContext>,
        next: Next<'_>,
    ) -> Result<AnyOutput, EngineError>;
}

/// The rest of the chain after the current interceptor.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    chain: &'a [Arc<dyn Interceptor>],
    services: &'a Arc<EngineServices>,
}

impl<'a> Next<'a> {
    pub fn services(&self) -> &'a Arc<EngineServices> {
        self.services
    }

    /// Hand the command to the next interceptor, or run it when the chain is
    /// exhausted.
    pub async fn proceed(
        self,
        command: &dyn ErasedCommand,
        ctx: Option<&mut CommandContext>,
    ) -> Result<AnyOutput, EngineError> {
        match self.chain.split_first() {
            Some((head, rest)) => {
                let next = Next {
                    chain: rest,
                    services: self.services,
                };
                head.intercept(command, ctx, next).await
            }
            None => match ctx {
                Some(ctx) => command.execute_erased(ctx).await,
                None => Err(EngineError::Internal(anyhow!(
                    "command '{}' reached the end of the chain without a context",
                    command.name()
                ))),
            },
        }
    }
}

/// The composed chain plus the services commands run against.
pub struct CommandExecutor {
    chain: Vec<Arc<dyn Interceptor>>,
    services: Arc<EngineServices>,
}

impl CommandExecutor {
    pub fn new(chain: Vec<Arc<dyn Interceptor>>, services: Arc<EngineServices>) -> Self {
        Self { chain, services }
    }

    /// `[Log, custom.., Retry, Context, Transaction]`.
    pub fn default_chain(
        services: Arc<EngineServices>,
        custom: Vec<Arc<dyn Interceptor>>,
    ) -> Self {
        let retries = services.config.command_retries;
        let mut chain: Vec<Arc<dyn Interceptor>> = vec![Arc::new(LogInterceptor)];
        chain.extend(custom);
        chain.push(Arc::new(RetryInterceptor::new(retries)));
        chain.push(Arc::new(ContextInterceptor));
        chain.push(Arc::new(TransactionInterceptor));
        Self::new(chain, services)
    }

    pub fn services(&self) -> &Arc<EngineServices> {
        &self.services
    }

    pub async fn execute<C: Command>(&self, command: &C) -> Result<C::Output, EngineError> {
        let next = Next {
            chain: &self.chain,
            services: &self.services,
        };
        let out = next.proceed(command, None).await?;
        out.downcast::<C::Output>().map(|b| *b).map_err(|_| {
            EngineError::Internal(anyhow!(
                "command '{}' produced an unexpected output type",
                Command::name(command)
            ))
        })
    }
}
