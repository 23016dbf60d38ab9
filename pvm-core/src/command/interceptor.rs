//! Built-in interceptors.

use anyhow::anyhow;
use async_trait::async_trait;
use std::time::Instant;
use tracing::Instrument;

use super::{AnyOutput, CommandContext, ErasedCommand, Interceptor, Next};
use crate::error::EngineError;

/// Opens a `command` span and logs how the command ended.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogInterceptor;

#[async_trait]
impl Interceptor for LogInterceptor {
    async fn intercept(
        &self,
        command: &dyn ErasedCommand,
        ctx: Option<&mut CommandContext>,
        next: Next<'_>,
    ) -> Result<AnyOutput, EngineError> {
        let span = tracing::debug_span!("command", name = command.name());
        async move {
            let started = Instant::now();
            let result = next.proceed(command, ctx).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;
            match &result {
                Ok(_) => tracing::debug!(elapsed_ms, "command completed"),
                Err(e) => tracing::debug!(elapsed_ms, error = %e, "command failed"),
            }
            result
        }
        .instrument(span)
        .await
    }
}

/// Re-runs the inner chain on optimistic-lock conflicts, without backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryInterceptor {
    retries: u32,
}

impl RetryInterceptor {
    /// `retries` extra attempts after the first.
    pub fn new(retries: u32) -> Self {
        Self { retries }
    }
}

#[async_trait]
impl Interceptor for RetryInterceptor {
    async fn intercept(
        &self,
        command: &dyn ErasedCommand,
        mut ctx: Option<&mut CommandContext>,
        next: Next<'_>,
    ) -> Result<AnyOutput, EngineError> {
        let mut attempt = 0u32;
        loop {
            match next.proceed(command, ctx.as_deref_mut()).await {
                Err(e) if e.is_retryable() && attempt < self.retries => {
                    attempt += 1;
                    tracing::warn!(
                        command = command.name(),
                        attempt,
                        max_retries = self.retries,
                        error = %e,
                        "conflict, retrying command"
                    );
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(
                        command = command.name(),
                        attempts = attempt + 1,
                        error = %e,
                        "retries exhausted"
                    );
                    return Err(e);
                }
                other => return other,
            }
        }
    }
}

/// Allocates the [`CommandContext`] for the rest of the chain. A context
/// that already exists is passed through unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct ContextInterceptor;

#[async_trait]
impl Interceptor for ContextInterceptor {
    async fn intercept(
        &self,
        command: &dyn ErasedCommand,
        ctx: Option<&mut CommandContext>,
        next: Next<'_>,
    ) -> Result<AnyOutput, EngineError> {
        match ctx {
            Some(ctx) => next.proceed(command, Some(ctx)).await,
            None => {
                let mut ctx = CommandContext::new(next.services().clone());
                next.proceed(command, Some(&mut ctx)).await
            }
        }
    }
}

/// Commits the session when the command returns `Ok`, discards it
/// otherwise. Buffered events reach listeners only after a commit.
#[derive(Debug, Default, Clone, Copy)]
pub struct TransactionInterceptor;

#[async_trait]
impl Interceptor for TransactionInterceptor {
    async fn intercept(
        &self,
        command: &dyn ErasedCommand,
        ctx: Option<&mut CommandContext>,
        next: Next<'_>,
    ) -> Result<AnyOutput, EngineError> {
        let ctx = ctx.ok_or_else(|| {
            EngineError::Internal(anyhow!(
                "transaction interceptor needs a command context (command '{}')",
                command.name()
            ))
        })?;
        // A context reused across attempts must not carry a failed
        // attempt's state.
        ctx.session.rollback();
        ctx.take_events();

        let result = next.proceed(command, Some(&mut *ctx)).await;
        let output = match result {
            Ok(output) => output,
            Err(e) => {
                ctx.session.rollback();
                ctx.take_events();
                return Err(e);
            }
        };

        if let Err(e) = ctx.session.commit().await {
            ctx.session.rollback();
            ctx.take_events();
            return Err(e);
        }

        let events = ctx.take_events();
        let listeners = &next.services().listeners;
        for record in &events {
            for listener in listeners {
                listener.on_event(record);
            }
        }
        Ok(output)
    }
}
