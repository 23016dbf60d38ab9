//! Condition and value expressions.
//!
//! The engine only needs a boolean for transition conditions, so the
//! evaluator is a pluggable collaborator. [`RhaiExpressionEvaluator`] runs
//! `${...}` bodies as rhai expressions over the visible variables.

use rhai::{Dynamic, Engine, Scope};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::EngineError;

pub type VariableView = BTreeMap<String, Value>;

pub trait ExpressionEvaluator: Send + Sync {
    fn evaluate(&self, expression: &str, variables: &VariableView) -> Result<Value, EngineError>;

    fn evaluate_condition(
        &self,
        expression: &str,
        variables: &VariableView,
    ) -> Result<bool, EngineError> {
        match self.evaluate(expression, variables)? {
            Value::Bool(b) => Ok(b),
            other => Err(EngineError::Expression {
                expression: expression.to_string(),
                message: format!("expected a boolean, got {other}"),
            }),
        }
    }
}

/// Rhai expressions:
/// `${amount > 1000 && !customer.vip || region == "EU"}`.
///
/// Only expressions are accepted, no statements. Each variable is pushed
/// into the rhai scope as a dynamic value, so JSON objects read as maps
/// (`customer.tier`). Unknown variables read as `()`.
pub struct RhaiExpressionEvaluator {
    engine: Engine,
}

impl RhaiExpressionEvaluator {
    pub fn new() -> Self {
        let mut engine = Engine::new();
        engine.set_max_operations(10_000);
        engine.set_max_expr_depths(64, 32);
        engine.on_var(|name, _index, context| {
            if context.scope().contains(name) {
                Ok(None)
            } else {
                Ok(Some(Dynamic::UNIT))
            }
        });
        Self { engine }
    }
}

impl Default for RhaiExpressionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpressionEvaluator for RhaiExpressionEvaluator {
    fn evaluate(&self, expression: &str, variables: &VariableView) -> Result<Value, EngineError> {
        let fail = |message: String| EngineError::Expression {
            expression: expression.to_string(),
            message,
        };

        let mut scope = Scope::new();
        for (name, value) in variables {
            let value = rhai::serde::to_dynamic(value)
                .map_err(|e| fail(format!("variable '{name}': {e}")))?;
            scope.push_dynamic(name.as_str(), value);
        }

        let result = self
            .engine
            .eval_expression_with_scope::<Dynamic>(&mut scope, strip_delimiters(expression))
            .map_err(|e| fail(e.to_string()))?;
        rhai::serde::from_dynamic::<Value>(&result).map_err(|e| fail(e.to_string()))
    }
}

fn strip_delimiters(expression: &str) -> &str {
    let trimmed = expression.trim();
    trimmed
        .strip_prefix("${")
        .and_then(|s| s.strip_suffix('}'))
        .unwrap_or(trimmed)
}
