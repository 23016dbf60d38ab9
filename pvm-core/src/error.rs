use std::fmt;
use thiserror::Error;

/// Persisted entity kinds, used in conflict and not-found reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Execution,
    Variable,
    Job,
    ProcessInstance,
    ProcessDefinition,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Execution => "execution",
            Self::Variable => "variable",
            Self::Job => "job",
            Self::ProcessInstance => "process instance",
            Self::ProcessDefinition => "process definition",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by a [`crate::store::PersistenceSession`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// Stale revision, missing row on update/delete, or duplicate insert.
    #[error("stale {entity} {id}")]
    Conflict { entity: EntityKind, id: String },

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Engine-level error taxonomy.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Transient: another command committed first. Retried by the retry
    /// interceptor, surfaced once its budget is spent.
    #[error("optimistic lock conflict on {entity} {id}")]
    OptimisticLockConflict { entity: EntityKind, id: String },

    /// Modelled business error with no boundary handler up to the root.
    #[error("unhandled business fault '{error_code}' raised in activity '{activity_id}'")]
    BusinessFault {
        error_code: String,
        activity_id: String,
    },

    /// An activity handler or job body failed with a technical error.
    #[error("handler failed in activity '{activity_id}': {message}")]
    HandlerExecution { activity_id: String, message: String },

    /// Misuse of the tree or the graph: signalling a running execution,
    /// joining without a fork, a decision with no way out.
    #[error("structural violation: {0}")]
    StructuralViolation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: String },

    #[error("invalid process definition: {0}")]
    InvalidDefinition(String),

    #[error("expression '{expression}' failed: {message}")]
    Expression { expression: String, message: String },

    #[error("internal: {0}")]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// Only optimistic-lock conflicts are worth re-running a command for.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::OptimisticLockConflict { .. })
    }

    pub fn not_found(kind: EntityKind, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn structural(message: impl Into<String>) -> Self {
        Self::StructuralViolation(message.into())
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { entity, id } => Self::OptimisticLockConflict { entity, id },
            StoreError::Backend(e) => Self::Internal(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_conflicts_are_retryable() {
        let conflict = EngineError::OptimisticLockConflict {
            entity: EntityKind::Execution,
            id: "e1".into(),
        };
        assert!(conflict.is_retryable());
        assert!(!EngineError::structural("x").is_retryable());
        assert!(!EngineError::BusinessFault {
            error_code: "E1".into(),
            activity_id: "a".into()
        }
        .is_retryable());
    }

    #[test]
    fn store_conflict_maps_to_lock_conflict() {
        let err: EngineError = StoreError::Conflict {
            entity: EntityKind::Job,
            id: "j1".into(),
        }
        .into();
        assert!(matches!(
            err,
            EngineError::OptimisticLockConflict {
                entity: EntityKind::Job,
                ..
            }
        ));
    }

    #[test]
    fn display_messages() {
        assert_eq!(
            EngineError::not_found(EntityKind::Variable, "amount").to_string(),
            "variable not found: amount"
        );
        assert_eq!(
            EngineError::structural("join without fork").to_string(),
            "structural violation: join without fork"
        );
    }
}
