use anyhow::anyhow;
use std::sync::Arc;

use crate::engine::EngineServices;
use crate::error::{EngineError, EntityKind};
use crate::events::{EventRecord, RuntimeEvent};
use crate::pvm::Pvm;
use crate::session::DbSession;
use crate::store::{Entity, EntityKey};
use crate::types::{ExecutionId, ProcessInstanceId, Timestamp};

/// Per-call state of one command execution, passed explicitly down the
/// chain and into the command body.
pub struct CommandContext {
    pub session: DbSession,
    services: Arc<EngineServices>,
    events: Vec<EventRecord>,
    now: Timestamp,
}

impl CommandContext {
    pub fn new(services: Arc<EngineServices>) -> Self {
        Self {
            session: DbSession::new(services.store.clone()),
            now: services.clock.now(),
            services,
            events: Vec::new(),
        }
    }

    pub fn services(&self) -> &EngineServices {
        &self.services
    }

    /// Clock reading taken when the context was created. One command sees
    /// one instant.
    pub fn now(&self) -> Timestamp {
        self.now
    }

    /// Buffer events for dispatch after commit.
    pub fn record(&mut self, process_instance_id: ProcessInstanceId, events: Vec<RuntimeEvent>) {
        let now = self.now;
        self.events
            .extend(events.into_iter().map(|event| EventRecord {
                process_instance_id,
                timestamp: now,
                event,
            }));
    }

    pub fn take_events(&mut self) -> Vec<EventRecord> {
        std::mem::take(&mut self.events)
    }

    /// Process instance an execution belongs to, read from the store.
    pub async fn process_instance_of(
        &self,
        execution_id: ExecutionId,
    ) -> Result<ProcessInstanceId, EngineError> {
        match self
            .session
            .store()
            .load(EntityKey::Execution(execution_id))
            .await?
        {
            Some(Entity::Execution(e)) => Ok(e.process_instance_id),
            _ => Err(EngineError::not_found(EntityKind::Execution, execution_id)),
        }
    }

    /// Load instance `id`, run `f` on a [`Pvm`] over its tree with the
    /// graph the instance is pinned to, and buffer the events of the walk.
    pub async fn walk<T, F>(&mut self, id: ProcessInstanceId, f: F) -> Result<T, EngineError>
    where
        F: for<'p> FnOnce(&mut Pvm<'p>) -> Result<T, EngineError> + Send,
    {
        let services = self.services.clone();
        let now = self.now;
        let tree = self.session.instance(id).await?;
        let definition_id = tree
            .process_definition_id()
            .ok_or_else(|| EngineError::Internal(anyhow!("instance {id} has no root execution")))?
            .to_string();
        let definition = services.definitions.get(&definition_id)?;

        let mut pvm = Pvm::new(&definition.graph, tree, services.pvm_env(now));
        let out = f(&mut pvm)?;
        let events = pvm.into_events();
        self.record(id, events);
        Ok(out)
    }
}
