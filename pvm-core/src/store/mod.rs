//! Persistence contract.
//!
//! The engine works exclusively through [`PersistenceSession`]. Every write
//! is revision checked: updates and deletes name the revision they read, and
//! a mismatch is a [`StoreError::Conflict`]. A [`ChangeSet`] is applied all
//! or nothing.

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PgStore;

use async_trait::async_trait;

use crate::error::{EntityKind, StoreError};
use crate::execution::{Execution, InstanceRecord};
use crate::job::{Job, JobState};
use crate::types::{ExecutionId, JobId, ProcessInstanceId, Revision, Timestamp, VariableId};
use crate::variables::VariableInstance;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKey {
    Execution(ExecutionId),
    Variable(VariableId),
    Job(JobId),
}

impl EntityKey {
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Execution(_) => EntityKind::Execution,
            Self::Variable(_) => EntityKind::Variable,
            Self::Job(_) => EntityKind::Job,
        }
    }

    pub(crate) fn conflict(&self) -> StoreError {
        let id = match self {
            Self::Execution(id) | Self::Variable(id) | Self::Job(id) => id.to_string(),
        };
        StoreError::Conflict {
            entity: self.kind(),
            id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Entity {
    Execution(Execution),
    Variable(VariableInstance),
    Job(Job),
}

impl Entity {
    pub fn key(&self) -> EntityKey {
        match self {
            Self::Execution(e) => EntityKey::Execution(e.id),
            Self::Variable(v) => EntityKey::Variable(v.id),
            Self::Job(j) => EntityKey::Job(j.id),
        }
    }

    pub fn revision(&self) -> Revision {
        match self {
            Self::Execution(e) => e.revision,
            Self::Variable(v) => v.revision,
            Self::Job(j) => j.revision,
        }
    }

    /// Copy with the revision the store will persist for it.
    pub(crate) fn with_revision(mut self, revision: Revision) -> Self {
        match &mut self {
            Self::Execution(e) => e.revision = revision,
            Self::Variable(v) => v.revision = revision,
            Self::Job(j) => j.revision = revision,
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// New row; stored at revision 1.
    Insert(Entity),
    /// Row must still be at `entity.revision`; stored at `revision + 1`.
    Update(Entity),
    /// Row must still be at `revision`.
    Delete { key: EntityKey, revision: Revision },
}

/// One transaction's worth of writes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub changes: Vec<Change>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn push(&mut self, change: Change) {
        self.changes.push(change);
    }

    /// Deletes, then updates, then inserts, so a re-created variable name
    /// never collides with the row it replaces.
    pub fn ordered(mut self) -> Vec<Change> {
        self.changes.sort_by_key(|c| match c {
            Change::Delete { .. } => 0,
            Change::Update(_) => 1,
            Change::Insert(_) => 2,
        });
        self.changes
    }
}

/// Filter for [`PersistenceSession::list_jobs`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobQuery {
    pub process_instance_id: Option<ProcessInstanceId>,
    pub state: Option<JobState>,
}

#[async_trait]
pub trait PersistenceSession: Send + Sync {
    async fn load(&self, key: EntityKey) -> Result<Option<Entity>, StoreError>;

    /// Every execution, variable and job of one instance. `None` once the
    /// instance has ended or never existed.
    async fn load_process_instance(
        &self,
        id: ProcessInstanceId,
    ) -> Result<Option<InstanceRecord>, StoreError>;

    async fn list_jobs(&self, query: &JobQuery) -> Result<Vec<Job>, StoreError>;

    /// Apply every change atomically, or none of them.
    async fn flush(&self, changes: ChangeSet) -> Result<(), StoreError>;

    /// Jobs satisfying the eligibility rule at `now`, oldest due first.
    async fn query_due_jobs(&self, now: Timestamp, limit: usize) -> Result<Vec<Job>, StoreError>;

    /// Compare-and-set the lock of a job still at `expected_revision` and
    /// still eligible at `now`. `false` means another node got there first.
    async fn try_acquire_job(
        &self,
        id: JobId,
        expected_revision: Revision,
        owner: &str,
        expiry: Timestamp,
        now: Timestamp,
    ) -> Result<bool, StoreError>;

    /// Insert a new entity (revision 0) or update an existing one.
    async fn save(&self, entity: Entity) -> Result<(), StoreError> {
        let change = if entity.revision() == 0 {
            Change::Insert(entity)
        } else {
            Change::Update(entity)
        };
        self.flush(ChangeSet {
            changes: vec![change],
        })
        .await
    }

    async fn delete(&self, key: EntityKey, revision: Revision) -> Result<(), StoreError> {
        self.flush(ChangeSet {
            changes: vec![Change::Delete { key, revision }],
        })
        .await
    }
}
