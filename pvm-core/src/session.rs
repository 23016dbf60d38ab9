//! Unit of work over a [`PersistenceSession`].
//!
//! Instances are loaded whole and remembered as they were read. On commit
//! the current trees are diffed against those snapshots and the resulting
//! [`ChangeSet`] is flushed in one store transaction, revision checked.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use crate::error::{EngineError, EntityKind};
use crate::execution::{ExecutionTree, InstanceRecord};
use crate::job::Job;
use crate::store::{Change, ChangeSet, Entity, EntityKey, PersistenceSession};
use crate::types::{JobId, ProcessInstanceId};

struct Tracked {
    snapshot: InstanceRecord,
    tree: ExecutionTree,
}

pub struct DbSession {
    store: Arc<dyn PersistenceSession>,
    instances: BTreeMap<ProcessInstanceId, Tracked>,
}

impl DbSession {
    pub fn new(store: Arc<dyn PersistenceSession>) -> Self {
        Self {
            store,
            instances: BTreeMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn PersistenceSession> {
        &self.store
    }

    /// The tree of instance `id`, loading it on first access.
    pub async fn instance(&mut self, id: ProcessInstanceId) -> Result<&mut ExecutionTree, EngineError> {
        if !self.instances.contains_key(&id) {
            let record = self
                .store
                .load_process_instance(id)
                .await?
                .ok_or_else(|| EngineError::not_found(EntityKind::ProcessInstance, id))?;
            let tree = ExecutionTree::from_record(id, record.clone())?;
            self.instances.insert(
                id,
                Tracked {
                    snapshot: record,
                    tree,
                },
            );
        }
        self.instances
            .get_mut(&id)
            .map(|t| &mut t.tree)
            .ok_or_else(|| EngineError::not_found(EntityKind::ProcessInstance, id))
    }

    /// Track a tree that does not exist in the store yet.
    pub fn insert_instance(&mut self, tree: ExecutionTree) -> &mut ExecutionTree {
        let id = tree.process_instance_id();
        let tracked = self.instances.entry(id).or_insert(Tracked {
            snapshot: InstanceRecord::default(),
            tree,
        });
        &mut tracked.tree
    }

    /// Read a job straight from the store, bypassing the instance cache.
    pub async fn load_job(&self, id: JobId) -> Result<Option<Job>, EngineError> {
        match self.store.load(EntityKey::Job(id)).await? {
            Some(Entity::Job(job)) => Ok(Some(job)),
            _ => Ok(None),
        }
    }

    /// Pending writes for every tracked instance.
    pub fn change_set(&self) -> ChangeSet {
        let mut changes = ChangeSet::default();
        for tracked in self.instances.values() {
            diff(&tracked.snapshot, &tracked.tree, &mut changes);
        }
        changes
    }

    /// Flush all pending writes atomically. The session is empty afterwards.
    pub async fn commit(&mut self) -> Result<usize, EngineError> {
        let changes = self.change_set();
        let n = changes.len();
        self.store.flush(changes).await?;
        self.instances.clear();
        Ok(n)
    }

    /// Forget every loaded instance and its pending writes.
    pub fn rollback(&mut self) {
        self.instances.clear();
    }
}

fn entities(record: InstanceRecord) -> Vec<Entity> {
    let mut out = Vec::new();
    out.extend(record.executions.into_iter().map(Entity::Execution));
    out.extend(record.variables.into_iter().map(Entity::Variable));
    out.extend(record.jobs.into_iter().map(Entity::Job));
    out
}

fn diff(snapshot: &InstanceRecord, tree: &ExecutionTree, out: &mut ChangeSet) {
    let before: HashMap<EntityKey, Entity> = entities(snapshot.clone())
        .into_iter()
        .map(|e| (e.key(), e))
        .collect();
    let mut seen = HashSet::new();

    for entity in entities(tree.to_record()) {
        let key = entity.key();
        seen.insert(key);
        let touched = matches!(key, EntityKey::Execution(id) if tree.is_touched(id));
        match before.get(&key) {
            None => out.push(Change::Insert(entity)),
            Some(prev) if *prev != entity || touched => out.push(Change::Update(entity)),
            Some(_) => {}
        }
    }

    for (key, prev) in &before {
        if !seen.contains(key) {
            out.push(Change::Delete {
                key: *key,
                revision: prev.revision(),
            });
        }
    }
}
