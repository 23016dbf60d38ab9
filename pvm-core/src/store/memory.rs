use super::*;
use anyhow::anyhow;
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Clone, Default)]
struct Tables {
    executions: HashMap<ExecutionId, Execution>,
    variables: HashMap<VariableId, VariableInstance>,
    jobs: HashMap<JobId, Job>,
}

impl Tables {
    fn revision_of(&self, key: EntityKey) -> Option<Revision> {
        match key {
            EntityKey::Execution(id) => self.executions.get(&id).map(|e| e.revision),
            EntityKey::Variable(id) => self.variables.get(&id).map(|v| v.revision),
            EntityKey::Job(id) => self.jobs.get(&id).map(|j| j.revision),
        }
    }

    fn put(&mut self, entity: Entity) {
        match entity {
            Entity::Execution(e) => {
                self.executions.insert(e.id, e);
            }
            Entity::Variable(v) => {
                self.variables.insert(v.id, v);
            }
            Entity::Job(j) => {
                self.jobs.insert(j.id, j);
            }
        }
    }

    fn remove(&mut self, key: EntityKey) {
        match key {
            EntityKey::Execution(id) => {
                self.executions.remove(&id);
            }
            EntityKey::Variable(id) => {
                self.variables.remove(&id);
            }
            EntityKey::Job(id) => {
                self.jobs.remove(&id);
            }
        }
    }

    fn apply(&mut self, change: Change) -> Result<(), StoreError> {
        match change {
            Change::Insert(entity) => {
                let key = entity.key();
                if self.revision_of(key).is_some() {
                    return Err(key.conflict());
                }
                // (name, owner) is unique.
                if let Entity::Variable(v) = &entity {
                    let taken = self.variables.values().any(|other| {
                        other.owner_execution_id == v.owner_execution_id && other.name == v.name
                    });
                    if taken {
                        return Err(key.conflict());
                    }
                }
                self.put(entity.with_revision(1));
            }
            Change::Update(entity) => {
                let key = entity.key();
                let expected = entity.revision();
                if self.revision_of(key) != Some(expected) {
                    return Err(key.conflict());
                }
                self.put(entity.with_revision(expected + 1));
            }
            Change::Delete { key, revision } => {
                if self.revision_of(key) != Some(revision) {
                    return Err(key.conflict());
                }
                self.remove(key);
            }
        }
        Ok(())
    }
}

/// In-process store. One lock guards all tables; a flush is applied to a
/// staged copy and swapped in only if every change succeeds.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Tables>, StoreError> {
        self.inner
            .read()
            .map_err(|e| StoreError::Backend(anyhow!("Lock: {}", e)))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Tables>, StoreError> {
        self.inner
            .write()
            .map_err(|e| StoreError::Backend(anyhow!("Lock: {}", e)))
    }
}

#[async_trait]
impl PersistenceSession for MemoryStore {
    async fn load(&self, key: EntityKey) -> Result<Option<Entity>, StoreError> {
        let tables = self.read()?;
        Ok(match key {
            EntityKey::Execution(id) => tables.executions.get(&id).cloned().map(Entity::Execution),
            EntityKey::Variable(id) => tables.variables.get(&id).cloned().map(Entity::Variable),
            EntityKey::Job(id) => tables.jobs.get(&id).cloned().map(Entity::Job),
        })
    }

    async fn load_process_instance(
        &self,
        id: ProcessInstanceId,
    ) -> Result<Option<InstanceRecord>, StoreError> {
        let tables = self.read()?;
        let executions: Vec<Execution> = tables
            .executions
            .values()
            .filter(|e| e.process_instance_id == id)
            .cloned()
            .collect();
        if executions.is_empty() {
            return Ok(None);
        }
        Ok(Some(InstanceRecord {
            executions,
            variables: tables
                .variables
                .values()
                .filter(|v| v.process_instance_id == id)
                .cloned()
                .collect(),
            jobs: tables
                .jobs
                .values()
                .filter(|j| j.process_instance_id == id)
                .cloned()
                .collect(),
        }))
    }

    async fn list_jobs(&self, query: &JobQuery) -> Result<Vec<Job>, StoreError> {
        let tables = self.read()?;
        let mut jobs: Vec<Job> = tables
            .jobs
            .values()
            .filter(|j| query.process_instance_id.is_none_or(|p| j.process_instance_id == p))
            .filter(|j| query.state.is_none_or(|s| j.state == s))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.due_date, j.id));
        Ok(jobs)
    }

    async fn flush(&self, changes: ChangeSet) -> Result<(), StoreError> {
        if changes.is_empty() {
            return Ok(());
        }
        let mut tables = self.write()?;
        let mut staged = tables.clone();
        for change in changes.ordered() {
            staged.apply(change)?;
        }
        *tables = staged;
        Ok(())
    }

    async fn query_due_jobs(&self, now: Timestamp, limit: usize) -> Result<Vec<Job>, StoreError> {
        let tables = self.read()?;
        let mut due: Vec<Job> = tables
            .jobs
            .values()
            .filter(|j| j.is_eligible(now))
            .cloned()
            .collect();
        due.sort_by_key(|j| (j.due_date, j.id));
        due.truncate(limit);
        Ok(due)
    }

    async fn try_acquire_job(
        &self,
        id: JobId,
        expected_revision: Revision,
        owner: &str,
        expiry: Timestamp,
        now: Timestamp,
    ) -> Result<bool, StoreError> {
        let mut tables = self.write()?;
        let Some(job) = tables.jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.revision != expected_revision || !job.is_eligible(now) {
            return Ok(false);
        }
        job.lock_owner = Some(owner.to_string());
        job.lock_expiration_time = Some(expiry);
        job.revision += 1;
        Ok(true)
    }
}
