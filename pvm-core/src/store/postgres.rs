//! Postgres-backed [`PersistenceSession`].
//!
//! One SQL transaction per flush. Updates and deletes carry
//! `WHERE revision = $n`; zero rows affected is a conflict. Job acquisition
//! is a single conditional `UPDATE`.

use super::*;
use anyhow::{anyhow, Context};
use sqlx::postgres::{PgConnection, PgPool, PgRow};
use sqlx::{Postgres, Row};
use std::str::FromStr;

const SCHEMA: &str = include_str!("../../migrations/0001_pvm_schema.sql");

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .context("Failed to connect to Postgres")?;
        Ok(Self::new(pool))
    }

    /// Create the runtime tables if they do not exist.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .context("Failed to apply PVM schema")?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn backend(err: sqlx::Error, what: &str) -> StoreError {
    StoreError::Backend(anyhow::Error::new(err).context(format!("Postgres: {what}")))
}

fn col<'r, T>(row: &'r PgRow, name: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(name)
        .map_err(|e| backend(e, &format!("column {name}")))
}

fn to_u32(value: i64, what: &str) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Backend(anyhow!("{what} out of range: {value}")))
}

fn table(key: EntityKey) -> (&'static str, uuid::Uuid) {
    match key {
        EntityKey::Execution(id) => ("pvm_execution", id),
        EntityKey::Variable(id) => ("pvm_variable", id),
        EntityKey::Job(id) => ("pvm_job", id),
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn execution_from_row(row: &PgRow) -> Result<Execution, StoreError> {
    Ok(Execution {
        id: col(row, "id")?,
        process_instance_id: col(row, "process_instance_id")?,
        process_definition_id: col(row, "process_definition_id")?,
        parent_id: col(row, "parent_id")?,
        activity_id: col(row, "activity_id")?,
        is_active: col(row, "is_active")?,
        is_concurrent: col(row, "is_concurrent")?,
        is_scope: col(row, "is_scope")?,
        business_key: col(row, "business_key")?,
        revision: to_u32(col(row, "revision")?, "revision")?,
    })
}

fn variable_from_row(row: &PgRow) -> Result<VariableInstance, StoreError> {
    let type_tag: String = col(row, "type_tag")?;
    Ok(VariableInstance {
        id: col(row, "id")?,
        name: col(row, "name")?,
        value: col(row, "value")?,
        type_tag: type_tag.parse().map_err(StoreError::Backend)?,
        owner_execution_id: col(row, "owner_execution_id")?,
        process_instance_id: col(row, "process_instance_id")?,
        revision: to_u32(col(row, "revision")?, "revision")?,
    })
}

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    let handler_type: String = col(row, "handler_type")?;
    let state: String = col(row, "state")?;
    Ok(Job {
        id: col(row, "id")?,
        process_instance_id: col(row, "process_instance_id")?,
        execution_id: col(row, "execution_id")?,
        due_date: col(row, "due_date")?,
        handler_type: crate::job::JobHandlerType::from_str(&handler_type)
            .map_err(StoreError::Backend)?,
        handler_config: col(row, "handler_config")?,
        lock_owner: col(row, "lock_owner")?,
        lock_expiration_time: col(row, "lock_expiration_time")?,
        retries_left: to_u32(col(row, "retries_left")?, "retries_left")?,
        failures: to_u32(col(row, "failures")?, "failures")?,
        exception_message: col(row, "exception_message")?,
        state: JobState::from_str(&state).map_err(StoreError::Backend)?,
        revision: to_u32(col(row, "revision")?, "revision")?,
    })
}

// ---------------------------------------------------------------------------
// Writes
// ---------------------------------------------------------------------------

const INSERT_EXECUTION: &str = r#"
    INSERT INTO pvm_execution
        (id, process_instance_id, process_definition_id, parent_id, activity_id,
         is_active, is_concurrent, is_scope, business_key, revision)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
"#;

const UPDATE_EXECUTION: &str = r#"
    UPDATE pvm_execution
       SET process_instance_id = $2, process_definition_id = $3, parent_id = $4,
           activity_id = $5, is_active = $6, is_concurrent = $7, is_scope = $8,
           business_key = $9, revision = $10
     WHERE id = $1 AND revision = $11
"#;

const INSERT_VARIABLE: &str = r#"
    INSERT INTO pvm_variable
        (id, name, value, type_tag, owner_execution_id, process_instance_id, revision)
    VALUES ($1, $2, $3, $4, $5, $6, $7)
"#;

const UPDATE_VARIABLE: &str = r#"
    UPDATE pvm_variable
       SET name = $2, value = $3, type_tag = $4, owner_execution_id = $5,
           process_instance_id = $6, revision = $7
     WHERE id = $1 AND revision = $8
"#;

const INSERT_JOB: &str = r#"
    INSERT INTO pvm_job
        (id, process_instance_id, execution_id, due_date, handler_type, handler_config,
         lock_owner, lock_expiration_time, retries_left, exception_message, state, failures,
         revision)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
"#;

const UPDATE_JOB: &str = r#"
    UPDATE pvm_job
       SET process_instance_id = $2, execution_id = $3, due_date = $4, handler_type = $5,
           handler_config = $6, lock_owner = $7, lock_expiration_time = $8,
           retries_left = $9, exception_message = $10, state = $11, failures = $12,
           revision = $13
     WHERE id = $1 AND revision = $14
"#;

/// Insert when `expected` is `None`, otherwise update the row still at
/// `expected`. Returns rows affected.
async fn write(
    conn: &mut PgConnection,
    entity: &Entity,
    expected: Option<Revision>,
) -> Result<u64, sqlx::Error> {
    let next = i64::from(expected.map_or(1, |r| r + 1));
    let query = match entity {
        Entity::Execution(e) => {
            let sql = if expected.is_some() { UPDATE_EXECUTION } else { INSERT_EXECUTION };
            sqlx::query(sql)
                .bind(e.id)
                .bind(e.process_instance_id)
                .bind(&e.process_definition_id)
                .bind(e.parent_id)
                .bind(&e.activity_id)
                .bind(e.is_active)
                .bind(e.is_concurrent)
                .bind(e.is_scope)
                .bind(&e.business_key)
                .bind(next)
        }
        Entity::Variable(v) => {
            let sql = if expected.is_some() { UPDATE_VARIABLE } else { INSERT_VARIABLE };
            sqlx::query(sql)
                .bind(v.id)
                .bind(&v.name)
                .bind(&v.value)
                .bind(v.type_tag.as_str())
                .bind(v.owner_execution_id)
                .bind(v.process_instance_id)
                .bind(next)
        }
        Entity::Job(j) => {
            let sql = if expected.is_some() { UPDATE_JOB } else { INSERT_JOB };
            sqlx::query(sql)
                .bind(j.id)
                .bind(j.process_instance_id)
                .bind(j.execution_id)
                .bind(j.due_date)
                .bind(j.handler_type.as_str())
                .bind(&j.handler_config)
                .bind(&j.lock_owner)
                .bind(j.lock_expiration_time)
                .bind(i64::from(j.retries_left))
                .bind(&j.exception_message)
                .bind(j.state.as_str())
                .bind(i64::from(j.failures))
                .bind(next)
        }
    };
    let query = match expected {
        Some(r) => query.bind(i64::from(r)),
        None => query,
    };
    Ok(query.execute(conn).await?.rows_affected())
}

async fn delete(conn: &mut PgConnection, key: EntityKey, revision: Revision) -> Result<u64, sqlx::Error> {
    let (table, id) = table(key);
    let sql = format!("DELETE FROM {table} WHERE id = $1 AND revision = $2");
    Ok(sqlx::query(&sql)
        .bind(id)
        .bind(i64::from(revision))
        .execute(conn)
        .await?
        .rows_affected())
}

async fn apply(conn: &mut PgConnection, change: Change) -> Result<(), StoreError> {
    let (key, result) = match &change {
        Change::Insert(entity) => (entity.key(), write(conn, entity, None).await),
        Change::Update(entity) => (entity.key(), write(conn, entity, Some(entity.revision())).await),
        Change::Delete { key, revision } => (*key, delete(conn, *key, *revision).await),
    };
    match result {
        Ok(0) => Err(key.conflict()),
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(key.conflict()),
        Err(e) => Err(backend(e, "flush")),
    }
}

// ---------------------------------------------------------------------------
// PersistenceSession
// ---------------------------------------------------------------------------

const DUE_JOBS: &str = r#"
    SELECT * FROM pvm_job
     WHERE state = 'active'
       AND due_date <= $1
       AND (lock_owner IS NULL OR lock_expiration_time < $1)
     ORDER BY due_date, id
     LIMIT $2
"#;

const ACQUIRE_JOB: &str = r#"
    UPDATE pvm_job
       SET lock_owner = $2, lock_expiration_time = $3, revision = revision + 1
     WHERE id = $1
       AND revision = $4
       AND state = 'active'
       AND due_date <= $5
       AND (lock_owner IS NULL OR lock_expiration_time < $5)
"#;

#[async_trait]
impl PersistenceSession for PgStore {
    async fn load(&self, key: EntityKey) -> Result<Option<Entity>, StoreError> {
        let (table, id) = table(key);
        let sql = format!("SELECT * FROM {table} WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| backend(e, "load"))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let entity = match key {
            EntityKey::Execution(_) => Entity::Execution(execution_from_row(&row)?),
            EntityKey::Variable(_) => Entity::Variable(variable_from_row(&row)?),
            EntityKey::Job(_) => Entity::Job(job_from_row(&row)?),
        };
        Ok(Some(entity))
    }

    async fn load_process_instance(
        &self,
        id: ProcessInstanceId,
    ) -> Result<Option<InstanceRecord>, StoreError> {
        // One snapshot for all three tables.
        let mut tx = self.pool.begin().await.map_err(|e| backend(e, "begin"))?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(|e| backend(e, "set isolation"))?;

        let executions = sqlx::query("SELECT * FROM pvm_execution WHERE process_instance_id = $1")
            .bind(id)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| backend(e, "load executions"))?
            .iter()
            .map(execution_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        if executions.is_empty() {
            return Ok(None);
        }
        let variables = sqlx::query("SELECT * FROM pvm_variable WHERE process_instance_id = $1")
            .bind(id)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| backend(e, "load variables"))?
            .iter()
            .map(variable_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        let jobs = sqlx::query("SELECT * FROM pvm_job WHERE process_instance_id = $1")
            .bind(id)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| backend(e, "load jobs"))?
            .iter()
            .map(job_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        tx.commit().await.map_err(|e| backend(e, "commit"))?;

        Ok(Some(InstanceRecord {
            executions,
            variables,
            jobs,
        }))
    }

    async fn list_jobs(&self, query: &JobQuery) -> Result<Vec<Job>, StoreError> {
        sqlx::query(
            r#"
            SELECT * FROM pvm_job
             WHERE ($1::uuid IS NULL OR process_instance_id = $1)
               AND ($2::text IS NULL OR state = $2)
             ORDER BY due_date, id
            "#,
        )
        .bind(query.process_instance_id)
        .bind(query.state.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| backend(e, "list jobs"))?
        .iter()
        .map(job_from_row)
        .collect()
    }

    async fn flush(&self, changes: ChangeSet) -> Result<(), StoreError> {
        if changes.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(|e| backend(e, "begin"))?;
        for change in changes.ordered() {
            // Dropping `tx` on error rolls back.
            apply(&mut tx, change).await?;
        }
        tx.commit().await.map_err(|e| backend(e, "commit"))?;
        Ok(())
    }

    async fn query_due_jobs(&self, now: Timestamp, limit: usize) -> Result<Vec<Job>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        sqlx::query(DUE_JOBS)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| backend(e, "query due jobs"))?
            .iter()
            .map(job_from_row)
            .collect()
    }

    async fn try_acquire_job(
        &self,
        id: JobId,
        expected_revision: Revision,
        owner: &str,
        expiry: Timestamp,
        now: Timestamp,
    ) -> Result<bool, StoreError> {
        let rows = sqlx::query(ACQUIRE_JOB)
            .bind(id)
            .bind(owner)
            .bind(expiry)
            .bind(i64::from(expected_revision))
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| backend(e, "acquire job"))?
            .rows_affected();
        Ok(rows == 1)
    }
}
