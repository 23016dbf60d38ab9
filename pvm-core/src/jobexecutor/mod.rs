//! Job executor: polls for due jobs, locks them by compare-and-set, and
//! runs them on a bounded pool of workers.
//!
//! The poller runs on its own task and checks the shutdown channel between
//! cycles. Each worker runs one [`ExecuteJob`] command to completion; a
//! failure is recorded with [`RecordJobFailure`] in a second command, after
//! the failed attempt has been rolled back.

mod commands;

pub use commands::{ExecuteJob, JobFailureOutcome, JobOutcome, RecordJobFailure};

use anyhow::anyhow;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

use crate::config::JobExecutorConfig;
use crate::engine::ProcessEngine;
use crate::error::EngineError;
use crate::types::{add_duration, JobId};

/// What one poll cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollStats {
    /// Due jobs returned by the query.
    pub fetched: usize,
    /// Jobs locked by this node.
    pub acquired: usize,
    /// Jobs another node locked first.
    pub lost: usize,
    /// Jobs locked but not started for lack of a free worker.
    pub saturated: usize,
}

pub struct JobExecutor {
    engine: ProcessEngine,
    config: JobExecutorConfig,
    owner: String,
    permits: Arc<Semaphore>,
    workers: Mutex<JoinSet<()>>,
}

impl JobExecutor {
    /// Lock owner is the engine's node id.
    pub fn new(engine: ProcessEngine) -> Self {
        let owner = engine.config().node_id.clone();
        Self::with_owner(engine, owner)
    }

    pub fn with_owner(engine: ProcessEngine, owner: impl Into<String>) -> Self {
        let config = engine.config().job_executor.clone();
        let pool = config.pool_size.max(1);
        Self {
            engine,
            config,
            owner: owner.into(),
            permits: Arc::new(Semaphore::new(pool)),
            workers: Mutex::new(JoinSet::new()),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// One acquisition cycle: query due jobs, lock each by CAS, hand locked
    /// jobs to free workers.
    pub async fn poll_once(&self) -> Result<PollStats, EngineError> {
        let store = self.engine.store();
        let now = self.engine.now();
        let due = store.query_due_jobs(now, self.config.batch_size).await?;
        let expiry = add_duration(now, self.config.lock_duration());

        let mut stats = PollStats {
            fetched: due.len(),
            ..PollStats::default()
        };
        for job in due {
            let acquired = store
                .try_acquire_job(job.id, job.revision, &self.owner, expiry, now)
                .await?;
            if !acquired {
                stats.lost += 1;
                tracing::debug!(job_id = %job.id, "JobExecutor: lock lost to another node");
                continue;
            }
            stats.acquired += 1;

            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                stats.saturated += 1;
                tracing::warn!(
                    job_id = %job.id,
                    lock_expires = %expiry,
                    "JobExecutor: worker pool saturated, lock left to expire"
                );
                continue;
            };

            let engine = self.engine.clone();
            let owner = self.owner.clone();
            let job_id = job.id;
            let mut workers = self.workers.lock().await;
            workers.spawn(async move {
                run_job(&engine, job_id, &owner).await;
                drop(permit);
            });
            // Reap finished workers so the set does not grow unbounded.
            while workers.try_join_next().is_some() {}
        }
        Ok(stats)
    }

    /// Wait until every spawned worker has finished.
    pub async fn wait_idle(&self) -> Result<(), EngineError> {
        let pool = u32::try_from(self.config.pool_size.max(1))
            .map_err(|e| EngineError::Internal(anyhow!("pool size: {e}")))?;
        let _all = self
            .permits
            .acquire_many(pool)
            .await
            .map_err(|e| EngineError::Internal(anyhow!("JobExecutor: {e}")))?;
        let mut workers = self.workers.lock().await;
        while workers.try_join_next().is_some() {}
        Ok(())
    }

    /// Spawn the periodic poller.
    pub fn start(self) -> JobExecutorHandle {
        let executor = Arc::new(self);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let poller = tokio::spawn(executor.clone().run(shutdown_rx));
        JobExecutorHandle {
            shutdown_tx,
            poller,
            executor,
        }
    }

    async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        tracing::info!(
            owner = %self.owner,
            poll_interval_ms = self.config.poll_interval_ms,
            batch_size = self.config.batch_size,
            pool_size = self.config.pool_size,
            "JobExecutor: started"
        );

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            match self.poll_once().await {
                Ok(stats) if stats.acquired > 0 || stats.lost > 0 => {
                    tracing::debug!(
                        fetched = stats.fetched,
                        acquired = stats.acquired,
                        lost = stats.lost,
                        saturated = stats.saturated,
                        "JobExecutor: poll cycle"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(error = %e, "JobExecutor: poll cycle failed");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
                _ = shutdown_rx.changed() => break,
            }
        }

        tracing::info!(owner = %self.owner, "JobExecutor: poller stopped");
    }
}

async fn run_job(engine: &ProcessEngine, job_id: JobId, owner: &str) {
    let execute = ExecuteJob {
        job_id,
        lock_owner: owner.to_string(),
    };
    match engine.execute(&execute).await {
        Ok(JobOutcome::Executed) => {
            tracing::debug!(job_id = %job_id, "JobExecutor: job executed");
        }
        Ok(JobOutcome::Skipped) => {}
        Err(e) if e.is_retryable() => {
            // Another command owns the instance right now. The lock expires
            // and the job is picked up again without losing a retry.
            tracing::warn!(
                job_id = %job_id,
                error = %e,
                "JobExecutor: job conflicted, lock left to expire"
            );
        }
        Err(e) => {
            let record = RecordJobFailure {
                job_id,
                lock_owner: owner.to_string(),
                message: e.to_string(),
            };
            if let Err(record_err) = engine.execute(&record).await {
                tracing::error!(
                    job_id = %job_id,
                    error = %record_err,
                    original_error = %e,
                    "JobExecutor: failed to record job failure"
                );
            }
        }
    }
}

/// Running poller. Dropping the handle stops polling but does not wait for
/// workers; prefer [`JobExecutorHandle::shutdown`].
pub struct JobExecutorHandle {
    shutdown_tx: watch::Sender<bool>,
    poller: JoinHandle<()>,
    executor: Arc<JobExecutor>,
}

impl JobExecutorHandle {
    pub fn executor(&self) -> &JobExecutor {
        &self.executor
    }

    /// Stop polling, give in-flight workers the grace period, then abort
    /// whatever is still running. Aborted jobs keep their lock until it
    /// expires.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.poller.await {
            tracing::warn!(error = %e, "JobExecutor: poller task ended abnormally");
        }

        let grace = self.executor.config.shutdown_grace();
        match tokio::time::timeout(grace, self.executor.wait_idle()).await {
            Ok(Ok(())) => tracing::info!("JobExecutor: workers drained"),
            Ok(Err(e)) => tracing::warn!(error = %e, "JobExecutor: drain failed"),
            Err(_) => {
                tracing::warn!(
                    grace_ms = self.executor.config.shutdown_grace_ms,
                    "JobExecutor: grace period elapsed, aborting workers"
                );
                self.executor.workers.lock().await.abort_all();
            }
        }
    }
}
