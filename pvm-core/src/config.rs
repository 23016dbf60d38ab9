//! Engine configuration: load from YAML, then apply environment overrides.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// Node-level engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Identity written into `lock_owner` when this node acquires a job.
    pub node_id: String,
    /// Attempts the retry interceptor makes on an optimistic-lock conflict
    /// after the first one.
    pub command_retries: u32,
    pub job_executor: JobExecutorConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_id: format!("pvm-node-{}", crate::types::new_id()),
            command_retries: 3,
            job_executor: JobExecutorConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load from a YAML file. Missing keys keep their defaults.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
        Self::from_yaml_str(&content).with_context(|| format!("Parsing {}", path.display()))
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Apply `PVM_*` environment overrides on top of the current values.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(node_id) = var("PVM_NODE_ID") {
            self.node_id = node_id;
        }
        if let Some(v) = parse_var(&var, "PVM_COMMAND_RETRIES")? {
            self.command_retries = v;
        }
        let jobs = &mut self.job_executor;
        if let Some(v) = parse_var(&var, "PVM_JOB_POOL_SIZE")? {
            jobs.pool_size = v;
        }
        if let Some(v) = parse_var(&var, "PVM_JOB_BATCH_SIZE")? {
            jobs.batch_size = v;
        }
        if let Some(v) = parse_var(&var, "PVM_JOB_POLL_INTERVAL_MS")? {
            jobs.poll_interval_ms = v;
        }
        if let Some(v) = parse_var(&var, "PVM_JOB_LOCK_DURATION_MS")? {
            jobs.lock_duration_ms = v;
        }
        Ok(self)
    }
}

fn parse_var<T>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    var(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .with_context(|| format!("{key}={raw:?} is not a valid number"))
        })
        .transpose()
}

// ---------------------------------------------------------------------------
// JobExecutorConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobExecutorConfig {
    pub poll_interval_ms: u64,
    /// Upper bound on jobs fetched per poll.
    pub batch_size: usize,
    pub lock_duration_ms: u64,
    /// Concurrent job workers. An acquired job with no free worker is left
    /// locked until its lock expires.
    pub pool_size: usize,
    pub shutdown_grace_ms: u64,
    /// `retries_left` given to newly created jobs.
    pub default_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            batch_size: 10,
            lock_duration_ms: 300_000,
            pool_size: 4,
            shutdown_grace_ms: 10_000,
            default_retries: 3,
            backoff_base_ms: 10_000,
            backoff_max_ms: 600_000,
        }
    }
}

impl JobExecutorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lock_duration(&self) -> Duration {
        Duration::from_millis(self.lock_duration_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
