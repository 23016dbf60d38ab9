//! Versioned registry of deployed process definitions.

use anyhow::anyhow;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{EngineError, EntityKind};
use crate::graph::ProcessGraph;

/// A definition version that instances can be started from.
#[derive(Debug)]
pub struct DeployedDefinition {
    /// `"<key>:<version>"`.
    pub id: String,
    pub key: String,
    pub version: u32,
    /// Hex SHA-256 of the definition document.
    pub content_hash: String,
    pub graph: Arc<ProcessGraph>,
}

#[derive(Default)]
struct Inner {
    by_id: HashMap<String, Arc<DeployedDefinition>>,
    latest: HashMap<String, Arc<DeployedDefinition>>,
}

#[derive(Default)]
pub struct DefinitionRegistry {
    inner: RwLock<Inner>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register `graph` as the next version of its key.
    /// Re-deploying content identical to the latest version returns that
    /// version instead of creating a new one.
    pub fn deploy(&self, graph: ProcessGraph) -> Result<Arc<DeployedDefinition>, EngineError> {
        let errors = graph.validate();
        if !errors.is_empty() {
            let joined = errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(EngineError::InvalidDefinition(joined));
        }
        let content_hash = graph.content_hash()?;
        let key = graph.key().to_string();

        let mut inner = self
            .inner
            .write()
            .map_err(|e| EngineError::Internal(anyhow!("Lock: {}", e)))?;
        let version = match inner.latest.get(&key) {
            Some(current) if current.content_hash == content_hash => {
                tracing::debug!(definition_id = %current.id, "definition unchanged, not redeployed");
                return Ok(current.clone());
            }
            Some(current) => current.version + 1,
            None => 1,
        };

        let deployed = Arc::new(DeployedDefinition {
            id: format!("{key}:{version}"),
            key: key.clone(),
            version,
            content_hash,
            graph: Arc::new(graph),
        });
        inner.by_id.insert(deployed.id.clone(), deployed.clone());
        inner.latest.insert(key, deployed.clone());
        tracing::info!(
            definition_id = %deployed.id,
            hash = %&deployed.content_hash[..12],
            "definition deployed"
        );
        Ok(deployed)
    }

    pub fn get(&self, id: &str) -> Result<Arc<DeployedDefinition>, EngineError> {
        let inner = self
            .inner
            .read()
            .map_err(|e| EngineError::Internal(anyhow!("Lock: {}", e)))?;
        inner
            .by_id
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::not_found(EntityKind::ProcessDefinition, id))
    }

    pub fn latest(&self, key: &str) -> Result<Arc<DeployedDefinition>, EngineError> {
        let inner = self
            .inner
            .read()
            .map_err(|e| EngineError::Internal(anyhow!("Lock: {}", e)))?;
        inner
            .latest
            .get(key)
            .cloned()
            .ok_or_else(|| EngineError::not_found(EntityKind::ProcessDefinition, key))
    }

    /// Every deployed version, ordered by key then version.
    pub fn list(&self) -> Result<Vec<Arc<DeployedDefinition>>, EngineError> {
        let inner = self
            .inner
            .read()
            .map_err(|e| EngineError::Internal(anyhow!("Lock: {}", e)))?;
        let mut all: Vec<_> = inner.by_id.values().cloned().collect();
        all.sort_by(|a, b| a.key.cmp(&b.key).then(a.version.cmp(&b.version)));
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ProcessGraphBuilder;

    fn graph(wait: &str) -> ProcessGraph {
        let doc = ProcessGraphBuilder::new("order")
            .initial("start")
            .automatic("start")
            .wait(wait)
            .transition("start", wait)
            .into_document();
        ProcessGraph::from_document(doc)
    }

    #[test]
    fn versions_increment_per_key() {
        let reg = DefinitionRegistry::new();
        let v1 = reg.deploy(graph("review")).unwrap();
        let v2 = reg.deploy(graph("approve")).unwrap();
        assert_eq!(v1.id, "order:1");
        assert_eq!(v2.id, "order:2");
        assert_ne!(v1.content_hash, v2.content_hash);
        assert_eq!(reg.latest("order").unwrap().version, 2);
        // Older versions stay resolvable for running instances.
        assert!(reg.get("order:1").unwrap().graph.activity("review").is_some());
        assert_eq!(reg.list().unwrap().len(), 2);
    }

    #[test]
    fn identical_redeploy_is_idempotent() {
        let reg = DefinitionRegistry::new();
        let a = reg.deploy(graph("review")).unwrap();
        let b = reg.deploy(graph("review")).unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(reg.list().unwrap().len(), 1);
    }

    #[test]
    fn invalid_graph_rejected() {
        let reg = DefinitionRegistry::new();
        let doc = ProcessGraphBuilder::new("bad").initial("nowhere").into_document();
        assert!(matches!(
            reg.deploy(ProcessGraph::from_document(doc)),
            Err(EngineError::InvalidDefinition(_))
        ));
        assert!(matches!(
            reg.latest("bad"),
            Err(EngineError::NotFound { .. })
        ));
    }
}
