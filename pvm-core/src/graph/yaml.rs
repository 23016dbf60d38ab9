use super::*;
use crate::error::EngineError;

impl ProcessGraph {
    /// Parse and validate a YAML definition document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, EngineError> {
        let document: GraphDocument = serde_yaml::from_str(yaml)
            .map_err(|e| EngineError::InvalidDefinition(format!("yaml: {e}")))?;
        let graph = ProcessGraph::from_document(document);
        let errors = graph.validate();
        if errors.is_empty() {
            Ok(graph)
        } else {
            Err(validate::to_engine_error(&errors))
        }
    }
}
