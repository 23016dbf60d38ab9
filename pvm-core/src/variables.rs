//! Hierarchical variable scopes.
//!
//! Only scope executions own variables. Reads and `set` walk the same chain:
//! the requesting execution and then its ancestors, nearest first.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::error::{EngineError, EntityKind};
use crate::execution::ExecutionTree;
use crate::types::{new_id, ExecutionId, ProcessInstanceId, Revision, VariableId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VariableType {
    Null,
    Boolean,
    Integer,
    Double,
    String,
    Json,
}

impl VariableType {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(_) => Self::Boolean,
            Value::Number(n) if n.is_i64() || n.is_u64() => Self::Integer,
            Value::Number(_) => Self::Double,
            Value::String(_) => Self::String,
            Value::Array(_) | Value::Object(_) => Self::Json,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Boolean => "boolean",
            Self::Integer => "integer",
            Self::Double => "double",
            Self::String => "string",
            Self::Json => "json",
        }
    }
}

impl FromStr for VariableType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "null" => Ok(Self::Null),
            "boolean" => Ok(Self::Boolean),
            "integer" => Ok(Self::Integer),
            "double" => Ok(Self::Double),
            "string" => Ok(Self::String),
            "json" => Ok(Self::Json),
            other => Err(anyhow::anyhow!("unknown variable type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableInstance {
    pub id: VariableId,
    pub name: String,
    pub value: Value,
    pub type_tag: VariableType,
    pub owner_execution_id: ExecutionId,
    pub process_instance_id: ProcessInstanceId,
    pub revision: Revision,
}

impl ExecutionTree {
    fn find_variable(&self, owner: ExecutionId, name: &str) -> Option<&VariableInstance> {
        self.variables
            .values()
            .find(|v| v.owner_execution_id == owner && v.name == name)
    }

    fn find_variable_mut(&mut self, owner: ExecutionId, name: &str) -> Option<&mut VariableInstance> {
        self.variables
            .values_mut()
            .find(|v| v.owner_execution_id == owner && v.name == name)
    }

    /// Nearest execution in the chain of `execution_id` that declares `name`.
    fn declaring_scope(
        &self,
        execution_id: ExecutionId,
        name: &str,
    ) -> Result<Option<ExecutionId>, EngineError> {
        Ok(self
            .ancestors_inclusive(execution_id)?
            .into_iter()
            .find(|a| self.find_variable(*a, name).is_some()))
    }

    fn require_scope(&self, execution_id: ExecutionId) -> Result<(), EngineError> {
        if self.get(execution_id)?.is_scope {
            Ok(())
        } else {
            Err(EngineError::structural(format!(
                "execution {execution_id} is not a scope and owns no local variables"
            )))
        }
    }

    fn write(&mut self, owner: ExecutionId, name: &str, value: Value) {
        let type_tag = VariableType::of(&value);
        if let Some(v) = self.find_variable_mut(owner, name) {
            v.value = value;
            v.type_tag = type_tag;
            return;
        }
        let v = VariableInstance {
            id: new_id(),
            name: name.to_string(),
            value,
            type_tag,
            owner_execution_id: owner,
            process_instance_id: self.process_instance_id(),
            revision: 0,
        };
        self.variables.insert(v.id, v);
    }

    /// Visible value of `name`, nearest declaration wins.
    pub fn get_variable(&self, execution_id: ExecutionId, name: &str) -> Result<&Value, EngineError> {
        self.declaring_scope(execution_id, name)?
            .and_then(|owner| self.find_variable(owner, name))
            .map(|v| &v.value)
            .ok_or_else(|| EngineError::not_found(EntityKind::Variable, name))
    }

    /// Update the nearest declaration, or create the variable on the nearest
    /// enclosing scope. Returns the owning execution.
    pub fn set_variable(
        &mut self,
        execution_id: ExecutionId,
        name: &str,
        value: Value,
    ) -> Result<ExecutionId, EngineError> {
        let owner = match self.declaring_scope(execution_id, name)? {
            Some(owner) => owner,
            None => self.nearest_scope(execution_id)?,
        };
        self.write(owner, name, value);
        Ok(owner)
    }

    pub fn get_variable_local(
        &self,
        execution_id: ExecutionId,
        name: &str,
    ) -> Result<&Value, EngineError> {
        self.require_scope(execution_id)?;
        self.find_variable(execution_id, name)
            .map(|v| &v.value)
            .ok_or_else(|| EngineError::not_found(EntityKind::Variable, name))
    }

    /// Declare or update `name` on `execution_id` itself, shadowing outer
    /// declarations.
    pub fn set_variable_local(
        &mut self,
        execution_id: ExecutionId,
        name: &str,
        value: Value,
    ) -> Result<(), EngineError> {
        self.require_scope(execution_id)?;
        self.write(execution_id, name, value);
        Ok(())
    }

    /// Remove the nearest declaration of `name`.
    pub fn remove_variable(
        &mut self,
        execution_id: ExecutionId,
        name: &str,
    ) -> Result<(), EngineError> {
        let owner = self
            .declaring_scope(execution_id, name)?
            .ok_or_else(|| EngineError::not_found(EntityKind::Variable, name))?;
        self.variables
            .retain(|_, v| !(v.owner_execution_id == owner && v.name == name));
        Ok(())
    }

    /// Merged view of every variable visible from `execution_id`.
    pub fn visible_variables(
        &self,
        execution_id: ExecutionId,
    ) -> Result<BTreeMap<String, Value>, EngineError> {
        let mut merged = BTreeMap::new();
        // Outermost first so inner declarations overwrite.
        for scope in self.ancestors_inclusive(execution_id)?.into_iter().rev() {
            for v in self.variables.values().filter(|v| v.owner_execution_id == scope) {
                merged.insert(v.name.clone(), v.value.clone());
            }
        }
        Ok(merged)
    }

    pub fn local_variables(
        &self,
        execution_id: ExecutionId,
    ) -> Result<BTreeMap<String, Value>, EngineError> {
        self.get(execution_id)?;
        Ok(self
            .variables
            .values()
            .filter(|v| v.owner_execution_id == execution_id)
            .map(|v| (v.name.clone(), v.value.clone()))
            .collect())
    }

    pub fn variable_instances(&self) -> impl Iterator<Item = &VariableInstance> {
        self.variables.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// root (scope) -> sub (scope, inactive) -> a, b (concurrent)
    fn nested() -> (ExecutionTree, ExecutionId, ExecutionId, ExecutionId) {
        let mut tree = ExecutionTree::new_root("p:1", "sub", None);
        let root = tree.process_instance_id();
        tree.get_mut(root).unwrap().is_active = false;
        let sub = tree.create_child(root, "fork", true, false).unwrap();
        tree.get_mut(sub).unwrap().is_active = false;
        let a = tree.create_child(sub, "a", false, true).unwrap();
        tree.create_child(sub, "b", false, true).unwrap();
        (tree, root, sub, a)
    }

    #[test]
    fn set_updates_nearest_declaration() {
        let (mut tree, root, _sub, a) = nested();
        tree.set_variable_local(root, "amount", json!(10)).unwrap();

        let owner = tree.set_variable(a, "amount", json!(20)).unwrap();
        assert_eq!(owner, root);
        assert_eq!(tree.get_variable_local(root, "amount").unwrap(), &json!(20));
        assert_eq!(tree.variable_instances().count(), 1);
    }

    #[test]
    fn undeclared_set_lands_on_nearest_scope() {
        let (mut tree, root, sub, a) = nested();
        let owner = tree.set_variable(a, "fresh", json!("x")).unwrap();
        assert_eq!(owner, sub);
        assert!(tree.get_variable_local(root, "fresh").is_err());
        assert_eq!(tree.get_variable(a, "fresh").unwrap(), &json!("x"));
    }

    #[test]
    fn inner_declaration_shadows_outer() {
        let (mut tree, root, sub, a) = nested();
        tree.set_variable_local(root, "k", json!(1)).unwrap();
        tree.set_variable_local(sub, "k", json!(2)).unwrap();
        assert_eq!(tree.get_variable(a, "k").unwrap(), &json!(2));
        assert_eq!(tree.get_variable(root, "k").unwrap(), &json!(1));

        tree.set_variable(a, "k", json!(3)).unwrap();
        assert_eq!(tree.get_variable_local(sub, "k").unwrap(), &json!(3));
        assert_eq!(tree.get_variable_local(root, "k").unwrap(), &json!(1));

        let view = tree.visible_variables(a).unwrap();
        assert_eq!(view.get("k"), Some(&json!(3)));
    }

    #[test]
    fn missing_variable_is_not_found() {
        let (tree, _, _, a) = nested();
        assert!(matches!(
            tree.get_variable(a, "nope"),
            Err(EngineError::NotFound {
                kind: EntityKind::Variable,
                ..
            })
        ));
    }

    #[test]
    fn local_access_requires_scope() {
        let (mut tree, _, _, a) = nested();
        assert!(matches!(
            tree.set_variable_local(a, "x", json!(1)),
            Err(EngineError::StructuralViolation(_))
        ));
        assert!(tree.get_variable_local(a, "x").is_err());
    }

    #[test]
    fn remove_takes_nearest_only() {
        let (mut tree, root, sub, a) = nested();
        tree.set_variable_local(root, "k", json!(1)).unwrap();
        tree.set_variable_local(sub, "k", json!(2)).unwrap();
        tree.remove_variable(a, "k").unwrap();
        assert_eq!(tree.get_variable(a, "k").unwrap(), &json!(1));
        tree.remove_variable(a, "k").unwrap();
        assert!(tree.remove_variable(a, "k").is_err());
    }

    #[test]
    fn type_tags() {
        assert_eq!(VariableType::of(&json!(3)), VariableType::Integer);
        assert_eq!(VariableType::of(&json!(3.5)), VariableType::Double);
        assert_eq!(VariableType::of(&json!({"a": 1})), VariableType::Json);
        assert_eq!("json".parse::<VariableType>().unwrap(), VariableType::Json);
    }
}
