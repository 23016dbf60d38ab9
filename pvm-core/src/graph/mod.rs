//! Immutable process graph: activities, transitions and nested scopes.
//!
//! A graph is loaded once per deployed definition version and shared
//! read-only (`Arc<ProcessGraph>`) by every instance pinned to that version.

mod builder;
mod validate;
mod yaml;

pub use builder::ProcessGraphBuilder;
pub use validate::ValidationError;

use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

use crate::error::EngineError;

// ── Definition document ──

/// Serializable form of a process definition. Both the builder and the YAML
/// loader produce one of these; [`ProcessGraph`] indexes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphDocument {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// First activity of the top-level scope.
    pub initial: String,
    pub activities: Vec<Activity>,
    #[serde(default)]
    pub transitions: Vec<Transition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub id: String,
    #[serde(flatten)]
    pub behavior: Behavior,
    /// Entering this activity opens a child scope execution with its own
    /// variables. Always true for sub-processes.
    #[serde(default)]
    pub is_scope: bool,
    /// Enclosing sub-process, `None` for the top-level scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default)]
    pub async_before: bool,
    #[serde(default)]
    pub async_after: bool,
    /// Registered [`crate::handler::ActivityHandler`] run by `Automatic` activities.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error_handlers: Vec<ErrorHandler>,
}

/// Closed set of behaviours the interpreter knows how to step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Behavior {
    /// Runs its handler (if any) and leaves immediately. `parallel` takes every
    /// outgoing transition whose condition holds instead of the first one.
    Automatic {
        #[serde(default)]
        parallel: bool,
    },
    Decision {
        #[serde(default)]
        mode: DecisionMode,
    },
    Fork,
    Join {
        #[serde(default)]
        mode: JoinMode,
    },
    WaitState {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timer: Option<TimerDefinition>,
    },
    SubProcess {
        initial: String,
    },
    End {
        #[serde(default, rename = "end")]
        kind: EndKind,
    },
}

impl Behavior {
    pub fn as_str(&self) -> &'static str {
        match self {
            Behavior::Automatic { .. } => "automatic",
            Behavior::Decision { .. } => "decision",
            Behavior::Fork => "fork",
            Behavior::Join { .. } => "join",
            Behavior::WaitState { .. } => "wait_state",
            Behavior::SubProcess { .. } => "sub_process",
            Behavior::End { .. } => "end",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionMode {
    #[default]
    Exclusive,
    Inclusive,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinMode {
    #[default]
    Parallel,
    Inclusive,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndKind {
    #[default]
    None,
    /// Ends the whole process instance, whatever else is running.
    Terminate,
    /// Raises a business fault with this error code.
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerDefinition {
    pub duration_ms: u64,
}

/// Boundary error handler. `error_code: None` catches every business fault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorHandler {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    /// Defaults to `"<source>-><destination>"` when omitted.
    #[serde(default)]
    pub id: String,
    pub source: String,
    pub destination: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Taken by a decision when no conditional transition matched.
    #[serde(default)]
    pub is_default: bool,
    /// Park on an async continuation job before the transition is taken.
    #[serde(default, rename = "async")]
    pub is_async: bool,
}

impl Activity {
    pub fn new(id: impl Into<String>, behavior: Behavior) -> Self {
        Self {
            id: id.into(),
            behavior,
            is_scope: false,
            parent: None,
            async_before: false,
            async_after: false,
            handler: None,
            error_handlers: Vec::new(),
        }
    }

    pub fn scope(mut self) -> Self {
        self.is_scope = true;
        self
    }

    pub fn in_scope(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn async_before(mut self) -> Self {
        self.async_before = true;
        self
    }

    pub fn async_after(mut self) -> Self {
        self.async_after = true;
        self
    }

    pub fn with_handler(mut self, name: impl Into<String>) -> Self {
        self.handler = Some(name.into());
        self
    }

    pub fn on_error(mut self, error_code: Option<&str>, target: impl Into<String>) -> Self {
        self.error_handlers.push(ErrorHandler {
            error_code: error_code.map(str::to_string),
            target: target.into(),
        });
        self
    }

    /// True when arriving here opens a child scope execution.
    pub fn opens_scope(&self) -> bool {
        self.is_scope || matches!(self.behavior, Behavior::SubProcess { .. })
    }
}

// ── Indexed graph ──

#[derive(Debug)]
pub struct ProcessGraph {
    document: GraphDocument,
    activity_index: HashMap<String, usize>,
    transition_index: HashMap<String, usize>,
    outgoing: HashMap<String, Vec<usize>>,
    incoming: HashMap<String, Vec<usize>>,
    flow: DiGraph<String, ()>,
    flow_nodes: HashMap<String, NodeIndex>,
}

impl ProcessGraph {
    /// Index a document. Dangling references are tolerated here and reported
    /// by [`ProcessGraph::validate`].
    pub fn from_document(mut document: GraphDocument) -> Self {
        for t in &mut document.transitions {
            if t.id.is_empty() {
                t.id = format!("{}->{}", t.source, t.destination);
            }
        }

        let mut activity_index = HashMap::new();
        let mut flow = DiGraph::new();
        let mut flow_nodes = HashMap::new();
        for (i, a) in document.activities.iter().enumerate() {
            activity_index.entry(a.id.clone()).or_insert(i);
            flow_nodes
                .entry(a.id.clone())
                .or_insert_with(|| flow.add_node(a.id.clone()));
        }

        let mut transition_index = HashMap::new();
        let mut outgoing: HashMap<String, Vec<usize>> = HashMap::new();
        let mut incoming: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, t) in document.transitions.iter().enumerate() {
            transition_index.entry(t.id.clone()).or_insert(i);
            outgoing.entry(t.source.clone()).or_default().push(i);
            incoming.entry(t.destination.clone()).or_default().push(i);
            if let (Some(&from), Some(&to)) = (flow_nodes.get(&t.source), flow_nodes.get(&t.destination))
            {
                flow.add_edge(from, to, ());
            }
        }

        Self {
            document,
            activity_index,
            transition_index,
            outgoing,
            incoming,
            flow,
            flow_nodes,
        }
    }

    pub fn key(&self) -> &str {
        &self.document.key
    }

    pub fn name(&self) -> Option<&str> {
        self.document.name.as_deref()
    }

    pub fn document(&self) -> &GraphDocument {
        &self.document
    }

    pub fn initial(&self) -> &str {
        &self.document.initial
    }

    pub fn activities(&self) -> impl Iterator<Item = &Activity> {
        self.document.activities.iter()
    }

    pub fn transitions(&self) -> impl Iterator<Item = &Transition> {
        self.document.transitions.iter()
    }

    pub fn activity(&self, id: &str) -> Option<&Activity> {
        self.activity_index
            .get(id)
            .map(|&i| &self.document.activities[i])
    }

    pub fn require_activity(&self, id: &str) -> Result<&Activity, EngineError> {
        self.activity(id)
            .ok_or_else(|| EngineError::InvalidDefinition(format!("unknown activity '{id}'")))
    }

    pub fn transition(&self, id: &str) -> Option<&Transition> {
        self.transition_index
            .get(id)
            .map(|&i| &self.document.transitions[i])
    }

    /// Outgoing transitions in declaration order.
    pub fn outgoing(&self, activity_id: &str) -> Vec<&Transition> {
        self.indexed(self.outgoing.get(activity_id))
    }

    pub fn incoming(&self, activity_id: &str) -> Vec<&Transition> {
        self.indexed(self.incoming.get(activity_id))
    }

    fn indexed(&self, idx: Option<&Vec<usize>>) -> Vec<&Transition> {
        idx.map(|v| v.iter().map(|&i| &self.document.transitions[i]).collect())
            .unwrap_or_default()
    }

    pub fn default_transition(&self, activity_id: &str) -> Option<&Transition> {
        self.outgoing(activity_id).into_iter().find(|t| t.is_default)
    }

    /// Whether a token at `from` can still arrive at `to` by following
    /// transitions.
    pub fn can_reach(&self, from: &str, to: &str) -> bool {
        match (self.flow_nodes.get(from), self.flow_nodes.get(to)) {
            (Some(&a), Some(&b)) => has_path_connecting(&self.flow, a, b, None),
            _ => false,
        }
    }

    /// The sub-process enclosing `activity_id`, if any.
    pub fn enclosing(&self, activity_id: &str) -> Option<&Activity> {
        self.activity(activity_id)
            .and_then(|a| a.parent.as_deref())
            .and_then(|p| self.activity(p))
    }

    /// SHA-256 of the canonical JSON form, hex encoded.
    pub fn content_hash(&self) -> Result<String, EngineError> {
        let bytes = serde_json::to_vec(&self.document)
            .map_err(|e| EngineError::Internal(anyhow::Error::new(e)))?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }
}
