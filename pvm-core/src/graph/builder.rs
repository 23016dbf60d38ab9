use super::*;

/// Programmatic construction of a [`ProcessGraph`].
///
/// ```
/// use pvm_core::graph::ProcessGraphBuilder;
///
/// let graph = ProcessGraphBuilder::new("approval")
///     .initial("start")
///     .automatic("start")
///     .wait("review")
///     .end("done")
///     .transition("start", "review")
///     .transition("review", "done")
///     .build()
///     .unwrap();
/// assert_eq!(graph.outgoing("review").len(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct ProcessGraphBuilder {
    document: GraphDocument,
}

impl ProcessGraphBuilder {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            document: GraphDocument {
                key: key.into(),
                name: None,
                initial: String::new(),
                activities: Vec::new(),
                transitions: Vec::new(),
            },
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.document.name = Some(name.into());
        self
    }

    pub fn initial(mut self, id: impl Into<String>) -> Self {
        self.document.initial = id.into();
        self
    }

    pub fn activity(mut self, activity: Activity) -> Self {
        self.document.activities.push(activity);
        self
    }

    // ── Shorthands ──

    pub fn automatic(self, id: &str) -> Self {
        self.activity(Activity::new(id, Behavior::Automatic { parallel: false }))
    }

    pub fn fork(self, id: &str) -> Self {
        self.activity(Activity::new(id, Behavior::Fork))
    }

    pub fn join(self, id: &str) -> Self {
        self.activity(Activity::new(
            id,
            Behavior::Join {
                mode: JoinMode::Parallel,
            },
        ))
    }

    pub fn inclusive_join(self, id: &str) -> Self {
        self.activity(Activity::new(
            id,
            Behavior::Join {
                mode: JoinMode::Inclusive,
            },
        ))
    }

    pub fn exclusive(self, id: &str) -> Self {
        self.activity(Activity::new(
            id,
            Behavior::Decision {
                mode: DecisionMode::Exclusive,
            },
        ))
    }

    pub fn inclusive(self, id: &str) -> Self {
        self.activity(Activity::new(
            id,
            Behavior::Decision {
                mode: DecisionMode::Inclusive,
            },
        ))
    }

    pub fn wait(self, id: &str) -> Self {
        self.activity(Activity::new(id, Behavior::WaitState { timer: None }))
    }

    pub fn timer(self, id: &str, duration_ms: u64) -> Self {
        self.activity(Activity::new(
            id,
            Behavior::WaitState {
                timer: Some(TimerDefinition { duration_ms }),
            },
        ))
    }

    pub fn end(self, id: &str) -> Self {
        self.activity(Activity::new(
            id,
            Behavior::End {
                kind: EndKind::None,
            },
        ))
    }

    // ── Transitions ──

    pub fn transition(self, source: &str, destination: &str) -> Self {
        self.push_transition(source, destination, None, false)
    }

    pub fn conditional(self, source: &str, destination: &str, condition: &str) -> Self {
        self.push_transition(source, destination, Some(condition.to_string()), false)
    }

    pub fn default_transition(self, source: &str, destination: &str) -> Self {
        self.push_transition(source, destination, None, true)
    }

    /// Unconditional transition taken by a job rather than inline.
    pub fn async_transition(mut self, source: &str, destination: &str) -> Self {
        self = self.push_transition(source, destination, None, false);
        if let Some(t) = self.document.transitions.last_mut() {
            t.is_async = true;
        }
        self
    }

    fn push_transition(
        mut self,
        source: &str,
        destination: &str,
        condition: Option<String>,
        is_default: bool,
    ) -> Self {
        self.document.transitions.push(Transition {
            id: format!("{source}->{destination}"),
            source: source.to_string(),
            destination: destination.to_string(),
            condition,
            is_default,
            is_async: false,
        });
        self
    }

    pub fn into_document(self) -> GraphDocument {
        self.document
    }

    /// Index and validate. All validation failures are reported together.
    pub fn build(self) -> Result<ProcessGraph, EngineError> {
        let graph = ProcessGraph::from_document(self.document);
        let errors = graph.validate();
        if errors.is_empty() {
            Ok(graph)
        } else {
            Err(validate::to_engine_error(&errors))
        }
    }
}
