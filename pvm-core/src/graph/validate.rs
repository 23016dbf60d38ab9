use super::*;
use petgraph::visit::Dfs;
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub rule: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.rule, self.message)
    }
}

fn err(rule: &str, message: String) -> ValidationError {
    ValidationError {
        rule: rule.to_string(),
        message,
    }
}

pub(super) fn to_engine_error(errors: &[ValidationError]) -> EngineError {
    let joined = errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ");
    EngineError::InvalidDefinition(joined)
}

impl ProcessGraph {
    /// Structural checks over the whole definition. Returns all errors found.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let doc = &self.document;

        // G1: activity ids are unique
        let mut seen = HashSet::new();
        for a in &doc.activities {
            if !seen.insert(a.id.as_str()) {
                errors.push(err("G1", format!("Duplicate activity id: {}", a.id)));
            }
        }

        // G2: transition ids are unique
        let mut seen = HashSet::new();
        for t in &doc.transitions {
            if !seen.insert(t.id.as_str()) {
                errors.push(err("G2", format!("Duplicate transition id: {}", t.id)));
            }
        }

        // G3: parents name existing sub-processes, without cycles
        for a in &doc.activities {
            let Some(parent) = a.parent.as_deref() else {
                continue;
            };
            match self.activity(parent).map(|p| &p.behavior) {
                Some(Behavior::SubProcess { .. }) => {}
                Some(_) => errors.push(err(
                    "G3",
                    format!("Activity {}: parent {} is not a sub-process", a.id, parent),
                )),
                None => errors.push(err(
                    "G3",
                    format!("Activity {}: unknown parent {}", a.id, parent),
                )),
            }
            if self.scope_chain_len(&a.id).is_none() {
                errors.push(err("G3", format!("Activity {}: cyclic parent chain", a.id)));
            }
        }

        // G4: transitions reference existing activities within one scope
        for t in &doc.transitions {
            let source = self.activity(&t.source);
            let destination = self.activity(&t.destination);
            if source.is_none() {
                errors.push(err(
                    "G4",
                    format!("Transition {}: unknown source {}", t.id, t.source),
                ));
            }
            if destination.is_none() {
                errors.push(err(
                    "G4",
                    format!("Transition {}: unknown destination {}", t.id, t.destination),
                ));
            }
            if let (Some(s), Some(d)) = (source, destination) {
                if s.parent != d.parent {
                    errors.push(err(
                        "G4",
                        format!("Transition {}: crosses a sub-process boundary", t.id),
                    ));
                }
            }
        }

        // G5: top-level initial exists and is top-level
        match self.activity(&doc.initial) {
            Some(a) if a.parent.is_none() => {}
            Some(_) => errors.push(err(
                "G5",
                format!("Initial activity {} is inside a sub-process", doc.initial),
            )),
            None => errors.push(err(
                "G5",
                format!("Unknown initial activity '{}'", doc.initial),
            )),
        }

        // G6: each sub-process initial is a direct child
        for a in &doc.activities {
            if let Behavior::SubProcess { initial } = &a.behavior {
                let ok = self
                    .activity(initial)
                    .is_some_and(|i| i.parent.as_deref() == Some(a.id.as_str()));
                if !ok {
                    errors.push(err(
                        "G6",
                        format!("SubProcess {}: initial {} is not one of its children", a.id, initial),
                    ));
                }
            }
        }

        // G7: default transitions only leave decisions, at most one each
        for a in &doc.activities {
            let defaults = self.outgoing(&a.id).iter().filter(|t| t.is_default).count();
            let is_decision = matches!(a.behavior, Behavior::Decision { .. });
            if defaults > 0 && !is_decision {
                errors.push(err(
                    "G7",
                    format!("Activity {}: default transition on a non-decision", a.id),
                ));
            }
            if defaults > 1 {
                errors.push(err(
                    "G7",
                    format!("Decision {}: {} default transitions", a.id, defaults),
                ));
            }
        }

        // G8: joins merge at least two incoming transitions
        for a in &doc.activities {
            if matches!(a.behavior, Behavior::Join { .. }) && self.incoming(&a.id).len() < 2 {
                errors.push(err(
                    "G8",
                    format!("Join {}: needs at least two incoming transitions", a.id),
                ));
            }
        }

        // G9: forks and decisions have somewhere to go
        for a in &doc.activities {
            let branches = matches!(a.behavior, Behavior::Fork | Behavior::Decision { .. });
            if branches && self.outgoing(&a.id).is_empty() {
                errors.push(err(
                    "G9",
                    format!("Activity {}: no outgoing transitions", a.id),
                ));
            }
        }

        // G10: error handler targets exist beside the activity they guard
        for a in &doc.activities {
            for h in &a.error_handlers {
                match self.activity(&h.target) {
                    Some(t) if t.parent == a.parent => {}
                    Some(_) => errors.push(err(
                        "G10",
                        format!("Activity {}: error target {} is in another scope", a.id, h.target),
                    )),
                    None => errors.push(err(
                        "G10",
                        format!("Activity {}: unknown error target {}", a.id, h.target),
                    )),
                }
            }
        }

        // G11: every activity is reachable from an entry point
        if errors.is_empty() {
            for id in self.unreachable() {
                errors.push(err("G11", format!("Activity {} is unreachable", id)));
            }
        }

        errors
    }

    /// Number of enclosing sub-processes, `None` if the chain loops.
    fn scope_chain_len(&self, id: &str) -> Option<usize> {
        let mut depth = 0;
        let mut current = self.activity(id)?.parent.as_deref();
        while let Some(p) = current {
            depth += 1;
            if depth > self.document.activities.len() {
                return None;
            }
            current = self.activity(p).and_then(|a| a.parent.as_deref());
        }
        Some(depth)
    }

    fn unreachable(&self) -> Vec<&str> {
        let mut entries: Vec<&str> = vec![self.document.initial.as_str()];
        for a in &self.document.activities {
            if let Behavior::SubProcess { initial } = &a.behavior {
                entries.push(initial);
            }
            entries.extend(a.error_handlers.iter().map(|h| h.target.as_str()));
        }

        let mut reached = HashSet::new();
        for entry in entries {
            let Some(&start) = self.flow_nodes.get(entry) else {
                continue;
            };
            let mut dfs = Dfs::new(&self.flow, start);
            while let Some(node) = dfs.next(&self.flow) {
                reached.insert(self.flow[node].as_str());
            }
        }

        self.document
            .activities
            .iter()
            .map(|a| a.id.as_str())
            .filter(|id| !reached.contains(id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(errors: &[ValidationError]) -> Vec<&str> {
        errors.iter().map(|e| e.rule.as_str()).collect()
    }

    #[test]
    fn valid_graph_has_no_errors() {
        let g = ProcessGraphBuilder::new("ok")
            .initial("start")
            .automatic("start")
            .exclusive("gw")
            .end("a")
            .end("b")
            .transition("start", "gw")
            .conditional("gw", "a", "${x}")
            .default_transition("gw", "b")
            .into_document();
        assert!(ProcessGraph::from_document(g).validate().is_empty());
    }

    #[test]
    fn reports_every_error() {
        let doc = ProcessGraphBuilder::new("bad")
            .initial("missing")
            .automatic("start")
            .automatic("start")
            .join("join")
            .default_transition("start", "join")
            .transition("start", "nowhere")
            .into_document();
        let errors = ProcessGraph::from_document(doc).validate();
        let r = rules(&errors);
        assert!(r.contains(&"G1"), "{errors:?}");
        assert!(r.contains(&"G4"));
        assert!(r.contains(&"G5"));
        assert!(r.contains(&"G7"));
        assert!(r.contains(&"G8"));
    }

    #[test]
    fn cross_scope_transition_rejected() {
        let doc = ProcessGraphBuilder::new("x")
            .initial("sub")
            .activity(Activity::new(
                "sub",
                Behavior::SubProcess {
                    initial: "inner".into(),
                },
            ))
            .activity(Activity::new("inner", Behavior::WaitState { timer: None }).in_scope("sub"))
            .end("out")
            .transition("inner", "out")
            .into_document();
        let errors = ProcessGraph::from_document(doc).validate();
        assert_eq!(rules(&errors), vec!["G4"]);
    }

    #[test]
    fn sub_process_initial_must_be_child() {
        let doc = ProcessGraphBuilder::new("x")
            .initial("sub")
            .activity(Activity::new(
                "sub",
                Behavior::SubProcess {
                    initial: "stray".into(),
                },
            ))
            .wait("stray")
            .transition("sub", "stray")
            .into_document();
        let errors = ProcessGraph::from_document(doc).validate();
        assert_eq!(rules(&errors), vec!["G6"]);
    }

    #[test]
    fn unreachable_activity_reported() {
        let doc = ProcessGraphBuilder::new("x")
            .initial("start")
            .automatic("start")
            .end("end")
            .end("island")
            .transition("start", "end")
            .into_document();
        let errors = ProcessGraph::from_document(doc).validate();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].rule, "G11");
        assert!(errors[0].message.contains("island"));
    }

    #[test]
    fn error_target_in_other_scope_rejected() {
        let doc = ProcessGraphBuilder::new("x")
            .initial("start")
            .activity(Activity::new("start", Behavior::Automatic { parallel: false }).on_error(None, "sub"))
            .activity(Activity::new(
                "sub",
                Behavior::SubProcess {
                    initial: "inner".into(),
                },
            ))
            .activity(Activity::new("inner", Behavior::End { kind: EndKind::None }).in_scope("sub"))
            .activity(
                Activity::new("task", Behavior::Automatic { parallel: false })
                    .in_scope("sub")
                    .on_error(Some("E1"), "start"),
            )
            .transition("start", "sub")
            .transition("inner", "task")
            .into_document();
        let errors = ProcessGraph::from_document(doc).validate();
        assert_eq!(rules(&errors), vec!["G10"]);
    }

    #[test]
    fn build_wraps_errors_as_invalid_definition() {
        let err = ProcessGraphBuilder::new("x")
            .initial("nope")
            .build()
            .unwrap_err();
        match err {
            EngineError::InvalidDefinition(msg) => assert!(msg.contains("[G5]")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
