use super::*;
use crate::expression::RhaiExpressionEvaluator;
use crate::graph::{EndKind, ProcessGraphBuilder};
use crate::handler::HandlerError;
use crate::job::{Job, JobHandlerType};
use chrono::Utc;
use serde_json::json;

struct Harness {
    graph: ProcessGraph,
    evaluator: RhaiExpressionEvaluator,
    handlers: HandlerRegistry,
    tree: ExecutionTree,
    events: Vec<RuntimeEvent>,
}

impl Harness {
    fn new(graph: ProcessGraph) -> Self {
        let tree = ExecutionTree::new_root("test:1", graph.initial(), None);
        Self {
            graph,
            evaluator: RhaiExpressionEvaluator::new(),
            handlers: HandlerRegistry::new(),
            tree,
            events: Vec::new(),
        }
    }

    fn with<R>(&mut self, f: impl FnOnce(&mut Pvm<'_>) -> R) -> R {
        let env = PvmEnv {
            evaluator: &self.evaluator,
            handlers: &self.handlers,
            now: Utc::now(),
            job_retries: 3,
        };
        let mut pvm = Pvm::new(&self.graph, &mut self.tree, env);
        let out = f(&mut pvm);
        self.events.extend(pvm.into_events());
        out
    }

    fn start(&mut self) -> Result<(), EngineError> {
        self.with(|p| p.start())
    }

    fn signal(&mut self, id: ExecutionId) -> Result<(), EngineError> {
        self.with(|p| p.signal(id))
    }

    fn root(&self) -> ExecutionId {
        self.tree.process_instance_id()
    }

    fn active_at(&self, activity: &str) -> Vec<ExecutionId> {
        self.tree
            .executions()
            .filter(|e| e.is_active && e.activity_id == activity)
            .map(|e| e.id)
            .collect()
    }

    fn jobs(&self) -> Vec<Job> {
        self.tree.jobs().cloned().collect()
    }

    fn ended(&self) -> bool {
        self.tree.is_ended() && self.events.contains(&RuntimeEvent::InstanceEnded)
    }
}

fn linear() -> ProcessGraph {
    ProcessGraphBuilder::new("linear")
        .initial("start")
        .automatic("start")
        .wait("task")
        .end("end")
        .transition("start", "task")
        .transition("task", "end")
        .build()
        .unwrap()
}

fn fork_join(n: usize) -> ProcessGraph {
    let mut b = ProcessGraphBuilder::new("fork-join")
        .initial("start")
        .automatic("start")
        .fork("fork")
        .join("join")
        .wait("after")
        .transition("start", "fork")
        .transition("join", "after");
    for i in 0..n {
        let branch = format!("b{i}");
        b = b
            .wait(&branch)
            .transition("fork", &branch)
            .transition(&branch, "join");
    }
    b.build().unwrap()
}

#[test]
fn walks_to_first_wait_state() {
    let mut h = Harness::new(linear());
    h.start().unwrap();
    assert_eq!(h.active_at("task"), vec![h.root()]);
    assert!(h.events.contains(&RuntimeEvent::ActivityEntered {
        execution_id: h.root(),
        activity_id: "task".into()
    }));
    h.tree.validate().unwrap();
}

#[test]
fn signal_runs_to_end() {
    let mut h = Harness::new(linear());
    h.start().unwrap();
    let root = h.root();
    h.signal(root).unwrap();
    assert!(h.ended());
}

#[test]
fn signal_rejects_non_wait_state_and_inactive() {
    let mut h = Harness::new(fork_join(2));
    h.start().unwrap();
    let root = h.root();
    // Root is the inactive fork container.
    assert!(matches!(
        h.signal(root),
        Err(EngineError::StructuralViolation(_))
    ));

    let mut g = Harness::new(
        ProcessGraphBuilder::new("x")
            .initial("a")
            .activity(
                crate::graph::Activity::new("a", Behavior::WaitState { timer: None })
                    .async_before(),
            )
            .build()
            .unwrap(),
    );
    g.start().unwrap();
    let root = g.root();
    assert!(matches!(
        g.signal(root),
        Err(EngineError::StructuralViolation(_))
    ));
}

#[test]
fn fork_join_continues_once() {
    for n in 2..=4 {
        let mut h = Harness::new(fork_join(n));
        h.start().unwrap();
        let branches: Vec<ExecutionId> = (0..n)
            .flat_map(|i| h.active_at(&format!("b{i}")))
            .collect();
        assert_eq!(branches.len(), n);
        assert_eq!(h.tree.children(h.root()).len(), n);

        // Arrive in reverse order.
        for (i, b) in branches.iter().rev().enumerate() {
            h.signal(*b).unwrap();
            h.tree.validate().unwrap();
            if i + 1 < n {
                assert!(h.active_at("after").is_empty());
            }
        }
        assert_eq!(h.active_at("after"), vec![h.root()]);
        assert_eq!(h.tree.executions().count(), 1);
        for b in branches {
            assert!(!h.tree.contains(b));
        }
    }
}

#[test]
fn join_without_fork_is_structural() {
    let g = ProcessGraphBuilder::new("bad-join")
        .initial("start")
        .exclusive("start")
        .automatic("a")
        .automatic("b")
        .join("join")
        .end("end")
        .conditional("start", "a", "${go_a == true}")
        .default_transition("start", "b")
        .transition("a", "join")
        .transition("b", "join")
        .transition("join", "end")
        .build()
        .unwrap();
    let mut h = Harness::new(g);
    assert!(matches!(
        h.start(),
        Err(EngineError::StructuralViolation(msg)) if msg.contains("no matching fork")
    ));
}

fn gateway(default: bool) -> ProcessGraph {
    let b = ProcessGraphBuilder::new("gw")
        .initial("gw")
        .exclusive("gw")
        .wait("high")
        .wait("mid")
        .wait("low")
        .conditional("gw", "high", "${amount > 1000}")
        .conditional("gw", "mid", "${amount > 500}");
    let b = if default {
        b.default_transition("gw", "low")
    } else {
        b.conditional("gw", "low", "${amount < 0}")
    };
    b.build().unwrap()
}

#[test]
fn exclusive_takes_first_true_then_default() {
    let mut h = Harness::new(gateway(true));
    let root = h.root();
    h.tree.set_variable(root, "amount", json!(2000)).unwrap();
    h.start().unwrap();
    assert_eq!(h.active_at("high").len(), 1);

    let mut h = Harness::new(gateway(true));
    let root = h.root();
    h.tree.set_variable(root, "amount", json!(10)).unwrap();
    h.start().unwrap();
    assert_eq!(h.active_at("low").len(), 1);
}

#[test]
fn exclusive_without_match_or_default_fails() {
    let mut h = Harness::new(gateway(false));
    let root = h.root();
    h.tree.set_variable(root, "amount", json!(10)).unwrap();
    assert!(matches!(
        h.start(),
        Err(EngineError::StructuralViolation(_))
    ));
}

#[test]
fn inclusive_gateway_and_join() {
    let g = ProcessGraphBuilder::new("or")
        .initial("split")
        .inclusive("split")
        .wait("a")
        .wait("b")
        .wait("c")
        .inclusive_join("merge")
        .wait("after")
        .conditional("split", "a", "${x > 0}")
        .conditional("split", "b", "${x > 1}")
        .conditional("split", "c", "${x > 100}")
        .transition("a", "merge")
        .transition("b", "merge")
        .transition("c", "merge")
        .transition("merge", "after")
        .build()
        .unwrap();
    let mut h = Harness::new(g);
    let root = h.root();
    h.tree.set_variable(root, "x", json!(5)).unwrap();
    h.start().unwrap();
    let a = h.active_at("a");
    let b = h.active_at("b");
    assert_eq!((a.len(), b.len(), h.active_at("c").len()), (1, 1, 0));

    h.signal(a[0]).unwrap();
    assert!(h.active_at("after").is_empty());
    h.signal(b[0]).unwrap();
    assert_eq!(h.active_at("after"), vec![root]);
}

#[test]
fn inclusive_join_fires_when_last_branch_ends_elsewhere() {
    let g = ProcessGraphBuilder::new("or-end")
        .initial("fork")
        .fork("fork")
        .wait("a")
        .wait("b")
        .end("b_end")
        .inclusive_join("merge")
        .wait("after")
        .transition("fork", "a")
        .transition("fork", "b")
        .transition("a", "merge")
        .conditional("b", "merge", "${never == true}")
        .transition("b", "b_end")
        .transition("merge", "after")
        .build()
        .unwrap();
    let mut h = Harness::new(g);
    h.start().unwrap();
    let a = h.active_at("a")[0];
    let b = h.active_at("b")[0];
    h.signal(a).unwrap();
    assert!(h.active_at("after").is_empty());
    h.signal(b).unwrap();
    assert_eq!(h.active_at("after").len(), 1);
}

#[test]
fn async_before_parks_then_resumes() {
    let g = ProcessGraphBuilder::new("async")
        .initial("start")
        .automatic("start")
        .activity(
            crate::graph::Activity::new("work", Behavior::Automatic { parallel: false })
                .async_before(),
        )
        .wait("done")
        .transition("start", "work")
        .transition("work", "done")
        .build()
        .unwrap();
    let mut h = Harness::new(g);
    h.start().unwrap();
    let jobs = h.jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].handler_type, JobHandlerType::AsyncContinuation);
    assert_eq!(h.active_at("work"), vec![h.root()]);

    let payload = jobs[0].payload().unwrap();
    let root = h.root();
    assert!(h.with(|p| p.resume_async(root, &payload)).unwrap());
    assert_eq!(h.active_at("done"), vec![root]);

    // Stale payload: nothing to resume.
    assert!(!h.with(|p| p.resume_async(root, &payload)).unwrap());
}

#[test]
fn async_after_parks_after_handler() {
    let g = ProcessGraphBuilder::new("async-after")
        .initial("work")
        .activity(
            crate::graph::Activity::new("work", Behavior::Automatic { parallel: false })
                .with_handler("mark")
                .async_after(),
        )
        .wait("done")
        .transition("work", "done")
        .build()
        .unwrap();
    let mut h = Harness::new(g);
    h.handlers.register_fn("mark", |ctx| {
        ctx.set_variable("marked", json!(true))?;
        Ok(())
    });
    h.start().unwrap();
    let root = h.root();
    assert_eq!(h.tree.get_variable(root, "marked").unwrap(), &json!(true));
    let payload = h.jobs()[0].payload().unwrap();
    assert_eq!(payload.phase, Some(AsyncPhase::After));
    assert!(h.with(|p| p.resume_async(root, &payload)).unwrap());
    assert_eq!(h.active_at("done"), vec![root]);
}

#[test]
fn timer_job_created_and_cleared_on_leave() {
    let g = ProcessGraphBuilder::new("timer")
        .initial("wait")
        .timer("wait", 60_000)
        .wait("next")
        .transition("wait", "next")
        .build()
        .unwrap();
    let mut h = Harness::new(g);
    h.start().unwrap();
    let jobs = h.jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].handler_type, JobHandlerType::TimerFire);
    assert!(jobs[0].due_date > Utc::now() + chrono::TimeDelta::seconds(50));

    let root = h.root();
    assert!(h.with(|p| p.fire_timer(root, "wait")).unwrap());
    assert_eq!(h.active_at("next"), vec![root]);
    assert!(h.jobs().is_empty());
}

#[test]
fn signal_before_timer_removes_timer_job() {
    let g = ProcessGraphBuilder::new("timer")
        .initial("wait")
        .timer("wait", 60_000)
        .wait("next")
        .transition("wait", "next")
        .build()
        .unwrap();
    let mut h = Harness::new(g);
    h.start().unwrap();
    let root = h.root();
    h.signal(root).unwrap();
    assert!(h.jobs().is_empty());
    assert!(!h.with(|p| p.fire_timer(root, "wait")).unwrap());
}

fn nested() -> ProcessGraph {
    use crate::graph::Activity;
    ProcessGraphBuilder::new("nested")
        .initial("sub")
        .activity(
            Activity::new(
                "sub",
                Behavior::SubProcess {
                    initial: "inner".into(),
                },
            )
            .on_error(Some("E_INNER"), "recover"),
        )
        .activity(Activity::new("inner", Behavior::WaitState { timer: None }).in_scope("sub"))
        .activity(
            Activity::new(
                "inner_gw",
                Behavior::Decision {
                    mode: crate::graph::DecisionMode::Exclusive,
                },
            )
            .in_scope("sub"),
        )
        .activity(
            Activity::new(
                "inner_fail",
                Behavior::End {
                    kind: EndKind::Error("E_INNER".into()),
                },
            )
            .in_scope("sub"),
        )
        .activity(
            Activity::new(
                "inner_end",
                Behavior::End {
                    kind: EndKind::None,
                },
            )
            .in_scope("sub"),
        )
        .wait("after")
        .wait("recover")
        .transition("inner", "inner_gw")
        .conditional("inner_gw", "inner_fail", "${fail == true}")
        .default_transition("inner_gw", "inner_end")
        .transition("sub", "after")
        .build()
        .unwrap()
}

#[test]
fn sub_process_scope_completes_into_parent() {
    let mut h = Harness::new(nested());
    h.start().unwrap();
    let root = h.root();
    let inner = h.active_at("inner");
    assert_eq!(inner.len(), 1);
    let scope = inner[0];
    assert_ne!(scope, root);
    assert!(h.tree.get(scope).unwrap().is_scope);
    assert!(!h.tree.get(root).unwrap().is_active);

    // Local to the sub-process scope, gone once it completes.
    h.tree.set_variable(scope, "local_only", json!(1)).unwrap();
    assert!(h.tree.get_variable_local(root, "local_only").is_err());

    h.signal(scope).unwrap();
    assert_eq!(h.active_at("after"), vec![root]);
    assert!(h.tree.get_variable(root, "local_only").is_err());
    assert_eq!(h.tree.executions().count(), 1);
}

#[test]
fn error_end_routes_to_boundary_handler() {
    let mut h = Harness::new(nested());
    h.start().unwrap();
    let root = h.root();
    h.tree.set_variable(root, "fail", json!(true)).unwrap();
    let scope = h.active_at("inner")[0];
    h.signal(scope).unwrap();

    assert_eq!(h.active_at("recover"), vec![root]);
    assert!(!h.tree.contains(scope));
    assert!(h.events.iter().any(|e| matches!(
        e,
        RuntimeEvent::ErrorRouted { error_code, handler_activity_id, .. }
            if error_code == "E_INNER" && handler_activity_id == "recover"
    )));
}

#[test]
fn unhandled_business_fault_surfaces() {
    let g = ProcessGraphBuilder::new("fault")
        .initial("work")
        .activity(
            crate::graph::Activity::new("work", Behavior::Automatic { parallel: false })
                .with_handler("reject"),
        )
        .end("end")
        .transition("work", "end")
        .build()
        .unwrap();
    let mut h = Harness::new(g);
    h.handlers
        .register_fn("reject", |_| Err(HandlerError::business("E_REJECT", "no")));
    match h.start() {
        Err(EngineError::BusinessFault {
            error_code,
            activity_id,
        }) => {
            assert_eq!(error_code, "E_REJECT");
            assert_eq!(activity_id, "work");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn catch_all_handler_on_activity() {
    let g = ProcessGraphBuilder::new("catch")
        .initial("work")
        .activity(
            crate::graph::Activity::new("work", Behavior::Automatic { parallel: false })
                .with_handler("reject")
                .on_error(Some("OTHER"), "wrong")
                .on_error(None, "fallback"),
        )
        .end("end")
        .wait("wrong")
        .wait("fallback")
        .transition("work", "end")
        .build()
        .unwrap();
    let mut h = Harness::new(g);
    h.handlers
        .register_fn("reject", |_| Err(HandlerError::business("E_REJECT", "no")));
    h.start().unwrap();
    assert_eq!(h.active_at("fallback"), vec![h.root()]);
}

#[test]
fn technical_handler_error_is_handler_execution() {
    let g = ProcessGraphBuilder::new("boom")
        .initial("work")
        .activity(
            crate::graph::Activity::new("work", Behavior::Automatic { parallel: false })
                .with_handler("boom"),
        )
        .build()
        .unwrap();
    let mut h = Harness::new(g);
    h.handlers
        .register_fn("boom", |_| Err(anyhow::anyhow!("disk on fire").into()));
    assert!(matches!(
        h.start(),
        Err(EngineError::HandlerExecution { .. })
    ));
}

#[test]
fn terminate_end_kills_all_branches() {
    let g = ProcessGraphBuilder::new("term")
        .initial("fork")
        .fork("fork")
        .wait("a")
        .automatic("b")
        .activity(crate::graph::Activity::new(
            "kill",
            Behavior::End {
                kind: EndKind::Terminate,
            },
        ))
        .end("a_end")
        .transition("fork", "a")
        .transition("fork", "b")
        .transition("a", "a_end")
        .transition("b", "kill")
        .build()
        .unwrap();
    let mut h = Harness::new(g);
    h.start().unwrap();
    assert!(h.ended());
}

#[test]
fn endless_loop_is_cut_off() {
    let g = ProcessGraphBuilder::new("loop")
        .initial("a")
        .automatic("a")
        .automatic("b")
        .transition("a", "b")
        .transition("b", "a")
        .build()
        .unwrap();
    let mut h = Harness::new(g);
    assert!(matches!(
        h.start(),
        Err(EngineError::StructuralViolation(msg)) if msg.contains("exceeded")
    ));
}

#[test]
fn scoped_wait_state_owns_local_variables() {
    let g = ProcessGraphBuilder::new("scoped")
        .initial("task")
        .activity(crate::graph::Activity::new("task", Behavior::WaitState { timer: None }).scope())
        .wait("next")
        .transition("task", "next")
        .build()
        .unwrap();
    let mut h = Harness::new(g);
    h.start().unwrap();
    let root = h.root();
    let scope = h.active_at("task")[0];
    assert_ne!(scope, root);
    h.tree.set_variable_local(scope, "draft", json!("x")).unwrap();
    h.signal(scope).unwrap();
    assert_eq!(h.active_at("next"), vec![root]);
    assert_eq!(h.tree.executions().count(), 1);
    assert!(h.tree.get_variable(root, "draft").is_err());
    let entered = h
        .events
        .iter()
        .filter(|e| matches!(e, RuntimeEvent::ActivityEntered { activity_id, .. } if activity_id == "task"))
        .count();
    assert_eq!(entered, 1);
}

#[test]
fn parallel_automatic_forks_to_all_enabled() {
    let g = ProcessGraphBuilder::new("par")
        .initial("start")
        .activity(crate::graph::Activity::new(
            "start",
            Behavior::Automatic { parallel: true },
        ))
        .wait("a")
        .wait("b")
        .wait("c")
        .transition("start", "a")
        .transition("start", "b")
        .conditional("start", "c", "${with_c == true}")
        .build()
        .unwrap();
    let mut h = Harness::new(g);
    h.start().unwrap();
    assert_eq!(h.active_at("a").len(), 1);
    assert_eq!(h.active_at("b").len(), 1);
    assert!(h.active_at("c").is_empty());
    assert!(h
        .events
        .iter()
        .any(|e| matches!(e, RuntimeEvent::ExecutionForked { children, .. } if children.len() == 2)));
}

/// Run the single pending async continuation the way `ExecuteJob` does.
fn run_only_async_job(h: &mut Harness) -> bool {
    let jobs = h.jobs();
    assert_eq!(jobs.len(), 1, "{jobs:?}");
    assert_eq!(jobs[0].handler_type, JobHandlerType::AsyncContinuation);
    let job = h.tree.remove_job(jobs[0].id).unwrap();
    let payload = job.payload().unwrap();
    h.with(|p| p.resume_async(job.execution_id, &payload)).unwrap()
}

#[test]
fn decision_async_after_parks_before_choosing() {
    let g = ProcessGraphBuilder::new("gw-async")
        .initial("start")
        .automatic("start")
        .activity(
            crate::graph::Activity::new(
                "gw",
                Behavior::Decision {
                    mode: crate::graph::DecisionMode::Exclusive,
                },
            )
            .async_after(),
        )
        .wait("x")
        .wait("y")
        .transition("start", "gw")
        .conditional("gw", "x", "${go == true}")
        .default_transition("gw", "y")
        .build()
        .unwrap();
    let mut h = Harness::new(g);
    h.start().unwrap();
    let root = h.root();
    assert_eq!(h.active_at("gw"), vec![root]);
    assert!(h.active_at("x").is_empty() && h.active_at("y").is_empty());
    assert_eq!(h.jobs()[0].payload().unwrap().phase, Some(AsyncPhase::After));

    // Conditions are read when the job runs.
    h.tree.set_variable(root, "go", json!(true)).unwrap();
    assert!(run_only_async_job(&mut h));
    assert_eq!(h.active_at("x"), vec![root]);
    assert!(h.jobs().is_empty());
}

#[test]
fn fork_async_after_parks_before_splitting() {
    let g = ProcessGraphBuilder::new("fork-async")
        .initial("start")
        .automatic("start")
        .activity(crate::graph::Activity::new("split", Behavior::Fork).async_after())
        .wait("a")
        .wait("b")
        .transition("start", "split")
        .transition("split", "a")
        .transition("split", "b")
        .build()
        .unwrap();
    let mut h = Harness::new(g);
    h.start().unwrap();
    let root = h.root();
    assert_eq!(h.active_at("split"), vec![root]);
    assert_eq!(h.tree.executions().count(), 1);
    assert!(!h
        .events
        .iter()
        .any(|e| matches!(e, RuntimeEvent::ExecutionForked { .. })));

    assert!(run_only_async_job(&mut h));
    assert_eq!(h.active_at("a").len(), 1);
    assert_eq!(h.active_at("b").len(), 1);
    h.tree.validate().unwrap();
}

#[test]
fn async_transition_parks_on_its_source() {
    let g = ProcessGraphBuilder::new("async-flow")
        .initial("start")
        .automatic("start")
        .wait("task")
        .async_transition("start", "task")
        .build()
        .unwrap();
    let mut h = Harness::new(g);
    h.start().unwrap();
    let root = h.root();
    assert_eq!(h.active_at("start"), vec![root]);
    let payload = h.jobs()[0].payload().unwrap();
    assert_eq!(payload.activity_id, "start");
    assert_eq!(payload.transition_id.as_deref(), Some("start->task"));
    assert!(!h
        .events
        .iter()
        .any(|e| matches!(e, RuntimeEvent::TransitionTaken { .. })));

    // Only the job moves the token on.
    assert!(matches!(
        h.signal(root),
        Err(EngineError::StructuralViolation(_))
    ));

    assert!(run_only_async_job(&mut h));
    assert_eq!(h.active_at("task"), vec![root]);
    assert!(h.events.contains(&RuntimeEvent::TransitionTaken {
        execution_id: root,
        transition_id: "start->task".into(),
    }));
    // Stale payload: the token has moved on.
    assert!(!h.with(|p| p.resume_async(root, &payload)).unwrap());
}

#[test]
fn timed_wait_with_async_after_drops_its_timer_on_signal() {
    let g = ProcessGraphBuilder::new("timer-async")
        .initial("wait")
        .activity(
            crate::graph::Activity::new(
                "wait",
                Behavior::WaitState {
                    timer: Some(crate::graph::TimerDefinition { duration_ms: 60_000 }),
                },
            )
            .async_after(),
        )
        .wait("next")
        .transition("wait", "next")
        .build()
        .unwrap();
    let mut h = Harness::new(g);
    h.start().unwrap();
    assert_eq!(h.jobs()[0].handler_type, JobHandlerType::TimerFire);

    let root = h.root();
    h.signal(root).unwrap();
    let jobs = h.jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].payload().unwrap().phase, Some(AsyncPhase::After));

    assert!(run_only_async_job(&mut h));
    assert_eq!(h.active_at("next"), vec![root]);
}
