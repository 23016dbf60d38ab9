mod common;

use common::{active_at, engine};
use pvm_core::command::StartProcessInstance;
use pvm_core::events::RuntimeEvent;
use pvm_core::EngineError;
use std::collections::BTreeMap;

const V1: &str = r#"
key: onboarding
initial: collect
activities:
  - id: collect
    kind: WaitState
  - id: done
    kind: End
transitions:
  - source: collect
    destination: done
"#;

const V2: &str = r#"
key: onboarding
initial: collect
activities:
  - id: collect
    kind: WaitState
  - id: verify
    kind: WaitState
  - id: done
    kind: End
transitions:
  - source: collect
    destination: verify
  - source: verify
    destination: done
"#;

#[tokio::test]
async fn running_instances_stay_on_their_version() {
    let t = engine(|b| b);
    let v1 = t.engine.deploy_yaml(V1).unwrap();
    assert_eq!(v1.id, "onboarding:1");
    let old = t
        .engine
        .execute(&StartProcessInstance::by_key("onboarding").business_key("cust-1"))
        .await
        .unwrap();

    let v2 = t.engine.deploy_yaml(V2).unwrap();
    assert_eq!(v2.id, "onboarding:2");
    let new = t.engine.start_process("onboarding", BTreeMap::new()).await.unwrap();

    let old_view = t.engine.process_instance(old).await.unwrap();
    assert_eq!(old_view.process_definition_id, "onboarding:1");
    assert_eq!(old_view.business_key.as_deref(), Some("cust-1"));
    let new_view = t.engine.process_instance(new).await.unwrap();
    assert_eq!(new_view.process_definition_id, "onboarding:2");

    // v1 goes straight to the end; v2 stops at `verify`.
    t.engine.signal(old, BTreeMap::new()).await.unwrap();
    assert!(t.engine.process_instance(old).await.is_err());
    t.engine.signal(new, BTreeMap::new()).await.unwrap();
    let new_view = t.engine.process_instance(new).await.unwrap();
    assert_eq!(active_at(&new_view, "verify"), vec![new]);

    // Pinned start by exact id.
    let pinned = t
        .engine
        .execute(&StartProcessInstance::by_id("onboarding:1"))
        .await
        .unwrap();
    let view = t.engine.process_instance(pinned).await.unwrap();
    assert_eq!(view.process_definition_id, "onboarding:1");
}

#[tokio::test]
async fn redeploying_identical_content_keeps_the_version() {
    let t = engine(|b| b);
    let first = t.engine.deploy_yaml(V1).unwrap();
    let again = t.engine.deploy_yaml(V1).unwrap();
    assert_eq!(first.id, again.id);
    assert_eq!(t.engine.definitions().list().unwrap().len(), 1);
}

#[tokio::test]
async fn unknown_definition_is_not_found() {
    let t = engine(|b| b);
    let err = t
        .engine
        .start_process("missing", BTreeMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound { .. }));
}

#[tokio::test]
async fn events_reach_listeners_in_walk_order_after_commit() {
    let t = engine(|b| b);
    t.engine.deploy_yaml(V1).unwrap();
    let id = t
        .engine
        .start_process("onboarding", BTreeMap::from([("tier".to_string(), serde_json::json!("gold"))]))
        .await
        .unwrap();

    let events = t.events.events();
    assert_eq!(
        events,
        vec![
            RuntimeEvent::InstanceStarted {
                process_definition_id: "onboarding:1".into(),
                business_key: None,
            },
            RuntimeEvent::VariableSet {
                execution_id: id,
                name: "tier".into(),
            },
            RuntimeEvent::ActivityEntered {
                execution_id: id,
                activity_id: "collect".into(),
            },
        ]
    );
}
