#![allow(dead_code)]

use pvm_core::clock::ManualClock;
use pvm_core::command::ProcessInstanceView;
use pvm_core::config::EngineConfig;
use pvm_core::events::{EventListener, EventRecord, RuntimeEvent};
use pvm_core::execution::ExecutionNode;
use pvm_core::types::ExecutionId;
use pvm_core::{ProcessEngine, ProcessEngineBuilder};
use std::sync::{Arc, Mutex};

/// Collects every dispatched event.
#[derive(Default)]
pub struct RecordingListener {
    records: Mutex<Vec<EventRecord>>,
}

impl RecordingListener {
    pub fn events(&self) -> Vec<RuntimeEvent> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.event.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.records.lock().unwrap().clear();
    }
}

impl EventListener for RecordingListener {
    fn on_event(&self, record: &EventRecord) {
        self.records.lock().unwrap().push(record.clone());
    }
}

pub struct TestEngine {
    pub engine: ProcessEngine,
    pub clock: Arc<ManualClock>,
    pub events: Arc<RecordingListener>,
}

/// Engine on a fresh memory store, a manual clock and a recording listener.
/// `customize` can add handlers or tweak config before the engine is built.
pub fn engine(customize: impl FnOnce(ProcessEngineBuilder) -> ProcessEngineBuilder) -> TestEngine {
    let clock = Arc::new(ManualClock::starting_now());
    let events = Arc::new(RecordingListener::default());
    let builder = ProcessEngine::builder()
        .config(EngineConfig::default())
        .clock(clock.clone())
        .listener(events.clone());
    TestEngine {
        engine: customize(builder).build(),
        clock,
        events,
    }
}

/// Active executions at `activity`, depth first.
pub fn active_at(view: &ProcessInstanceView, activity: &str) -> Vec<ExecutionId> {
    let mut out = Vec::new();
    collect(&view.root, activity, &mut out);
    out
}

fn collect(node: &ExecutionNode, activity: &str, out: &mut Vec<ExecutionId>) {
    if node.is_active && node.activity_id == activity {
        out.push(node.id);
    }
    for c in &node.children {
        collect(c, activity, out);
    }
}
