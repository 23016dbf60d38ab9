mod common;

use common::engine;
use pvm_core::clock::Clock;
use pvm_core::config::EngineConfig;
use pvm_core::graph::{Activity, Behavior, ProcessGraphBuilder};
use pvm_core::jobexecutor::JobExecutor;
use pvm_core::store::JobQuery;
use pvm_core::types::add_duration;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn counted_engine(calls: Arc<AtomicUsize>) -> common::TestEngine {
    let t = engine(move |b| {
        let mut config = EngineConfig::default();
        config.job_executor.pool_size = 16;
        b.config(config).handler_fn("work", move |_ctx| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    });
    t.engine
        .deploy(
            ProcessGraphBuilder::new("batch")
                .initial("start")
                .automatic("start")
                .activity(
                    Activity::new("work", Behavior::Automatic { parallel: false })
                        .async_before()
                        .with_handler("work"),
                )
                .end("end")
                .transition("start", "work")
                .transition("work", "end")
                .build()
                .unwrap(),
        )
        .unwrap();
    t
}

#[tokio::test]
async fn a_job_raced_by_two_nodes_runs_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let t = counted_engine(calls.clone());
    for _ in 0..5 {
        t.engine.start_process("batch", BTreeMap::new()).await.unwrap();
    }

    // Node b read the candidates before node a locked them.
    let now = t.clock.now();
    let seen_by_b = t.engine.store().query_due_jobs(now, 10).await.unwrap();
    assert_eq!(seen_by_b.len(), 5);

    let node_a = JobExecutor::with_owner(t.engine.clone(), "node-a");
    let stats = node_a.poll_once().await.unwrap();
    assert_eq!(stats.acquired, 5);

    let expiry = add_duration(now, Duration::from_secs(60));
    for job in &seen_by_b {
        let won = t
            .engine
            .store()
            .try_acquire_job(job.id, job.revision, "node-b", expiry, now)
            .await
            .unwrap();
        assert!(!won, "stale revision must lose the CAS");
    }

    node_a.wait_idle().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 5);
    assert!(t.engine.jobs(JobQuery::default()).await.unwrap().is_empty());
}

#[tokio::test]
async fn batch_size_bounds_one_cycle() {
    let calls = Arc::new(AtomicUsize::new(0));
    let t = counted_engine(calls.clone());
    for _ in 0..12 {
        t.engine.start_process("batch", BTreeMap::new()).await.unwrap();
    }

    let executor = JobExecutor::with_owner(t.engine.clone(), "node-a");
    let first = executor.poll_once().await.unwrap();
    assert_eq!(first.fetched, 10);
    executor.wait_idle().await.unwrap();

    let second = executor.poll_once().await.unwrap();
    assert_eq!(second.fetched, 2);
    executor.wait_idle().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 12);
}

#[tokio::test]
async fn expired_lock_of_a_crashed_node_is_taken_over() {
    let calls = Arc::new(AtomicUsize::new(0));
    let t = counted_engine(calls.clone());
    t.engine.start_process("batch", BTreeMap::new()).await.unwrap();

    // A node locks the job and dies without running it.
    let now = t.clock.now();
    let job = t.engine.jobs(JobQuery::default()).await.unwrap().remove(0);
    let lock = t.engine.config().job_executor.lock_duration();
    assert!(t
        .engine
        .store()
        .try_acquire_job(job.id, job.revision, "crashed", add_duration(now, lock), now)
        .await
        .unwrap());

    let survivor = JobExecutor::with_owner(t.engine.clone(), "survivor");
    assert_eq!(survivor.poll_once().await.unwrap().acquired, 0);

    t.clock.advance(lock + Duration::from_secs(1));
    assert_eq!(survivor.poll_once().await.unwrap().acquired, 1);
    survivor.wait_idle().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
