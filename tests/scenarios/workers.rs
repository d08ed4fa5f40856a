//! Test: Workers - assignment, capacity and fire-and-forget children

use crate::helpers::*;
use jobgraph::core::BuildResult;
use std::path::PathBuf;
use std::time::Duration;

const YAML: &str = r#"
name: "Test: Workers"
settings:
  workers:
    - { name: worker1 }
    - { name: worker2 }
  basedir: /var/lib/ci
  worker_wait_secs: 0
builders:
  - name: any
    steps:
      - name: work
        shell: "work.sh"
  - name: pinned
    workers: [worker2]
    steps:
      - name: work
        shell: "pinned.sh"
  - name: parent
    workers: [worker1]
    steps:
      - name: sync pinned
        trigger:
          schedulers: [pinned]
          wait_for_finish: true
      - name: notify
        trigger:
          schedulers: [notify]
      - name: after
        shell: "after.sh"
  - name: notify
    steps:
      - name: mail
        shell: "mail.sh"
schedulers:
  - { name: pinned, kind: triggerable, builders: [pinned] }
  - { name: notify, kind: triggerable, builders: [notify] }
"#;

fn workers() -> (MockWorker, MockWorker) {
    (
        MockWorker::new("worker1").delay_on("work.sh", Duration::from_millis(50)),
        MockWorker::new("worker2").delay_on("work.sh", Duration::from_millis(50)),
    )
}

/// Test that a restricted builder runs on its worker in its own directory
#[tokio::test]
async fn test_builder_worker_restriction() {
    let (worker1, worker2) = workers();
    let engine = engine_with(YAML, &[worker1.clone(), worker2.clone()]);

    let record = engine.invoke("pinned", props(&[])).await.unwrap();

    assert_build_status(&record, BuildResult::Success);
    assert_eq!(record.worker.as_deref(), Some("worker2"));
    assert_property(&record, "workername", "worker2");
    assert_property(&record, "builddir", "/var/lib/ci/worker2/pinned");
    assert!(worker1.commands().is_empty());
    assert_eq!(
        worker2.commands()[0].workdir,
        PathBuf::from("/var/lib/ci/worker2/pinned/build")
    );
}

/// Test that concurrent builds spread over idle workers
#[tokio::test]
async fn test_least_loaded_assignment() {
    let (worker1, worker2) = workers();
    let engine = engine_with(YAML, &[worker1.clone(), worker2.clone()]);

    let (first, second) = tokio::join!(
        engine.invoke("any", props(&[])),
        engine.invoke("any", props(&[])),
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(first.worker.as_deref(), Some("worker1"));
    assert_eq!(second.worker.as_deref(), Some("worker2"));
    assert_eq!(worker1.count("work.sh"), 1);
    assert_eq!(worker2.count("work.sh"), 1);
}

/// Test that a build finding no free worker in time ends in an exception
#[tokio::test]
async fn test_no_worker_available() {
    let (worker1, worker2) = workers();
    let engine = engine_with(YAML, &[worker1, worker2]);

    let (first, second, third) = tokio::join!(
        engine.invoke("any", props(&[])),
        engine.invoke("any", props(&[])),
        engine.invoke("any", props(&[])),
    );

    assert_build_status(&first.unwrap(), BuildResult::Success);
    assert_build_status(&second.unwrap(), BuildResult::Success);
    let third = third.unwrap();
    assert_build_status(&third, BuildResult::Exception);
    assert!(third.steps.is_empty());
    assert_eq!(
        third.error.as_deref(),
        Some("no worker available for builder 'any' after 0 seconds")
    );
}

/// Test that a waiting child outside its parent's pool takes its own worker
#[tokio::test]
async fn test_sync_child_on_other_worker() {
    let (worker1, worker2) = workers();
    let engine = engine_with(YAML, &[worker1.clone(), worker2.clone()]);

    let record = engine.invoke("parent", props(&[])).await.unwrap();

    assert_build_status(&record, BuildResult::Success);
    assert_eq!(record.worker.as_deref(), Some("worker1"));
    let pinned = child(&record, "pinned");
    assert_eq!(pinned.worker.as_deref(), Some("worker2"));
    assert_eq!(worker2.count("pinned.sh"), 1);
    assert_eq!(worker1.count("after.sh"), 1);
}

/// Test that fire-and-forget children do not hold up or affect the caller
#[tokio::test]
async fn test_async_trigger_detaches_child() {
    let (worker1, worker2) = workers();
    let engine = engine_with(YAML, &[worker1, worker2]);

    let record = engine.invoke("parent", props(&[])).await.unwrap();

    assert_build_status(&record, BuildResult::Success);
    assert_step_result(&record, "notify", BuildResult::Success);
    assert_eq!(record.detached.len(), 1);
    assert!(record.find_builder("notify").is_none());
    assert_eq!(
        record.step("notify").unwrap().triggered,
        record.detached
    );

    let background = engine.wait_background().await;
    assert_eq!(background.len(), 1);
    let notify = &background[0];
    assert_eq!(notify.builder, "notify");
    assert_eq!(notify.execution_id, record.detached[0]);
    assert_eq!(notify.parent, Some(record.execution_id));
    assert_build_status(notify, BuildResult::Success);

    assert!(engine.wait_background().await.is_empty());
}
