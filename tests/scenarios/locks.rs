//! Test: Locks - mutual exclusion of builds sharing a resource key

use crate::helpers::*;
use jobgraph::core::BuildResult;
use jobgraph::execution::ExecutionEvent;
use std::time::Duration;

fn yaml(lock_wait_secs: u64) -> String {
    format!(
        r#"
name: "Test: Locks"
settings:
  workers: [{{ name: worker1, max_builds: 4 }}]
  lock_wait_secs: {lock_wait_secs}
builders:
  - name: test
    locks: ["vm:%(prop:box)s"]
    steps:
      - name: run tests
        shell: "make test BOX=%(prop:box)s"
      - name: release vm
        trigger:
          schedulers: [release]
          wait_for_finish: true
          copy_properties: [box]
  - name: release
    locks: ["vm:%(prop:box)s", ""]
    steps:
      - name: remove lock file
        shell: "rm -f %(prop:box)s.lock"
schedulers:
  - {{ name: release, kind: triggerable, builders: [release] }}
"#
    )
}

/// Lock events in emission order as (kind, execution, keys)
fn lock_events(events: &[ExecutionEvent]) -> Vec<(&'static str, uuid::Uuid, Vec<String>)> {
    events
        .iter()
        .filter_map(|e| match e {
            ExecutionEvent::LocksAcquired { execution_id, keys } => {
                Some(("acquired", *execution_id, keys.clone()))
            }
            ExecutionEvent::LocksReleased { execution_id, keys } => {
                Some(("released", *execution_id, keys.clone()))
            }
            _ => None,
        })
        .collect()
}

/// Test that builds sharing a key never hold it at the same time
#[tokio::test]
async fn test_same_key_serializes_builds() {
    let worker = MockWorker::new("worker1").delay_on("make test", Duration::from_millis(50));
    let engine = engine_with(&yaml(60), &[worker.clone()]);
    let events = record_events(&engine).await;

    let (first, second) = tokio::join!(
        engine.invoke("test", props(&[("box", "centos_8")])),
        engine.invoke("test", props(&[("box", "centos_8")])),
    );
    assert_build_status(&first.unwrap(), BuildResult::Success);
    assert_build_status(&second.unwrap(), BuildResult::Success);

    let events = events.lock().unwrap();
    let locks = lock_events(&events);
    assert_eq!(locks.len(), 4, "one acquire and release per build: {:?}", locks);
    assert_eq!(locks[0].0, "acquired");
    assert_eq!(locks[1].0, "released");
    assert_eq!(locks[0].1, locks[1].1);
    assert_eq!(locks[2].0, "acquired");
    assert_eq!(locks[3].0, "released");
    assert_eq!(locks[2].2, vec!["vm:centos_8".to_string()]);
    assert_eq!(worker.count("make test"), 2);
}

/// Test that builds with different keys overlap
#[tokio::test]
async fn test_different_keys_run_concurrently() {
    let worker = MockWorker::new("worker1").delay_on("make test", Duration::from_millis(50));
    let engine = engine_with(&yaml(60), &[worker]);
    let events = record_events(&engine).await;

    let (first, second) = tokio::join!(
        engine.invoke("test", props(&[("box", "centos_8")])),
        engine.invoke("test", props(&[("box", "rocky_9")])),
    );
    assert_build_status(&first.unwrap(), BuildResult::Success);
    assert_build_status(&second.unwrap(), BuildResult::Success);

    let events = events.lock().unwrap();
    let kinds: Vec<&str> = lock_events(&events).iter().map(|l| l.0).collect();
    assert_eq!(kinds, vec!["acquired", "acquired", "released", "released"]);
}

/// Test that a build giving up on its lock ends in an exception without running steps
#[tokio::test]
async fn test_lock_wait_timeout_is_exception() {
    let worker = MockWorker::new("worker1").delay_on("make test", Duration::from_millis(100));
    let engine = engine_with(&yaml(0), &[worker.clone()]);

    let (first, second) = tokio::join!(
        engine.invoke("test", props(&[("box", "centos_8")])),
        engine.invoke("test", props(&[("box", "centos_8")])),
    );
    let mut statuses = vec![first.unwrap(), second.unwrap()];
    statuses.sort_by_key(|r| r.status);

    assert_build_status(&statuses[0], BuildResult::Success);
    let blocked = &statuses[1];
    assert_build_status(blocked, BuildResult::Exception);
    assert!(blocked.steps.is_empty());
    let error = blocked.error.as_deref().unwrap_or_default();
    assert!(error.contains("vm:centos_8"), "unexpected error: {}", error);
    assert_eq!(worker.count("make test"), 1);
}

/// Test that a waiting child re-enters its parent's lock
#[tokio::test]
async fn test_sync_child_reenters_parent_lock() {
    let engine = engine_with(&yaml(0), &[MockWorker::new("worker1")]);
    let events = record_events(&engine).await;

    let record = engine
        .invoke("test", props(&[("box", "centos_8")]))
        .await
        .unwrap();

    assert_build_status(&record, BuildResult::Success);
    assert_build_status(child(&record, "release"), BuildResult::Success);

    // the child takes nothing new; the empty key is dropped
    let events = events.lock().unwrap();
    let locks = lock_events(&events);
    assert_eq!(locks.len(), 2);
    assert_eq!(locks[0].1, record.execution_id);
    assert!(!engine.locks().is_held("vm:centos_8"));
}

/// Test that locks are released when the build fails
#[tokio::test]
async fn test_locks_released_on_failure() {
    let worker = MockWorker::new("worker1").exit_on("make test", 1);
    let engine = engine_with(&yaml(0), &[worker]);

    let first = engine
        .invoke("test", props(&[("box", "centos_8")]))
        .await
        .unwrap();
    assert_build_status(&first, BuildResult::Failure);
    assert!(!engine.locks().is_held("vm:centos_8"));

    let second = engine
        .invoke("test", props(&[("box", "centos_8")]))
        .await
        .unwrap();
    assert_build_status(&second, BuildResult::Failure);
    assert!(second.error.is_none());
}
