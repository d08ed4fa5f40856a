//! Test: Trigger Chain - the bundled maxscale pipelines end to end

use crate::helpers::*;
use jobgraph::core::{BuildResult, PropertyBag};
use jobgraph::execution::ExecutionEvent;

const MAXSCALE: &str = include_str!("../../pipelines/maxscale.yaml");

fn maxscale_worker() -> MockWorker {
    MockWorker::new("worker1")
        .stdout_on("$(pwd)/scripts", "/home/vagrant/scripts\n")
        .stdout_on("$(pwd)/workspace", "/home/vagrant/workspace\n")
}

/// Test the happy path: build then run_test, both on the caller's worker
#[tokio::test]
async fn test_build_and_test_runs_build_then_tests() {
    let worker = maxscale_worker();
    let engine = engine_with(MAXSCALE, &[worker.clone(), MockWorker::new("worker2")]);

    let record = engine
        .invoke("build_and_test", props(&[("branch", "develop"), ("box", "centos_8")]))
        .await
        .unwrap();

    assert_build_status(&record, BuildResult::Success);
    assert_executed_steps(
        &record,
        &[
            "Set the 'name' property",
            "Call the 'build' scheduler",
            "Call the 'run_test' scheduler",
        ],
    );

    let build = child(&record, "build");
    let run_test = child(&record, "run_test");
    assert_build_status(build, BuildResult::Success);
    assert_build_status(run_test, BuildResult::Success);
    assert_eq!(build.parent, Some(record.execution_id));
    assert_eq!(build.worker.as_deref(), Some("worker1"));
    assert_eq!(run_test.worker.as_deref(), Some("worker1"));

    // build, then its helpers, then the tests
    let lines = worker.command_lines();
    let position = |needle: &str| {
        lines
            .iter()
            .position(|l| l.contains(needle))
            .unwrap_or_else(|| panic!("'{}' never ran: {:#?}", needle, lines))
    };
    assert!(position("rsync") < position("run_build.sh"));
    assert!(position("run_build.sh") < position("mdbci destroy"));
    assert!(position("mdbci destroy") < position("run_test.sh"));
}

/// Test the properties each child of build_and_test receives
#[tokio::test]
async fn test_build_and_test_forwards_properties() {
    let worker = maxscale_worker();
    let engine = engine_with(MAXSCALE, &[worker.clone(), MockWorker::new("worker2")]);

    let record = engine
        .invoke("build_and_test", props(&[("branch", "develop"), ("box", "centos_8")]))
        .await
        .unwrap();

    let build = child(&record, "build");
    assert_property(build, "branch", "develop");
    assert_property(build, "box", "centos_8");
    assert_property(build, "target", "develop");
    assert_property(build, "name", "centos_8-build_and_test-1");
    assert_property(build, "virtual_builder_name", "Build for centos_8");
    assert_property(build, "SHELL_SCRIPTS_PATH", "/home/vagrant/scripts");
    assert_property(build, "BUILD_ID", "1001");
    assert_eq!(build.properties.source("virtual_builder_name"), Some("Trigger"));
    assert!(!build.properties.contains("test_branch"));

    let run_test = child(&record, "run_test");
    assert_property(run_test, "test_branch", "develop");
    assert_property(run_test, "box", "centos_8");
    assert_property(run_test, "host", "max-gcloud");
    assert_property(run_test, "test_set", "-L LIGHT");
    assert_property(run_test, "buildername", "run_test");
    assert!(!run_test.properties.contains("virtual_builder_name"));

    let test_command = worker
        .commands()
        .into_iter()
        .find(|c| c.command.contains("run_test.sh"))
        .unwrap();
    assert_eq!(test_command.env.get("test_branch").map(String::as_str), Some("develop"));
    assert_eq!(test_command.env.get("box").map(String::as_str), Some("centos_8"));
    assert_eq!(
        test_command.env.get("WORKSPACE").map(String::as_str),
        Some("workers/worker1/run_test/build")
    );
    assert_eq!(test_command.env.get("PATH").map(String::as_str), Some("/usr/local/bin:/usr/bin:/bin"));
    assert_eq!(test_command.env.get("backend_ssl").map(String::as_str), Some("no"));

    // unset properties drop their variable
    let build_command = worker
        .commands()
        .into_iter()
        .find(|c| c.command.contains("run_build.sh"))
        .unwrap();
    assert_eq!(build_command.env.get("BUILD_ID").map(String::as_str), Some("1001"));
    assert!(!build_command.env.contains_key("cmake_flags"));
    assert!(!build_command.env.contains_key("ci_url"));
}

/// Test that a failed build still cleans up but never starts the tests
#[tokio::test]
async fn test_failed_build_runs_cleanup_not_tests() {
    let worker = maxscale_worker().exit_on("run_build.sh", 1);
    let engine = engine_with(MAXSCALE, &[worker.clone(), MockWorker::new("worker2")]);

    let record = engine
        .invoke("build_and_test", props(&[("branch", "develop"), ("box", "centos_8")]))
        .await
        .unwrap();

    assert_build_status(&record, BuildResult::Failure);
    assert_step_result(&record, "Call the 'build' scheduler", BuildResult::Failure);
    assert_step_result(&record, "Call the 'run_test' scheduler", BuildResult::Skipped);

    let build = child(&record, "build");
    assert_build_status(build, BuildResult::Failure);
    assert_step_result(build, "Workspace cleanup", BuildResult::Success);
    assert_step_result(build, "Call the 'cleanup' scheduler", BuildResult::Success);
    assert_build_status(child(build, "cleanup"), BuildResult::Success);

    assert_eq!(worker.count("mdbci destroy"), 1);
    assert_eq!(worker.count("run_test.sh"), 0);
    assert!(record.find_builder("run_test").is_none());
}

/// Test that a synchronous trigger reports exactly its child's status
#[tokio::test]
async fn test_sync_trigger_takes_child_status() {
    let worker = maxscale_worker().exit_on("run_test.sh", 1);
    let engine = engine_with(MAXSCALE, &[worker, MockWorker::new("worker2")]);

    let record = engine
        .invoke("build_and_test", props(&[("branch", "develop"), ("box", "centos_8")]))
        .await
        .unwrap();

    let run_test = child(&record, "run_test");
    assert_build_status(run_test, BuildResult::Failure);
    assert_step_result(&record, "Call the 'run_test' scheduler", BuildResult::Failure);
    assert_build_status(&record, BuildResult::Failure);
    // lock release runs despite the failing tests
    assert_step_result(run_test, "Call the 'smart_remove_lock' scheduler", BuildResult::Success);
}

/// Test the order of build lifecycle events across the chain
#[tokio::test]
async fn test_chain_events() {
    let engine = engine_with(MAXSCALE, &[maxscale_worker(), MockWorker::new("worker2")]);
    let events = record_events(&engine).await;

    engine
        .invoke("build_and_test", props(&[("branch", "develop"), ("box", "centos_8")]))
        .await
        .unwrap();

    let started: Vec<String> = events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            ExecutionEvent::BuildStarted { builder, .. } => Some(builder.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(
        started,
        vec![
            "build_and_test",
            "build",
            "download_shell_scripts",
            "cleanup",
            "smart_remove_lock",
            "run_test",
            "smart_remove_lock",
        ]
    );

    let locks: Vec<Vec<String>> = events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            ExecutionEvent::LocksAcquired { keys, .. } => Some(keys.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(locks, vec![vec!["vm:centos_8-build_and_test-1".to_string()]]);
}

fn snapshot_properties() -> PropertyBag {
    props(&[
        ("box", "centos_8"),
        ("product", "mariadb"),
        ("version", "10.6"),
        ("name", "centos_8-develop"),
    ])
}

/// Test a forced snapshot run: lock key, VM name and its environment
#[tokio::test]
async fn test_snapshot_force_run() {
    let worker = maxscale_worker();
    let engine = engine_with(MAXSCALE, &[worker.clone(), MockWorker::new("worker2")]);
    let events = record_events(&engine).await;

    let records = engine
        .force("run_test_snapshot_force", snapshot_properties())
        .await
        .unwrap();

    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_build_status(record, BuildResult::Success);
    assert_property(record, "name", "centos_8-mariadb-10.6-permanent");
    assert_eq!(record.properties.source("name"), Some("Set the 'name' property"));

    let locks: Vec<Vec<String>> = events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            ExecutionEvent::LocksAcquired { keys, .. } => Some(keys.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(locks, vec![vec!["snapshot:centos_8-mariadb-10.6".to_string()]]);

    let test_command = worker
        .commands()
        .into_iter()
        .find(|c| c.command.contains("run_test_snapshot.sh"))
        .unwrap();
    assert_eq!(
        test_command.command,
        "sh -c sh maxscale-system-test/mdbci/run_test_snapshot.sh > workers/worker1/run_test_snapshot/build_log_1 2>&1"
    );
    let env = |key: &str| test_command.env.get(key).map(String::as_str);
    assert_eq!(env("name"), Some("centos_8-mariadb-10.6-permanent"));
    assert_eq!(env("test_branch"), Some("develop"));
    assert_eq!(env("BUILD_ID"), Some("run_test_snapshot-1"));
    assert_eq!(env("BUILD_NUMBER"), Some("1"));
    assert_eq!(
        env("BUILD_LOG_PARSING_RESULT"),
        Some("Build log parsing finished with an error")
    );
    assert_eq!(env("BUILD_TIMESTAMP").map(str::len), Some(19));
    assert!(!test_command.env.contains_key("ci_url"));
}

/// Test that result collection and cleanup follow a failing snapshot run
#[tokio::test]
async fn test_snapshot_failure_still_collects_results() {
    let worker = maxscale_worker().exit_on("run_test_snapshot.sh", 1);
    let engine = engine_with(MAXSCALE, &[worker.clone(), MockWorker::new("worker2")]);

    let records = engine
        .force("run_test_snapshot_force", snapshot_properties())
        .await
        .unwrap();
    let record = &records[0];

    assert_build_status(record, BuildResult::Failure);
    assert_step_result(record, "Run MaxScale tests using snapshots", BuildResult::Failure);
    for step in [
        "Parse ctest log",
        "Find coredumps",
        "Write build results",
        "Show test result",
        "Call the 'smart_remove_lock' scheduler",
        "Clean build directory",
    ] {
        assert_step_result(record, step, BuildResult::Success);
    }
    assert_build_status(child(record, "smart_remove_lock"), BuildResult::Success);

    let lines = worker.command_lines();
    let position = |needle: &str| {
        lines
            .iter()
            .position(|l| l.contains(needle))
            .unwrap_or_else(|| panic!("'{}' never ran: {:#?}", needle, lines))
    };
    assert!(position("run_test_snapshot.sh") < position("parse_ctest_log.rb"));
    assert!(position("parse_ctest_log.rb") < position("write_build_results.rb"));
    assert!(position("write_build_results.rb") < position("locks/centos_8.lock"));
    assert!(position("locks/centos_8.lock") < position("rm -rf workers/worker1/run_test_snapshot/build"));
}

/// Test that the performance results steps share the build's env file
#[tokio::test]
async fn test_performance_results_use_env_file() {
    let worker = maxscale_worker();
    let engine = engine_with(MAXSCALE, &[worker.clone(), MockWorker::new("worker2")]);

    let records = engine
        .force(
            "run_performance_test_force",
            props(&[("target", "develop"), ("version", "10.6"), ("perf_port", "4006")]),
        )
        .await
        .unwrap();

    assert_build_status(&records[0], BuildResult::Success);
    assert_property(
        &records[0],
        "networkConfigPath",
        ".config/performance_test/performance-test_network_config",
    );
    assert_eq!(worker.count("--server-config ~/.config/performance_test/performance-test_network_config"), 1);
    assert_eq!(
        worker.count("parse_log.rb -i workers/worker1/run_performance_test/results_1 -e workers/worker1/run_performance_test/env_1"),
        1
    );
    assert_eq!(
        worker.count("write_benchmark_results.rb -i workers/worker1/run_performance_test/json_1 -e workers/worker1/run_performance_test/env_1"),
        1
    );

    let bench = worker
        .commands()
        .into_iter()
        .find(|c| c.command.contains("performance_test -v"))
        .unwrap();
    assert_eq!(bench.env.get("perf_port").map(String::as_str), Some("4006"));
    assert_eq!(bench.env.get("BUILD_TIMESTAMP").map(String::len), Some(19));
}
