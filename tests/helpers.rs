//! Test utility functions for jobgraph

use async_trait::async_trait;
use jobgraph::core::config::MasterConfig;
use jobgraph::core::{BuildRecord, BuildResult, Master, PropertyBag};
use jobgraph::execution::{ExecutionEngine, ExecutionEvent};
use jobgraph::worker::{CommandOutput, CommandSpec, WorkerError, WorkerExecutor, WorkerPool};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A command a mock worker was asked to run
#[derive(Debug, Clone)]
pub struct RecordedCommand {
    pub worker: String,
    pub command: String,
    pub workdir: PathBuf,
    pub env: BTreeMap<String, String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone)]
enum Rule {
    Exit(i32),
    Stdout(String),
    Delay(Duration),
    Unreachable,
}

/// Mock worker with scripted results keyed by command substring
///
/// Commands without a matching rule succeed with empty output. All clones
/// share the same command log.
#[derive(Clone)]
pub struct MockWorker {
    name: String,
    rules: Vec<(String, Rule)>,
    log: Arc<Mutex<Vec<RecordedCommand>>>,
}

impl MockWorker {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            rules: Vec::new(),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Exit with `code` when the command contains `pattern`
    pub fn exit_on(mut self, pattern: &str, code: i32) -> Self {
        self.rules.push((pattern.to_string(), Rule::Exit(code)));
        self
    }

    /// Print `stdout` when the command contains `pattern`
    pub fn stdout_on(mut self, pattern: &str, stdout: &str) -> Self {
        self.rules.push((pattern.to_string(), Rule::Stdout(stdout.to_string())));
        self
    }

    /// Take `delay` to finish when the command contains `pattern`
    pub fn delay_on(mut self, pattern: &str, delay: Duration) -> Self {
        self.rules.push((pattern.to_string(), Rule::Delay(delay)));
        self
    }

    /// Fail with an infrastructure error when the command contains `pattern`
    pub fn unreachable_on(mut self, pattern: &str) -> Self {
        self.rules.push((pattern.to_string(), Rule::Unreachable));
        self
    }

    /// Every command run so far, in order
    pub fn commands(&self) -> Vec<RecordedCommand> {
        self.log.lock().unwrap().clone()
    }

    /// Command lines run so far, in order
    pub fn command_lines(&self) -> Vec<String> {
        self.commands().into_iter().map(|c| c.command).collect()
    }

    /// How many commands contained `pattern`
    pub fn count(&self, pattern: &str) -> usize {
        self.command_lines().iter().filter(|c| c.contains(pattern)).count()
    }
}

#[async_trait]
impl WorkerExecutor for MockWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run_command(&self, spec: &CommandSpec) -> Result<CommandOutput, WorkerError> {
        let command = spec.display();
        self.log.lock().unwrap().push(RecordedCommand {
            worker: self.name.clone(),
            command: command.clone(),
            workdir: spec.workdir.clone(),
            env: spec.env.clone(),
            timeout_secs: spec.timeout_secs,
        });

        let mut output = CommandOutput::default();
        for (pattern, rule) in &self.rules {
            if !command.contains(pattern.as_str()) {
                continue;
            }
            match rule {
                Rule::Exit(code) => output.exit_code = *code,
                Rule::Stdout(stdout) => output.stdout = stdout.clone(),
                Rule::Delay(delay) => tokio::time::sleep(*delay).await,
                Rule::Unreachable => return Err(WorkerError::Unreachable(self.name.clone())),
            }
        }
        Ok(output)
    }
}

/// Parse a master configuration from YAML
pub fn master_from_yaml(yaml: &str) -> Master {
    MasterConfig::from_yaml(yaml)
        .unwrap_or_else(|e| panic!("Failed to parse master YAML: {:#}", e))
        .to_master()
}

/// An engine over mock workers; capacities come from the settings
pub fn engine_with(yaml: &str, workers: &[MockWorker]) -> ExecutionEngine {
    let master = master_from_yaml(yaml);
    let pool = WorkerPool::new(
        workers
            .iter()
            .map(|w| {
                let capacity = master
                    .settings
                    .workers
                    .iter()
                    .find(|c| c.name == w.name)
                    .map(|c| c.max_builds)
                    .unwrap_or(1);
                let executor: Arc<dyn WorkerExecutor> = Arc::new(w.clone());
                (executor, capacity)
            })
            .collect(),
    );
    ExecutionEngine::new(master, pool)
}

/// Build a property bag from string pairs
pub fn props(pairs: &[(&str, &str)]) -> PropertyBag {
    PropertyBag::from_pairs(pairs.iter().copied(), "Test")
}

/// Collect every event the engine emits
pub async fn record_events(engine: &ExecutionEngine) -> Arc<Mutex<Vec<ExecutionEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    engine
        .add_event_handler(move |event| sink.lock().unwrap().push(event))
        .await;
    events
}

fn describe(record: &BuildRecord) -> String {
    let steps: Vec<String> = record
        .steps
        .iter()
        .map(|s| format!("{}={}", s.name, s.result))
        .collect();
    format!(
        "{} #{} {} [{}]{}",
        record.builder,
        record.build_number,
        record.status,
        steps.join(", "),
        record
            .error
            .as_deref()
            .map(|e| format!(" error: {}", e))
            .unwrap_or_default()
    )
}

/// Assert the terminal status of a build
pub fn assert_build_status(record: &BuildRecord, expected: BuildResult) {
    assert_eq!(
        record.status,
        expected,
        "Build should be {}, but was: {}",
        expected,
        describe(record)
    );
}

/// Assert the result of a named step
pub fn assert_step_result(record: &BuildRecord, step: &str, expected: BuildResult) {
    let found = record
        .step(step)
        .unwrap_or_else(|| panic!("Step '{}' not found in {}", step, describe(record)));
    assert_eq!(
        found.result,
        expected,
        "Step '{}' should be {}, but was {} ({:?}) in {}",
        step,
        expected,
        found.result,
        found.reason,
        describe(record)
    );
}

/// Assert which steps ran, in order
pub fn assert_executed_steps(record: &BuildRecord, expected: &[&str]) {
    assert_eq!(
        record.executed_steps(),
        expected,
        "Unexpected executed steps in {}",
        describe(record)
    );
}

/// Find a synchronous descendant build by builder name
pub fn child<'a>(record: &'a BuildRecord, builder: &str) -> &'a BuildRecord {
    record
        .children
        .iter()
        .find(|c| c.builder == builder)
        .unwrap_or_else(|| panic!("No child build of '{}' in {}", builder, describe(record)))
}

/// Assert a property value of a finished build
pub fn assert_property(record: &BuildRecord, key: &str, expected: &str) {
    assert_eq!(
        record.properties.get_str(key),
        Some(expected),
        "Property '{}' of {} should be {:?}, bag: {:?}",
        key,
        record.builder,
        expected,
        record.properties.to_string_map()
    );
}
