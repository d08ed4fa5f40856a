//! Step executor - runs individual steps against a worker

use crate::{
    core::{
        builder::Builder,
        config::Settings,
        properties::{PropertyBag, PropertyValue},
        render::RenderError,
        state::BuildResult,
        step::{CommandLine, GitSource, Step, StepAction, TriggerSpec},
    },
    worker::{CheckoutSpec, CommandOutput, CommandSpec, WorkerError, WorkerExecutor},
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Working directory of commands, relative to the build directory
pub const DEFAULT_WORKDIR: &str = "build";

/// Outcome of a step that ran on a worker or in the master
#[derive(Debug, Clone)]
pub struct StepReport {
    pub result: BuildResult,

    /// Why the step did not succeed
    pub reason: Option<String>,

    /// Captured stdout
    pub output: String,

    pub exit_code: Option<i32>,

    /// Properties the step writes
    pub updates: BTreeMap<String, PropertyValue>,
}

impl StepReport {
    fn success() -> Self {
        Self {
            result: BuildResult::Success,
            reason: None,
            output: String::new(),
            exit_code: None,
            updates: BTreeMap::new(),
        }
    }

    fn exception(reason: impl Into<String>) -> Self {
        Self {
            result: BuildResult::Exception,
            reason: Some(reason.into()),
            ..Self::success()
        }
    }

    fn from_output(output: CommandOutput) -> Self {
        let (result, reason) = if output.success() {
            (BuildResult::Success, None)
        } else {
            (
                BuildResult::Failure,
                Some(format!("command exited with code {}", output.exit_code)),
            )
        };
        Self {
            result,
            reason,
            exit_code: Some(output.exit_code),
            output: output.stdout,
            updates: BTreeMap::new(),
        }
    }

    fn from_worker_error(error: WorkerError) -> Self {
        match error {
            WorkerError::Timeout(_) => Self {
                result: BuildResult::Failure,
                reason: Some(error.to_string()),
                ..Self::success()
            },
            other => Self::exception(other.to_string()),
        }
    }
}

impl From<RenderError> for StepReport {
    fn from(error: RenderError) -> Self {
        StepReport::exception(error.to_string())
    }
}

/// A trigger step resolved against the caller's bag
#[derive(Debug, Clone)]
pub struct TriggerRequest {
    pub schedulers: Vec<String>,

    /// Caller waits for the children
    pub wait_for_finish: bool,

    /// Initial bag of every child
    pub properties: PropertyBag,
}

/// Result of executing a step
#[derive(Debug, Clone)]
pub enum ExecutionResult {
    /// The step ran to a result
    Completed(StepReport),

    /// The step starts other builds; the engine runs them
    Trigger(TriggerRequest),
}

/// Executes a single step
pub struct StepExecutor {
    settings: Arc<Settings>,
}

impl StepExecutor {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self { settings }
    }

    /// Execute a step and return the result
    pub async fn execute(
        &self,
        builder: &Builder,
        step: &Step,
        bag: &PropertyBag,
        worker: &dyn WorkerExecutor,
        builddir: &Path,
    ) -> ExecutionResult {
        info!(builder = %builder.name, step = %step.name, "Executing step");

        let report = match &step.action {
            StepAction::Trigger(spec) => {
                return match Self::resolve_trigger(spec, bag) {
                    Ok(request) => ExecutionResult::Trigger(request),
                    Err(e) => ExecutionResult::Completed(e.into()),
                };
            }
            StepAction::SetProperty { property, value } => match value.render(bag) {
                Ok(value) => {
                    let mut report = StepReport::success();
                    report.updates.insert(property.clone(), value);
                    report
                }
                Err(e) => e.into(),
            },
            StepAction::SetProperties(values) => {
                let rendered: Result<BTreeMap<_, _>, RenderError> = values
                    .iter()
                    .map(|(k, v)| v.render(bag).map(|v| (k.clone(), v)))
                    .collect();
                match rendered {
                    Ok(updates) => StepReport {
                        updates,
                        ..StepReport::success()
                    },
                    Err(e) => e.into(),
                }
            }
            StepAction::SetPropertyFromCommand { property, command } => {
                let mut report = self.run(builder, step, command, bag, worker, builddir).await;
                if report.result.is_success() {
                    let value = report.output.trim().to_string();
                    debug!(property = %property, value = %value, "Property from command");
                    report.updates.insert(property.clone(), PropertyValue::String(value));
                }
                report
            }
            StepAction::Shell(command) => self.run(builder, step, command, bag, worker, builddir).await,
            StepAction::Git(source) => match self.checkout_spec(builder, step, source, bag, builddir) {
                Ok(spec) => match worker.checkout(&spec).await {
                    Ok(output) => StepReport::from_output(output),
                    Err(e) => StepReport::from_worker_error(e),
                },
                Err(e) => e.into(),
            },
        };

        if !report.result.is_success() {
            warn!(
                builder = %builder.name,
                step = %step.name,
                result = %report.result,
                "{}",
                report.reason.as_deref().unwrap_or("step did not succeed")
            );
        }
        ExecutionResult::Completed(report)
    }

    /// Run a remote command for a step
    async fn run(
        &self,
        builder: &Builder,
        step: &Step,
        command: &CommandLine,
        bag: &PropertyBag,
        worker: &dyn WorkerExecutor,
        builddir: &Path,
    ) -> StepReport {
        let spec = match self.command_spec(builder, step, command, bag, builddir) {
            Ok(spec) => spec,
            Err(e) => return e.into(),
        };
        match worker.run_command(&spec).await {
            Ok(output) => StepReport::from_output(output),
            Err(e) => StepReport::from_worker_error(e),
        }
    }

    /// Render a command with its environment and working directory
    pub fn command_spec(
        &self,
        builder: &Builder,
        step: &Step,
        command: &CommandLine,
        bag: &PropertyBag,
        builddir: &Path,
    ) -> Result<CommandSpec, RenderError> {
        let workdir = match &step.workdir {
            Some(w) => PathBuf::from(w.render_string(bag)?),
            None => PathBuf::from(DEFAULT_WORKDIR),
        };
        Ok(CommandSpec {
            argv: command.render(bag)?,
            workdir: builddir.join(workdir),
            env: builder.render_env(step, bag, &self.settings.environment)?,
            timeout_secs: step.timeout_secs,
        })
    }

    fn checkout_spec(
        &self,
        builder: &Builder,
        step: &Step,
        source: &GitSource,
        bag: &PropertyBag,
        builddir: &Path,
    ) -> Result<CheckoutSpec, RenderError> {
        let branch = match &source.branch {
            Some(b) => Some(b.render_string(bag)?).filter(|b| !b.is_empty()),
            None => None,
        };
        Ok(CheckoutSpec {
            repository: source.repository.render_string(bag)?,
            branch,
            mode: source.mode,
            destination: builddir.join(&source.workdir),
            workdir: builddir.to_path_buf(),
            env: builder.render_env(step, bag, &self.settings.environment)?,
            timeout_secs: step.timeout_secs,
        })
    }

    /// Compute what a trigger step starts: `forward(copy, overrides)`
    pub fn resolve_trigger(spec: &TriggerSpec, bag: &PropertyBag) -> Result<TriggerRequest, RenderError> {
        let mut overrides = BTreeMap::new();
        for (key, value) in &spec.set_properties {
            overrides.insert(key.clone(), value.render(bag)?);
        }
        Ok(TriggerRequest {
            schedulers: spec.schedulers.clone(),
            wait_for_finish: spec.wait_for_finish,
            properties: bag.forward(&spec.copy_properties, &overrides),
        })
    }
}
