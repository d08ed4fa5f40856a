//! Step domain model

use crate::core::{
    config::StepConfig,
    properties::PropertyBag,
    render::{RenderError, Renderable},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A remote command, either a shell line or an argv list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandLine {
    /// Run through `sh -c`
    Line(String),
    /// Run directly
    Argv(Vec<Renderable>),
}

impl CommandLine {
    /// Render into an argv vector
    pub fn render(&self, bag: &PropertyBag) -> Result<Vec<String>, RenderError> {
        match self {
            CommandLine::Line(line) => {
                let rendered = Renderable::interpolate(line.clone()).render_string(bag)?;
                Ok(vec!["sh".to_string(), "-c".to_string(), rendered])
            }
            CommandLine::Argv(args) => args.iter().map(|a| a.render_string(bag)).collect(),
        }
    }

    fn renderables(&self) -> Vec<Renderable> {
        match self {
            CommandLine::Line(line) => vec![Renderable::interpolate(line.clone())],
            CommandLine::Argv(args) => args.clone(),
        }
    }
}

/// How a checkout updates the working copy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GitMode {
    /// Reuse an existing clone, fetch and check out
    #[default]
    Incremental,
    /// Remove the working copy and clone from scratch
    Full,
}

/// Source checkout parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GitSource {
    pub repository: Renderable,

    /// Branch or revision; the remote default branch when absent
    #[serde(default)]
    pub branch: Option<Renderable>,

    #[serde(default)]
    pub mode: GitMode,

    /// Checkout directory, relative to the build directory
    #[serde(default = "default_checkout_dir")]
    pub workdir: String,
}

fn default_checkout_dir() -> String {
    "build".to_string()
}

/// A trigger of one or more schedulers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerSpec {
    /// Schedulers to fire
    pub schedulers: Vec<String>,

    /// Suspend until the triggered builds finish and fold in their result
    #[serde(default)]
    pub wait_for_finish: bool,

    /// Parent properties copied into the child (when present)
    #[serde(default)]
    pub copy_properties: Vec<String>,

    /// Properties computed from the parent bag, overriding copied ones
    #[serde(default)]
    pub set_properties: BTreeMap<String, Renderable>,
}

/// The action a step performs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    SetProperty {
        property: String,
        value: Renderable,
    },
    SetProperties(BTreeMap<String, Renderable>),
    /// Run a command and store its trimmed stdout
    SetPropertyFromCommand {
        property: String,
        command: CommandLine,
    },
    Shell(CommandLine),
    Git(GitSource),
    Trigger(TriggerSpec),
}

impl StepAction {
    /// Name used when the configuration does not give one
    pub fn default_name(&self) -> String {
        match self {
            StepAction::SetProperty { property, .. } => format!("Set property {}", property),
            StepAction::SetProperties(_) => "Set properties".to_string(),
            StepAction::SetPropertyFromCommand { property, .. } => {
                format!("Set property {} from command", property)
            }
            StepAction::Shell(_) => "shell".to_string(),
            StepAction::Git(_) => "git".to_string(),
            StepAction::Trigger(spec) => format!("Trigger {}", spec.schedulers.join(", ")),
        }
    }

    /// Every renderable value the action reads
    pub fn renderables(&self) -> Vec<Renderable> {
        match self {
            StepAction::SetProperty { value, .. } => vec![value.clone()],
            StepAction::SetProperties(map) => map.values().cloned().collect(),
            StepAction::SetPropertyFromCommand { command, .. } => command.renderables(),
            StepAction::Shell(command) => command.renderables(),
            StepAction::Git(source) => {
                let mut out = vec![source.repository.clone()];
                out.extend(source.branch.clone());
                out
            }
            StepAction::Trigger(spec) => spec.set_properties.values().cloned().collect(),
        }
    }
}

/// Per-step failure policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailurePolicy {
    /// A failure aborts the remaining non-always-run steps
    pub halt_on_failure: bool,

    /// Runs even after the build halted or was cancelled
    pub always_run: bool,

    /// A failure marks the whole build as failed
    pub flunk_on_failure: bool,

    /// Skipped when the build is already failing
    pub skip_if_failed: bool,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self {
            halt_on_failure: false,
            always_run: false,
            flunk_on_failure: true,
            skip_if_failed: false,
        }
    }
}

/// A single step in a builder's sequence
#[derive(Debug, Clone)]
pub struct Step {
    pub name: String,

    pub action: StepAction,

    pub policy: FailurePolicy,

    /// Environment overrides on top of the builder's template
    pub env: BTreeMap<String, Renderable>,

    /// Working directory, relative to the build directory
    pub workdir: Option<Renderable>,

    /// Timeout in seconds
    pub timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct StepDefaults {
    pub timeout_secs: u64,
}

impl Default for StepDefaults {
    fn default() -> Self {
        Self {
            timeout_secs: 3600,
        }
    }
}

impl Step {
    /// Create a step from a step config
    pub fn from_config(config: &StepConfig, defaults: &StepDefaults) -> Self {
        Step {
            name: config
                .name
                .clone()
                .unwrap_or_else(|| config.action.default_name()),
            action: config.action.clone(),
            policy: FailurePolicy {
                halt_on_failure: config.halt_on_failure,
                always_run: config.always_run,
                flunk_on_failure: config.flunk_on_failure,
                skip_if_failed: config.skip_if_failed,
            },
            env: config.env.clone(),
            workdir: config.workdir.clone(),
            timeout_secs: config.timeout_secs.unwrap_or(defaults.timeout_secs),
        }
    }

    pub fn is_trigger(&self) -> bool {
        matches!(self.action, StepAction::Trigger(_))
    }

    /// Every renderable the step reads, including env and workdir
    pub fn renderables(&self) -> Vec<Renderable> {
        let mut out = self.action.renderables();
        out.extend(self.env.values().cloned());
        out.extend(self.workdir.clone());
        out
    }
}
