//! Master configuration from YAML

use crate::core::{
    builder::WorkerSelection,
    master::Master,
    properties::PropertyValue,
    render::Renderable,
    schedulers::SchedulerKind,
    step::StepAction,
};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Top-level master configuration loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Master name
    pub name: String,

    /// Explicit runtime settings
    #[serde(default)]
    pub settings: Settings,

    /// Builder definitions
    pub builders: Vec<BuilderConfig>,

    /// Scheduler definitions
    #[serde(default)]
    pub schedulers: Vec<SchedulerConfig>,
}

/// Runtime settings handed to the engine at startup
///
/// Nothing is read from the host process environment: commands see exactly
/// `environment` plus what builders and steps add.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Workers available to builders
    #[serde(default)]
    pub workers: Vec<WorkerConfig>,

    /// Root of the per-builder build directories
    #[serde(default = "default_basedir")]
    pub basedir: PathBuf,

    /// Base environment of every remote command
    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    /// Step timeout when a step does not set one (in seconds)
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,

    /// Nesting limit of trigger steps
    #[serde(default = "default_max_trigger_depth")]
    pub max_trigger_depth: usize,

    /// How long a build waits for a free worker slot (in seconds)
    #[serde(default = "default_worker_wait_secs")]
    pub worker_wait_secs: u64,

    /// How long a build waits for its resource locks (in seconds)
    #[serde(default = "default_lock_wait_secs")]
    pub lock_wait_secs: u64,

    /// Run history database; the per-user default when unset
    #[serde(default)]
    pub history_db: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            workers: Vec::new(),
            basedir: default_basedir(),
            environment: BTreeMap::new(),
            default_timeout_secs: default_timeout_secs(),
            max_trigger_depth: default_max_trigger_depth(),
            worker_wait_secs: default_worker_wait_secs(),
            lock_wait_secs: default_lock_wait_secs(),
            history_db: None,
        }
    }
}

fn default_basedir() -> PathBuf {
    PathBuf::from("workers")
}

fn default_timeout_secs() -> u64 {
    3600
}

fn default_max_trigger_depth() -> usize {
    8
}

fn default_worker_wait_secs() -> u64 {
    600
}

fn default_lock_wait_secs() -> u64 {
    3600
}

fn default_true() -> bool {
    true
}

fn default_max_builds() -> usize {
    1
}

/// Worker declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub name: String,

    /// Concurrent builds the worker accepts
    #[serde(default = "default_max_builds")]
    pub max_builds: usize,
}

/// Builder configuration as defined in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuilderConfig {
    /// Unique builder name
    pub name: String,

    /// Workers the builder may run on (all workers when empty)
    #[serde(default)]
    pub workers: Vec<String>,

    #[serde(default)]
    pub next_worker: WorkerSelection,

    #[serde(default)]
    pub tags: Vec<String>,

    /// Environment template (variable name -> property reference or literal)
    #[serde(default)]
    pub env: BTreeMap<String, Renderable>,

    /// Properties that override requested ones
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyValue>,

    /// Properties applied only when absent from the request
    #[serde(default)]
    pub default_properties: BTreeMap<String, PropertyValue>,

    /// Resource lock keys (templates)
    #[serde(default)]
    pub locks: Vec<Renderable>,

    /// Ordered step sequence
    pub steps: Vec<StepConfig>,
}

/// Scheduler configuration as defined in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub name: String,

    #[serde(flatten)]
    pub kind: SchedulerKind,

    /// Builders started by the scheduler
    pub builders: Vec<String>,

    #[serde(default)]
    pub properties: BTreeMap<String, PropertyValue>,
}

/// Step configuration as defined in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    /// Step name (derived from the action when absent)
    #[serde(default)]
    pub name: Option<String>,

    /// The step's action, keyed by its kind
    #[serde(flatten)]
    pub action: StepAction,

    #[serde(default)]
    pub halt_on_failure: bool,

    #[serde(default)]
    pub always_run: bool,

    #[serde(default = "default_true")]
    pub flunk_on_failure: bool,

    #[serde(default)]
    pub skip_if_failed: bool,

    /// Environment overrides
    #[serde(default)]
    pub env: BTreeMap<String, Renderable>,

    /// Working directory relative to the build directory
    #[serde(default)]
    pub workdir: Option<Renderable>,

    /// Timeout for this step (overrides the settings default)
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl MasterConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration {}", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("Invalid configuration {}", path.display()))
    }

    /// Parse configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: MasterConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.settings.workers.is_empty() {
            bail!("At least one worker must be declared");
        }
        if self.settings.max_trigger_depth == 0 {
            bail!("max_trigger_depth must be at least 1");
        }
        if self.settings.default_timeout_secs == 0 {
            bail!("default_timeout_secs must be at least 1");
        }

        let worker_names = unique_names(self.settings.workers.iter().map(|w| &w.name), "worker")?;
        for worker in &self.settings.workers {
            if worker.max_builds == 0 {
                bail!("Worker '{}' must accept at least one build", worker.name);
            }
        }

        let builder_names = unique_names(self.builders.iter().map(|b| &b.name), "builder")?;
        unique_names(self.schedulers.iter().map(|s| &s.name), "scheduler")?;

        let schedulers: HashMap<&str, &SchedulerConfig> =
            self.schedulers.iter().map(|s| (s.name.as_str(), s)).collect();

        for scheduler in &self.schedulers {
            if scheduler.builders.is_empty() {
                bail!("Scheduler '{}' starts no builders", scheduler.name);
            }
            for builder in &scheduler.builders {
                if !builder_names.contains(builder.as_str()) {
                    bail!(
                        "Scheduler '{}' references non-existent builder '{}'",
                        scheduler.name,
                        builder
                    );
                }
            }
        }

        for builder in &self.builders {
            for worker in &builder.workers {
                if !worker_names.contains(worker.as_str()) {
                    bail!(
                        "Builder '{}' references non-existent worker '{}'",
                        builder.name,
                        worker
                    );
                }
            }

            for (name, value) in &builder.env {
                value
                    .validate()
                    .with_context(|| format!("Builder '{}' env '{}'", builder.name, name))?;
            }
            for lock in &builder.locks {
                lock.validate()
                    .with_context(|| format!("Builder '{}' lock", builder.name))?;
            }

            if builder.steps.is_empty() {
                bail!("Builder '{}' has no steps", builder.name);
            }

            for (index, step) in builder.steps.iter().enumerate() {
                let label = step
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("#{}", index + 1));
                self.validate_step(&builder.name, &label, step, &schedulers)?;
            }
        }

        if let Some(cycle) = self.to_master().graph.find_sync_cycle() {
            bail!(
                "Synchronous trigger cycle between builders: {}",
                cycle.join(" -> ")
            );
        }

        Ok(())
    }

    fn validate_step(
        &self,
        builder: &str,
        label: &str,
        step: &StepConfig,
        schedulers: &HashMap<&str, &SchedulerConfig>,
    ) -> Result<()> {
        if step.timeout_secs == Some(0) {
            bail!("Step '{}' of builder '{}' has a zero timeout", label, builder);
        }

        match &step.action {
            StepAction::SetProperty { property, .. }
            | StepAction::SetPropertyFromCommand { property, .. } => {
                if property.trim().is_empty() {
                    bail!("Step '{}' of builder '{}' sets an empty property name", label, builder);
                }
            }
            StepAction::Trigger(spec) => {
                if spec.schedulers.is_empty() {
                    bail!("Trigger step '{}' of builder '{}' names no scheduler", label, builder);
                }
                for name in &spec.schedulers {
                    match schedulers.get(name.as_str()) {
                        None => bail!(
                            "Trigger step '{}' of builder '{}' references non-existent scheduler '{}'",
                            label,
                            builder,
                            name
                        ),
                        Some(s) if s.kind != SchedulerKind::Triggerable => bail!(
                            "Trigger step '{}' of builder '{}' references scheduler '{}' which is not triggerable",
                            label,
                            builder,
                            name
                        ),
                        Some(_) => {}
                    }
                }
            }
            _ => {}
        }

        let mut renderables = step.action.renderables();
        renderables.extend(step.env.values().cloned());
        renderables.extend(step.workdir.clone());
        for renderable in renderables {
            renderable
                .validate()
                .with_context(|| format!("Step '{}' of builder '{}'", label, builder))?;
        }

        Ok(())
    }

    /// Convert config to the domain model
    pub fn to_master(&self) -> Master {
        Master::from_config(self)
    }
}

fn unique_names<'a>(names: impl Iterator<Item = &'a String>, what: &str) -> Result<HashSet<&'a str>> {
    let mut seen = HashSet::new();
    for name in names {
        if name.trim().is_empty() {
            bail!("Empty {} name", what);
        }
        if !seen.insert(name.as_str()) {
            bail!("Duplicate {} name: {}", what, name);
        }
    }
    Ok(seen)
}
