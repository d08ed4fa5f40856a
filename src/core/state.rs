//! Execution state models

use crate::core::properties::PropertyBag;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Result of a step or a whole build, ordered by severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BuildResult {
    /// The step ran and succeeded
    Success,
    /// The step did not run
    Skipped,
    /// The action ran and reported failure (non-zero exit)
    Failure,
    /// The action could not run (worker unreachable, spawn error, bad template)
    Exception,
    /// The run was cancelled
    Cancelled,
}

impl BuildResult {
    /// The more severe of two results
    pub fn worst(self, other: BuildResult) -> BuildResult {
        self.max(other)
    }

    pub fn is_success(self) -> bool {
        self == BuildResult::Success
    }

    /// Whether a step with this result counts as "not successful"
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            BuildResult::Failure | BuildResult::Exception | BuildResult::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BuildResult::Success => "success",
            BuildResult::Skipped => "skipped",
            BuildResult::Failure => "failure",
            BuildResult::Exception => "exception",
            BuildResult::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<BuildResult> {
        match s {
            "success" => Some(BuildResult::Success),
            "skipped" => Some(BuildResult::Skipped),
            "failure" => Some(BuildResult::Failure),
            "exception" => Some(BuildResult::Exception),
            "cancelled" => Some(BuildResult::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for BuildResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a build's ordered step log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    /// Step name
    pub name: String,

    /// Outcome
    pub result: BuildResult,

    /// Why the step failed or was skipped
    pub reason: Option<String>,

    /// Captured stdout of remote commands
    pub output: String,

    /// Exit code of the remote command, if one ran
    pub exit_code: Option<i32>,

    pub started_at: Option<DateTime<Utc>>,

    pub finished_at: Option<DateTime<Utc>>,

    /// Builds started by this step (trigger steps only)
    pub triggered: Vec<Uuid>,
}

impl StepRecord {
    /// A step that never ran
    pub fn skipped(name: &str, reason: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            result: BuildResult::Skipped,
            reason: Some(reason.into()),
            output: String::new(),
            exit_code: None,
            started_at: None,
            finished_at: None,
            triggered: Vec::new(),
        }
    }
}

/// The terminal report of one builder run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRecord {
    /// Unique execution ID
    pub execution_id: Uuid,

    /// Builder that ran
    pub builder: String,

    /// Per-builder build number
    pub build_number: u64,

    /// Build whose trigger step started this one
    pub parent: Option<Uuid>,

    /// Worker the build ran on
    pub worker: Option<String>,

    /// Terminal status
    pub status: BuildResult,

    /// Properties at the end of the run
    pub properties: PropertyBag,

    /// Ordered per-step log
    pub steps: Vec<StepRecord>,

    /// Synchronously triggered child builds
    pub children: Vec<BuildRecord>,

    /// Fire-and-forget children (their records are reported separately)
    pub detached: Vec<Uuid>,

    /// Why the build could not run its steps (no worker, lock timeout, ...)
    pub error: Option<String>,

    pub started_at: DateTime<Utc>,

    pub completed_at: DateTime<Utc>,
}

impl BuildRecord {
    /// A record for a build that is about to start
    pub fn start(execution_id: Uuid, builder: &str, parent: Option<Uuid>) -> Self {
        let now = Utc::now();
        Self {
            execution_id,
            builder: builder.to_string(),
            build_number: 0,
            parent,
            worker: None,
            status: BuildResult::Success,
            properties: PropertyBag::new(),
            steps: Vec::new(),
            children: Vec::new(),
            detached: Vec::new(),
            error: None,
            started_at: now,
            completed_at: now,
        }
    }

    /// Look up a step record by name
    pub fn step(&self, name: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Names of the steps that actually ran, in order
    pub fn executed_steps(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| s.result != BuildResult::Skipped)
            .map(|s| s.name.as_str())
            .collect()
    }

    /// This record and all synchronous descendants, depth first
    pub fn flatten(&self) -> Vec<&BuildRecord> {
        let mut out = vec![self];
        for child in &self.children {
            out.extend(child.flatten());
        }
        out
    }

    /// Find a synchronous descendant (or self) by builder name
    pub fn find_builder(&self, builder: &str) -> Option<&BuildRecord> {
        self.flatten().into_iter().find(|r| r.builder == builder)
    }

    /// Fraction of steps that ran (0.0 to 1.0)
    pub fn progress(&self) -> f64 {
        if self.steps.is_empty() {
            return 0.0;
        }
        self.executed_steps().len() as f64 / self.steps.len() as f64
    }
}
