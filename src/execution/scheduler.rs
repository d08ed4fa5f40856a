//! Step scheduler - decides whether each step of a build runs

use crate::core::{state::BuildResult, step::FailurePolicy};
use std::fmt;

/// Why a step was not run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// An earlier step halted the build
    Halted,
    /// The build was cancelled
    Cancelled,
    /// The step skips itself once the build is failing
    UpstreamFailed,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Halted => f.write_str("build halted by an earlier step"),
            SkipReason::Cancelled => f.write_str("build cancelled"),
            SkipReason::UpstreamFailed => f.write_str("build already failing"),
        }
    }
}

/// Outcome of the per-step gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepDecision {
    Run,
    Skip(SkipReason),
}

/// Failure-policy state of one build
///
/// Steps are offered in declared order; `decide` gates each one and
/// `record` folds its result into the build status.
#[derive(Debug, Clone)]
pub struct StepScheduler {
    status: BuildResult,
    halted: bool,
    cancelled: bool,
}

impl Default for StepScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl StepScheduler {
    pub fn new() -> Self {
        Self {
            status: BuildResult::Success,
            halted: false,
            cancelled: false,
        }
    }

    /// Whether the next step runs
    pub fn decide(&self, policy: &FailurePolicy) -> StepDecision {
        if !policy.always_run {
            if self.cancelled {
                return StepDecision::Skip(SkipReason::Cancelled);
            }
            if self.halted {
                return StepDecision::Skip(SkipReason::Halted);
            }
        }
        if policy.skip_if_failed && self.status.is_failure() {
            return StepDecision::Skip(SkipReason::UpstreamFailed);
        }
        StepDecision::Run
    }

    /// Fold a step result into the build
    ///
    /// A failure worsens the build status when the step flunks; exceptions
    /// and cancellations always do. Exceptions always halt, failures halt
    /// only with `halt_on_failure`.
    pub fn record(&mut self, policy: &FailurePolicy, result: BuildResult) {
        match result {
            BuildResult::Success | BuildResult::Skipped => {}
            BuildResult::Failure => {
                if policy.flunk_on_failure {
                    self.status = self.status.worst(result);
                }
                if policy.halt_on_failure {
                    self.halted = true;
                }
            }
            BuildResult::Exception => {
                self.status = self.status.worst(result);
                self.halted = true;
            }
            BuildResult::Cancelled => self.cancel(),
        }
    }

    /// Stop running non-always-run steps
    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Current build status
    pub fn status(&self) -> BuildResult {
        if self.cancelled {
            BuildResult::Cancelled
        } else {
            self.status
        }
    }
}
