//! Workers: hosts that run the remote commands of a build

pub mod local;
pub mod pool;

use crate::core::step::GitMode;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

pub use local::LocalWorker;
pub use pool::{WorkerLease, WorkerPool};

/// Infrastructure errors: the action could not run at all
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker '{0}' is unreachable")]
    Unreachable(String),

    #[error("failed to start '{command}': {reason}")]
    Spawn { command: String, reason: String },

    #[error("timed out after {0} seconds")]
    Timeout(u64),

    #[error("no worker available for builder '{builder}' after {waited_secs} seconds")]
    NoneAvailable { builder: String, waited_secs: u64 },

    #[error("internal worker error: {0}")]
    Internal(String),
}

/// A command to run on a worker
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    /// Program and arguments
    pub argv: Vec<String>,

    /// Working directory (created when missing)
    pub workdir: PathBuf,

    /// Complete environment of the process
    pub env: BTreeMap<String, String>,

    pub timeout_secs: u64,
}

impl CommandSpec {
    /// The command as a single display line
    pub fn display(&self) -> String {
        self.argv.join(" ")
    }
}

/// Result of a command that ran to completion
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    /// Exit code (-1 when killed by a signal)
    pub exit_code: i32,

    pub stdout: String,

    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A repository checkout to perform on a worker
#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutSpec {
    pub repository: String,

    /// Branch to check out; the remote default when absent
    pub branch: Option<String>,

    pub mode: GitMode,

    /// Checkout directory
    pub destination: PathBuf,

    /// Directory the git commands run from
    pub workdir: PathBuf,

    pub env: BTreeMap<String, String>,

    pub timeout_secs: u64,
}

const INCREMENTAL_CHECKOUT: &str = r#"if [ -d "$3/.git" ]; then
  cd "$3" && git remote set-url origin "$1" && git fetch origin ${2:+"$2"} && git checkout -f FETCH_HEAD
else
  git clone ${2:+--branch "$2"} "$1" "$3"
fi"#;

const FULL_CHECKOUT: &str = r#"rm -rf "$3" && git clone ${2:+--branch "$2"} "$1" "$3""#;

impl CheckoutSpec {
    /// The checkout as a shell command; arguments are passed positionally
    pub fn to_command(&self) -> CommandSpec {
        let script = match self.mode {
            GitMode::Incremental => INCREMENTAL_CHECKOUT,
            GitMode::Full => FULL_CHECKOUT,
        };
        CommandSpec {
            argv: vec![
                "sh".to_string(),
                "-c".to_string(),
                script.to_string(),
                "git-checkout".to_string(),
                self.repository.clone(),
                self.branch.clone().unwrap_or_default(),
                self.destination.display().to_string(),
            ],
            workdir: self.workdir.clone(),
            env: self.env.clone(),
            timeout_secs: self.timeout_secs,
        }
    }
}

/// Trait for worker execution - allows for different implementations
#[async_trait]
pub trait WorkerExecutor: Send + Sync {
    /// Worker name
    fn name(&self) -> &str;

    /// Run a command and capture its output
    ///
    /// A non-zero exit is a normal `Ok` result; `Err` means the command
    /// could not be run or did not finish in time.
    async fn run_command(&self, spec: &CommandSpec) -> Result<CommandOutput, WorkerError>;

    /// Clone or update a repository
    async fn checkout(&self, spec: &CheckoutSpec) -> Result<CommandOutput, WorkerError> {
        self.run_command(&spec.to_command()).await
    }
}
