//! Local worker - runs commands as subprocesses on this host

use crate::worker::{CommandOutput, CommandSpec, WorkerError, WorkerExecutor};
use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Worker that executes commands on the master host
#[derive(Debug, Clone)]
pub struct LocalWorker {
    name: String,
}

impl LocalWorker {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl WorkerExecutor for LocalWorker {
    fn name(&self) -> &str {
        &self.name
    }

    /// Run a command in its working directory
    ///
    /// The child sees only `spec.env`. It is killed when the returned future
    /// is dropped, which is how in-flight commands are interrupted.
    async fn run_command(&self, spec: &CommandSpec) -> Result<CommandOutput, WorkerError> {
        let (program, args) = spec
            .argv
            .split_first()
            .ok_or_else(|| WorkerError::Internal("empty command".to_string()))?;

        tokio::fs::create_dir_all(&spec.workdir).await.map_err(|e| {
            WorkerError::Internal(format!(
                "failed to create {}: {}",
                spec.workdir.display(),
                e
            ))
        })?;

        debug!(worker = %self.name, command = %spec.display(), "Spawning command");

        let result = timeout(
            Duration::from_secs(spec.timeout_secs),
            Command::new(program)
                .args(args)
                .current_dir(&spec.workdir)
                .env_clear()
                .envs(&spec.env)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| WorkerError::Timeout(spec.timeout_secs))?;

        let output = result.map_err(|e| WorkerError::Spawn {
            command: program.clone(),
            reason: e.to_string(),
        })?;

        let exit_code = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if exit_code != 0 {
            warn!(worker = %self.name, exit_code, "{}: {}", spec.display(), stderr.trim());
        }

        Ok(CommandOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr,
        })
    }
}
