//! Persistence layer for build history

#[cfg(feature = "sqlite")]
pub mod store;

#[cfg(feature = "sqlite")]
pub use store::SqliteHistoryStore;

use crate::core::state::{BuildRecord, BuildResult};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Summary of one finished build
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildSummary {
    /// Unique execution ID
    pub execution_id: Uuid,

    /// Builder name
    pub builder: String,

    /// Per-builder build number
    pub build_number: u64,

    /// Triggering build, if any
    pub parent: Option<Uuid>,

    /// Worker the build ran on
    pub worker: Option<String>,

    /// Terminal status
    pub status: BuildResult,

    /// When the build started
    pub started_at: DateTime<Utc>,

    /// When the build finished
    pub completed_at: DateTime<Utc>,

    /// Number of steps that ran
    pub executed_steps: usize,

    /// Total number of steps
    pub total_steps: usize,

    /// Why the build could not run its steps
    pub error: Option<String>,
}

impl BuildSummary {
    pub fn from_record(record: &BuildRecord) -> Self {
        Self {
            execution_id: record.execution_id,
            builder: record.builder.clone(),
            build_number: record.build_number,
            parent: record.parent,
            worker: record.worker.clone(),
            status: record.status,
            started_at: record.started_at,
            completed_at: record.completed_at,
            executed_steps: record.executed_steps().len(),
            total_steps: record.steps.len(),
            error: record.error.clone(),
        }
    }

    /// Fraction of steps that ran (0.0 to 1.0)
    pub fn progress(&self) -> f64 {
        if self.total_steps == 0 {
            return 0.0;
        }
        self.executed_steps as f64 / self.total_steps as f64
    }
}

/// Summaries of a build and its synchronous descendants
pub fn summarize(record: &BuildRecord) -> Vec<BuildSummary> {
    record.flatten().into_iter().map(BuildSummary::from_record).collect()
}

/// Trait for persistence backends
#[async_trait::async_trait]
pub trait PersistenceBackend: Send + Sync {
    /// Save a finished build
    async fn save_build(&self, build: &BuildSummary) -> Result<()>;

    /// Load a build by ID
    async fn load_build(&self, execution_id: Uuid) -> Result<Option<BuildSummary>>;

    /// List builds of a builder, newest first
    async fn list_builds(&self, builder: &str) -> Result<Vec<BuildSummary>>;

    /// List all builder names with history
    async fn list_builders(&self) -> Result<Vec<String>>;
}

/// In-memory persistence (for testing or ephemeral use)
pub struct InMemoryPersistence {
    builds: tokio::sync::RwLock<std::collections::HashMap<Uuid, BuildSummary>>,
    by_builder: tokio::sync::RwLock<std::collections::BTreeMap<String, Vec<Uuid>>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self {
            builds: tokio::sync::RwLock::new(std::collections::HashMap::new()),
            by_builder: tokio::sync::RwLock::new(std::collections::BTreeMap::new()),
        }
    }
}

impl Default for InMemoryPersistence {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl PersistenceBackend for InMemoryPersistence {
    async fn save_build(&self, build: &BuildSummary) -> Result<()> {
        let mut builds = self.builds.write().await;
        let replaced = builds.insert(build.execution_id, build.clone()).is_some();

        if !replaced {
            let mut by_builder = self.by_builder.write().await;
            by_builder
                .entry(build.builder.clone())
                .or_default()
                .push(build.execution_id);
        }

        Ok(())
    }

    async fn load_build(&self, execution_id: Uuid) -> Result<Option<BuildSummary>> {
        let builds = self.builds.read().await;
        Ok(builds.get(&execution_id).cloned())
    }

    async fn list_builds(&self, builder: &str) -> Result<Vec<BuildSummary>> {
        let builds = self.builds.read().await;
        let by_builder = self.by_builder.read().await;

        let mut result: Vec<BuildSummary> = by_builder
            .get(builder)
            .map(|ids| ids.iter().filter_map(|id| builds.get(id).cloned()).collect())
            .unwrap_or_default();
        result.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(result)
    }

    async fn list_builders(&self) -> Result<Vec<String>> {
        let by_builder = self.by_builder.read().await;
        Ok(by_builder.keys().cloned().collect())
    }
}
