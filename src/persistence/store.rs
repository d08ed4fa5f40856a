//! SQLite-based build history store

use crate::core::state::BuildResult;
use crate::persistence::{BuildSummary, PersistenceBackend};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// SQLite build history store
pub struct SqliteHistoryStore {
    pool: SqlitePool,
}

impl SqliteHistoryStore {
    /// Open (or create) a store at the given path
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(dir) = db_path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options)
            .await
            .with_context(|| format!("Failed to open history database {}", db_path.display()))?;

        let store = Self { pool };
        store.init().await?;

        Ok(store)
    }

    /// A store that lives only as long as this value
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new().in_memory(true);
        // every connection to :memory: is a separate database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("Failed to open in-memory database")?;

        let store = Self { pool };
        store.init().await?;

        Ok(store)
    }

    /// Default database location in the user's data directory
    pub fn default_path() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("jobgraph")
            .join("history.db")
    }

    /// Create store with the configured path, or the default one
    pub async fn open(configured: Option<&Path>) -> Result<Self> {
        match configured {
            Some(path) => Self::new(path).await,
            None => Self::new(&Self::default_path()).await,
        }
    }

    /// Initialize database schema
    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS builds (
                id TEXT PRIMARY KEY,
                builder TEXT NOT NULL,
                build_number INTEGER NOT NULL,
                parent TEXT,
                worker TEXT,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT NOT NULL,
                executed_steps INTEGER NOT NULL DEFAULT 0,
                total_steps INTEGER NOT NULL DEFAULT 0,
                error TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_builder ON builds(builder);
            CREATE INDEX IF NOT EXISTS idx_started_at ON builds(started_at);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn to_naive(dt: DateTime<Utc>) -> NaiveDateTime {
        dt.naive_utc()
    }

    fn from_naive(dt: NaiveDateTime) -> DateTime<Utc> {
        DateTime::from_naive_utc_and_offset(dt, Utc)
    }

    fn summary_from_row(row: &SqliteRow) -> Result<BuildSummary> {
        let status: String = row.get("status");
        let parent: Option<String> = row.get("parent");

        Ok(BuildSummary {
            execution_id: Uuid::parse_str(&row.get::<String, _>("id"))?,
            builder: row.get("builder"),
            build_number: row.get::<i64, _>("build_number") as u64,
            parent: parent.as_deref().map(Uuid::parse_str).transpose()?,
            worker: row.get("worker"),
            status: BuildResult::parse(&status).ok_or_else(|| anyhow!("Unknown build status '{}'", status))?,
            started_at: Self::from_naive(row.get("started_at")),
            completed_at: Self::from_naive(row.get("completed_at")),
            executed_steps: row.get::<i64, _>("executed_steps") as usize,
            total_steps: row.get::<i64, _>("total_steps") as usize,
            error: row.get("error"),
        })
    }
}

#[async_trait::async_trait]
impl PersistenceBackend for SqliteHistoryStore {
    async fn save_build(&self, build: &BuildSummary) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO builds
            (id, builder, build_number, parent, worker, status, started_at, completed_at, executed_steps, total_steps, error)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(build.execution_id.to_string())
        .bind(&build.builder)
        .bind(build.build_number as i64)
        .bind(build.parent.map(|p| p.to_string()))
        .bind(&build.worker)
        .bind(build.status.as_str())
        .bind(Self::to_naive(build.started_at))
        .bind(Self::to_naive(build.completed_at))
        .bind(build.executed_steps as i64)
        .bind(build.total_steps as i64)
        .bind(&build.error)
        .execute(&self.pool)
        .await
        .context("Failed to save build")?;

        Ok(())
    }

    async fn load_build(&self, execution_id: Uuid) -> Result<Option<BuildSummary>> {
        let row = sqlx::query("SELECT * FROM builds WHERE id = ?1")
            .bind(execution_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load build")?;

        row.as_ref().map(Self::summary_from_row).transpose()
    }

    async fn list_builds(&self, builder: &str) -> Result<Vec<BuildSummary>> {
        let rows = sqlx::query("SELECT * FROM builds WHERE builder = ?1 ORDER BY started_at DESC")
            .bind(builder)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list builds")?;

        rows.iter().map(Self::summary_from_row).collect()
    }

    async fn list_builders(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT DISTINCT builder FROM builds ORDER BY builder ASC")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list builders")?;

        Ok(rows.iter().map(|row| row.get("builder")).collect())
    }
}
