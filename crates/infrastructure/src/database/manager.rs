use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use jobs_core::config::DatabaseConfig;
use jobs_core::traits::{JobRepository, JobRunRepository, JobStepRepository};
use jobs_core::{JobError, JobResult};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{debug, info};

use super::sqlite::{SqliteJobRepository, SqliteJobRunRepository, SqliteJobStepRepository};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        job_group TEXT NOT NULL DEFAULT 'DEFAULT',
        invoke_target TEXT NOT NULL,
        invoke_params TEXT NOT NULL DEFAULT '',
        cron_expression TEXT NOT NULL,
        misfire_policy INTEGER NOT NULL DEFAULT 0,
        concurrency INTEGER NOT NULL DEFAULT 0,
        status INTEGER NOT NULL DEFAULT 0,
        remark TEXT,
        created_by TEXT,
        created_at TEXT NOT NULL,
        updated_by TEXT,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS job_runs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id INTEGER NOT NULL,
        job_name TEXT NOT NULL,
        job_group TEXT NOT NULL,
        invoke_target TEXT NOT NULL,
        invoke_params TEXT NOT NULL DEFAULT '',
        trigger_source TEXT NOT NULL,
        status INTEGER NOT NULL,
        message TEXT,
        exception TEXT,
        created_at TEXT NOT NULL,
        finished_at TEXT,
        elapsed_ms INTEGER
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_job_runs_job_status ON job_runs (job_id, status)",
    r#"
    CREATE TABLE IF NOT EXISTS job_steps (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id INTEGER NOT NULL,
        ordinal INTEGER NOT NULL,
        name TEXT NOT NULL,
        status TEXT NOT NULL,
        output TEXT,
        error TEXT,
        started_at TEXT NOT NULL,
        finished_at TEXT,
        duration_ms INTEGER,
        UNIQUE (run_id, ordinal)
    )
    "#,
];

/// SQLite连接池和仓储工厂
pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    pub async fn new(config: &DatabaseConfig) -> JobResult<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        if let Some(parent) = options.get_filename().parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    JobError::Configuration(format!(
                        "创建数据库目录失败 {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
            .connect_with(options)
            .await?;

        info!("数据库连接池已创建: {}", config.url);
        Ok(Self { pool })
    }

    /// 单连接的内存数据库，连接不回收，数据随连接池存活
    pub async fn in_memory() -> JobResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// 初始化表结构，可重复执行
    pub async fn migrate(&self) -> JobResult<()> {
        debug!("初始化数据库表结构");
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn health_check(&self) -> JobResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub fn job_repository(&self) -> Arc<dyn JobRepository> {
        Arc::new(SqliteJobRepository::new(self.pool.clone()))
    }

    pub fn job_run_repository(&self) -> Arc<dyn JobRunRepository> {
        Arc::new(SqliteJobRunRepository::new(self.pool.clone()))
    }

    pub fn job_step_repository(&self) -> Arc<dyn JobStepRepository> {
        Arc::new(SqliteJobStepRepository::new(self.pool.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_migrate_is_idempotent() {
        let db = DatabaseManager::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        db.migrate().await.unwrap();
        db.health_check().await.unwrap();

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE 'job%' ORDER BY name",
        )
        .fetch_all(db.pool())
        .await
        .unwrap();
        let names: Vec<&str> = tables.iter().map(|(n,)| n.as_str()).collect();
        assert_eq!(names, vec!["job_runs", "job_steps", "jobs"]);
    }

    #[tokio::test]
    async fn test_file_database_creates_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("jobs.db");
        let config = DatabaseConfig {
            url: format!("sqlite://{}", path.display()),
            ..DatabaseConfig::default()
        };

        let db = DatabaseManager::new(&config).await.unwrap();
        db.migrate().await.unwrap();
        assert!(path.exists());
        db.close().await;
    }
}
