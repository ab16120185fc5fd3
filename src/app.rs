use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use jobs_core::config::AppConfig;
use jobs_core::models::{JobRun, StepEvent};
use jobs_core::traits::{JobRepository, JobRunRepository, JobStepRepository, LockStore};
use jobs_engine::{DistributedLock, ExecutionEngine, ExecutorRegistry, JobScheduler, LogStreamHub};
use jobs_infrastructure::{
    DatabaseManager, InMemoryJobRepository, InMemoryJobRunRepository, InMemoryJobStepRepository,
    InMemoryLockStore, RedisLockStore,
};
use tokio::sync::broadcast;
use tracing::{info, warn};

struct Repositories {
    jobs: Arc<dyn JobRepository>,
    runs: Arc<dyn JobRunRepository>,
    steps: Arc<dyn JobStepRepository>,
    database: Option<DatabaseManager>,
}

async fn create_repositories(config: &AppConfig) -> Result<Repositories> {
    if config.database.is_memory() {
        info!("使用进程内存储，重启后数据丢失");
        return Ok(Repositories {
            jobs: Arc::new(InMemoryJobRepository::new()),
            runs: Arc::new(InMemoryJobRunRepository::new()),
            steps: Arc::new(InMemoryJobStepRepository::new()),
            database: None,
        });
    }

    let database = DatabaseManager::new(&config.database)
        .await
        .context("连接数据库失败")?;
    database.migrate().await.context("初始化数据库表结构失败")?;
    info!("数据库连接成功: {}", config.database.url);

    Ok(Repositories {
        jobs: database.job_repository(),
        runs: database.job_run_repository(),
        steps: database.job_step_repository(),
        database: Some(database),
    })
}

async fn create_lock_store(config: &AppConfig) -> Result<Arc<dyn LockStore>> {
    if !config.cache.enabled {
        warn!("未启用共享缓存，任务锁只在本进程内生效");
        return Ok(Arc::new(InMemoryLockStore::new()));
    }

    let store = RedisLockStore::new(&config.cache)
        .await
        .context("连接Redis失败")?;
    info!("分布式锁使用Redis: {}", config.cache.redis_url);
    Ok(Arc::new(store))
}

/// 主应用程序
pub struct Application {
    scheduler: JobScheduler,
    runs: Arc<dyn JobRunRepository>,
    database: Option<DatabaseManager>,
}

impl Application {
    pub async fn new(config: AppConfig) -> Result<Self> {
        let repos = create_repositories(&config).await?;
        let lock_store = create_lock_store(&config).await?;

        let registry = Arc::new(ExecutorRegistry::new());
        jobs_executors::register_builtin(&registry).context("注册内置执行器失败")?;
        info!("已注册执行器: {:?}", registry.keys());

        let engine = ExecutionEngine::new(
            registry,
            Arc::clone(&repos.runs),
            repos.steps,
            LogStreamHub::new(config.scheduler.stream_buffer_size),
        )
        .with_lock(DistributedLock::new(
            lock_store,
            config.scheduler.default_lock_ttl(),
        ))
        .with_exception_max_chars(config.scheduler.exception_max_chars);

        let scheduler = JobScheduler::new(
            repos.jobs,
            Arc::clone(&repos.runs),
            engine,
            config.scheduler.clone(),
        );

        Ok(Self {
            scheduler,
            runs: repos.runs,
            database: repos.database,
        })
    }

    pub fn scheduler(&self) -> &JobScheduler {
        &self.scheduler
    }

    /// 启动调度器，收到关闭信号后停止
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        self.scheduler.start().await.context("启动调度器失败")?;
        info!("调度服务已启动");

        // 发送端被丢弃同样视为关闭
        let _ = shutdown_rx.recv().await;

        info!("开始停止调度器");
        self.scheduler.stop().await;
        self.close().await;
        Ok(())
    }

    /// 手动触发一次执行，把日志事件交给 `on_event`，返回执行结束后的记录
    pub async fn trigger_once<F>(&self, job_id: i64, mut on_event: F) -> Result<JobRun>
    where
        F: FnMut(&StepEvent) -> Result<()>,
    {
        let run_id = self
            .scheduler
            .trigger_job(job_id, None)
            .await
            .with_context(|| format!("触发任务失败: job_id={job_id}"))?;

        let mut stream = self
            .scheduler
            .stream_with_heartbeat(run_id)
            .await
            .with_context(|| format!("订阅执行日志失败: run_id={run_id}"))?;
        while let Some(event) = stream.next().await {
            on_event(&event)?;
        }
        let run = self.load_run(run_id).await?;

        self.close().await;
        Ok(run)
    }

    async fn load_run(&self, run_id: i64) -> Result<JobRun> {
        self.runs
            .get_by_id(run_id)
            .await?
            .with_context(|| format!("执行记录不存在: run_id={run_id}"))
    }

    async fn close(&self) {
        if let Some(database) = &self.database {
            database.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobs_core::config::MEMORY_DATABASE_URL;
    use jobs_core::models::{Job, RunStatus, StepEventKind};

    fn memory_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.database.url = MEMORY_DATABASE_URL.to_string();
        config
    }

    #[tokio::test]
    async fn test_trigger_once_runs_builtin_executor() {
        let app = Application::new(memory_config()).await.unwrap();
        let job = app
            .scheduler()
            .create_job(Job::new("冒烟", "noop", "0 0 3 * * *").with_params(r#"{"a":1}"#))
            .await
            .unwrap();

        let mut kinds = Vec::new();
        let run = app
            .trigger_once(job.id, |event| {
                kinds.push(event.kind);
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(kinds.first(), Some(&StepEventKind::Connected));
    }

    #[tokio::test]
    async fn test_trigger_unknown_job_fails() {
        let app = Application::new(memory_config()).await.unwrap();
        assert!(app.trigger_once(99, |_| Ok(())).await.is_err());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_signal() {
        let app = Application::new(memory_config()).await.unwrap();
        let (tx, rx) = broadcast::channel(1);
        tx.send(()).unwrap();
        app.run(rx).await.unwrap();
        assert!(!app.scheduler().is_running());
    }

    #[tokio::test]
    async fn test_sqlite_database_is_bootstrapped() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.database.url = format!("sqlite://{}", dir.path().join("jobs.db").display());

        let app = Application::new(config).await.unwrap();
        let job = app
            .scheduler()
            .create_job(Job::new("持久化", "noop", "0 0 3 * * *"))
            .await
            .unwrap();
        assert!(job.id > 0);
    }
}
