use async_trait::async_trait;
use jobs_core::models::{JobRun, RunCompletion, RunStatus, TriggerSource};
use jobs_core::traits::JobRunRepository;
use jobs_core::{JobError, JobResult};
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};

const RUN_COLUMNS: &str = "id, job_id, job_name, job_group, invoke_target, invoke_params, \
     trigger_source, status, message, exception, created_at, finished_at, elapsed_ms";

pub struct SqliteJobRunRepository {
    pool: SqlitePool,
}

impl SqliteJobRunRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_run(row: &sqlx::sqlite::SqliteRow) -> JobResult<JobRun> {
        let trigger: String = row.try_get("trigger_source")?;
        Ok(JobRun {
            id: row.try_get("id")?,
            job_id: row.try_get("job_id")?,
            job_name: row.try_get("job_name")?,
            job_group: row.try_get("job_group")?,
            invoke_target: row.try_get("invoke_target")?,
            invoke_params: row.try_get("invoke_params")?,
            trigger: trigger.parse::<TriggerSource>()?,
            status: RunStatus::try_from(row.try_get::<i32, _>("status")?)?,
            message: row.try_get("message")?,
            exception: row.try_get("exception")?,
            created_at: row.try_get("created_at")?,
            finished_at: row.try_get("finished_at")?,
            elapsed_ms: row.try_get("elapsed_ms")?,
        })
    }
}

#[async_trait]
impl JobRunRepository for SqliteJobRunRepository {
    #[instrument(skip(self, run), fields(job_id = %run.job_id, trigger = run.trigger.as_str()))]
    async fn create(&self, run: &JobRun) -> JobResult<JobRun> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO job_runs (job_id, job_name, job_group, invoke_target, invoke_params,
                                  trigger_source, status, message, exception, created_at,
                                  finished_at, elapsed_ms)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(run.job_id)
        .bind(&run.job_name)
        .bind(&run.job_group)
        .bind(&run.invoke_target)
        .bind(&run.invoke_params)
        .bind(run.trigger.as_str())
        .bind(run.status.code())
        .bind(&run.message)
        .bind(&run.exception)
        .bind(run.created_at)
        .bind(run.finished_at)
        .bind(run.elapsed_ms)
        .fetch_one(&self.pool)
        .await?;

        let created = Self::row_to_run(&row)?;
        debug!("创建执行记录: run_id={}", created.id);
        Ok(created)
    }

    #[instrument(skip(self), fields(run_id = %id))]
    async fn get_by_id(&self, id: i64) -> JobResult<Option<JobRun>> {
        let row = sqlx::query(&format!("SELECT {RUN_COLUMNS} FROM job_runs WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_run).transpose()
    }

    /// 只更新仍处于运行中的记录，保证终态只写入一次
    #[instrument(skip(self, completion), fields(run_id = %id, status = %completion.status))]
    async fn finish(&self, id: i64, completion: &RunCompletion) -> JobResult<()> {
        if !completion.status.is_terminal() {
            return Err(JobError::InvalidArgument(
                "执行记录只能转换为成功或失败".to_string(),
            ));
        }

        let result = sqlx::query(
            r#"
            UPDATE job_runs
            SET status = ?, message = ?, exception = ?, finished_at = ?, elapsed_ms = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(completion.status.code())
        .bind(&completion.message)
        .bind(&completion.exception)
        .bind(completion.finished_at)
        .bind(completion.elapsed_ms)
        .bind(id)
        .bind(RunStatus::Running.code())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.get_by_id(id).await? {
                Some(run) => Err(JobError::Conflict(format!(
                    "执行记录 {} 已处于终态 {}",
                    id, run.status
                ))),
                None => Err(JobError::RunNotFound { id }),
            };
        }
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %job_id, status = %status))]
    async fn latest_by_status(
        &self,
        job_id: i64,
        status: RunStatus,
    ) -> JobResult<Option<JobRun>> {
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM job_runs WHERE job_id = ? AND status = ? \
             ORDER BY id DESC LIMIT 1"
        ))
        .bind(job_id)
        .bind(status.code())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_run).transpose()
    }

    #[instrument(skip(self), fields(job_id = %job_id, limit = limit))]
    async fn list_by_job(&self, job_id: i64, limit: usize) -> JobResult<Vec<JobRun>> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM job_runs WHERE job_id = ? ORDER BY id DESC LIMIT ?"
        ))
        .bind(job_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_run).collect()
    }
}
