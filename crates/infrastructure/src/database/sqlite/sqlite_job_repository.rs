use async_trait::async_trait;
use jobs_core::models::{Concurrency, Job, JobStatus, MisfirePolicy};
use jobs_core::traits::JobRepository;
use jobs_core::{JobError, JobResult};
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};

const JOB_COLUMNS: &str = "id, name, job_group, invoke_target, invoke_params, cron_expression, \
     misfire_policy, concurrency, status, remark, created_by, created_at, updated_by, updated_at";

pub struct SqliteJobRepository {
    pool: SqlitePool,
}

impl SqliteJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> JobResult<Job> {
        Ok(Job {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            group: row.try_get("job_group")?,
            invoke_target: row.try_get("invoke_target")?,
            invoke_params: row.try_get("invoke_params")?,
            cron_expression: row.try_get("cron_expression")?,
            misfire_policy: MisfirePolicy::try_from(row.try_get::<i32, _>("misfire_policy")?)?,
            concurrency: Concurrency::try_from(row.try_get::<i32, _>("concurrency")?)?,
            status: JobStatus::try_from(row.try_get::<i32, _>("status")?)?,
            remark: row.try_get("remark")?,
            created_by: row.try_get("created_by")?,
            created_at: row.try_get("created_at")?,
            updated_by: row.try_get("updated_by")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl JobRepository for SqliteJobRepository {
    #[instrument(skip(self, job), fields(job_name = %job.name))]
    async fn create(&self, job: &Job) -> JobResult<Job> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO jobs (name, job_group, invoke_target, invoke_params, cron_expression,
                              misfire_policy, concurrency, status, remark, created_by, created_at,
                              updated_by, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(&job.name)
        .bind(&job.group)
        .bind(&job.invoke_target)
        .bind(&job.invoke_params)
        .bind(&job.cron_expression)
        .bind(job.misfire_policy.code())
        .bind(job.concurrency.code())
        .bind(job.status.code())
        .bind(&job.remark)
        .bind(&job.created_by)
        .bind(job.created_at)
        .bind(&job.updated_by)
        .bind(job.updated_at)
        .fetch_one(&self.pool)
        .await?;

        let created = Self::row_to_job(&row)?;
        debug!("创建任务记录: id={}", created.id);
        Ok(created)
    }

    #[instrument(skip(self), fields(job_id = %id))]
    async fn get_by_id(&self, id: i64) -> JobResult<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_job).transpose()
    }

    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn update(&self, job: &Job) -> JobResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET name = ?, job_group = ?, invoke_target = ?, invoke_params = ?,
                cron_expression = ?, misfire_policy = ?, concurrency = ?, status = ?,
                remark = ?, updated_by = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&job.name)
        .bind(&job.group)
        .bind(&job.invoke_target)
        .bind(&job.invoke_params)
        .bind(&job.cron_expression)
        .bind(job.misfire_policy.code())
        .bind(job.concurrency.code())
        .bind(job.status.code())
        .bind(&job.remark)
        .bind(&job.updated_by)
        .bind(job.updated_at)
        .bind(job.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(JobError::JobNotFound { id: job.id });
        }
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %id))]
    async fn delete(&self, id: i64) -> JobResult<()> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(JobError::JobNotFound { id });
        }
        Ok(())
    }

    async fn list_enabled(&self) -> JobResult<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status = ? ORDER BY id"
        ))
        .bind(JobStatus::Enabled.code())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_job).collect()
    }
}
