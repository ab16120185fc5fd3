use async_trait::async_trait;
use jobs_core::models::{JobStep, StepCompletion, StepStatus};
use jobs_core::traits::JobStepRepository;
use jobs_core::{JobError, JobResult};
use sqlx::{Row, SqlitePool};
use tracing::instrument;

const STEP_COLUMNS: &str =
    "id, run_id, ordinal, name, status, output, error, started_at, finished_at, duration_ms";

pub struct SqliteJobStepRepository {
    pool: SqlitePool,
}

impl SqliteJobStepRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_step(row: &sqlx::sqlite::SqliteRow) -> JobResult<JobStep> {
        let status: String = row.try_get("status")?;
        Ok(JobStep {
            id: row.try_get("id")?,
            run_id: row.try_get("run_id")?,
            ordinal: row.try_get("ordinal")?,
            name: row.try_get("name")?,
            status: status.parse::<StepStatus>()?,
            output: row.try_get("output")?,
            error: row.try_get("error")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            duration_ms: row.try_get("duration_ms")?,
        })
    }
}

#[async_trait]
impl JobStepRepository for SqliteJobStepRepository {
    #[instrument(skip(self, step), fields(run_id = %step.run_id, ordinal = step.ordinal))]
    async fn create(&self, step: &JobStep) -> JobResult<JobStep> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO job_steps (run_id, ordinal, name, status, output, error, started_at,
                                   finished_at, duration_ms)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING {STEP_COLUMNS}
            "#
        ))
        .bind(step.run_id)
        .bind(step.ordinal)
        .bind(&step.name)
        .bind(step.status.as_str())
        .bind(&step.output)
        .bind(&step.error)
        .bind(step.started_at)
        .bind(step.finished_at)
        .bind(step.duration_ms)
        .fetch_one(&self.pool)
        .await?;

        Self::row_to_step(&row)
    }

    #[instrument(skip(self, completion), fields(step_id = %id, status = %completion.status))]
    async fn finish(&self, id: i64, completion: &StepCompletion) -> JobResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE job_steps
            SET status = ?, output = ?, error = ?, finished_at = ?, duration_ms = ?
            WHERE id = ?
            "#,
        )
        .bind(completion.status.as_str())
        .bind(&completion.output)
        .bind(&completion.error)
        .bind(completion.finished_at)
        .bind(completion.duration_ms)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(JobError::StepNotFound { id });
        }
        Ok(())
    }

    async fn list_by_run(&self, run_id: i64) -> JobResult<Vec<JobStep>> {
        let rows = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM job_steps WHERE run_id = ? ORDER BY ordinal"
        ))
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_step).collect()
    }
}
