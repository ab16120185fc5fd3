use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use jobs_core::models::{Job, JobRun, JobStep, RunCompletion, RunStatus, StepCompletion};
use jobs_core::traits::{JobRepository, JobRunRepository, JobStepRepository};
use jobs_core::{JobError, JobResult};
use tokio::sync::RwLock;
use tracing::debug;

/// 内存任务仓储
///
/// 单进程使用，重启后数据丢失。未配置数据库时和测试中使用。
#[derive(Debug)]
pub struct InMemoryJobRepository {
    jobs: RwLock<BTreeMap<i64, Job>>,
    next_id: AtomicI64,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(BTreeMap::new()),
            next_id: AtomicI64::new(1),
        }
    }
}

impl Default for InMemoryJobRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn create(&self, job: &Job) -> JobResult<Job> {
        let mut created = job.clone();
        created.id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.jobs.write().await.insert(created.id, created.clone());
        debug!("内存仓储创建任务: id={}", created.id);
        Ok(created)
    }

    async fn get_by_id(&self, id: i64) -> JobResult<Option<Job>> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn update(&self, job: &Job) -> JobResult<()> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&job.id) {
            Some(existing) => {
                *existing = job.clone();
                Ok(())
            }
            None => Err(JobError::JobNotFound { id: job.id }),
        }
    }

    async fn delete(&self, id: i64) -> JobResult<()> {
        self.jobs
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or(JobError::JobNotFound { id })
    }

    async fn list_enabled(&self) -> JobResult<Vec<Job>> {
        Ok(self
            .jobs
            .read()
            .await
            .values()
            .filter(|job| job.is_enabled())
            .cloned()
            .collect())
    }
}

/// 内存执行日志仓储
#[derive(Debug)]
pub struct InMemoryJobRunRepository {
    runs: RwLock<BTreeMap<i64, JobRun>>,
    next_id: AtomicI64,
}

impl InMemoryJobRunRepository {
    pub fn new() -> Self {
        Self {
            runs: RwLock::new(BTreeMap::new()),
            next_id: AtomicI64::new(1),
        }
    }

    /// 全部执行记录，按ID升序
    pub async fn all(&self) -> Vec<JobRun> {
        self.runs.read().await.values().cloned().collect()
    }
}

impl Default for InMemoryJobRunRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobRunRepository for InMemoryJobRunRepository {
    async fn create(&self, run: &JobRun) -> JobResult<JobRun> {
        let mut created = run.clone();
        created.id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.runs.write().await.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_by_id(&self, id: i64) -> JobResult<Option<JobRun>> {
        Ok(self.runs.read().await.get(&id).cloned())
    }

    async fn finish(&self, id: i64, completion: &RunCompletion) -> JobResult<()> {
        let mut runs = self.runs.write().await;
        let run = runs.get_mut(&id).ok_or(JobError::RunNotFound { id })?;
        run.apply_completion(completion)
    }

    async fn latest_by_status(
        &self,
        job_id: i64,
        status: RunStatus,
    ) -> JobResult<Option<JobRun>> {
        Ok(self
            .runs
            .read()
            .await
            .values()
            .rev()
            .find(|run| run.job_id == job_id && run.status == status)
            .cloned())
    }

    async fn list_by_job(&self, job_id: i64, limit: usize) -> JobResult<Vec<JobRun>> {
        Ok(self
            .runs
            .read()
            .await
            .values()
            .rev()
            .filter(|run| run.job_id == job_id)
            .take(limit)
            .cloned()
            .collect())
    }
}

/// 内存步骤日志仓储
#[derive(Debug)]
pub struct InMemoryJobStepRepository {
    steps: RwLock<BTreeMap<i64, JobStep>>,
    next_id: AtomicI64,
}

impl InMemoryJobStepRepository {
    pub fn new() -> Self {
        Self {
            steps: RwLock::new(BTreeMap::new()),
            next_id: AtomicI64::new(1),
        }
    }
}

impl Default for InMemoryJobStepRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStepRepository for InMemoryJobStepRepository {
    async fn create(&self, step: &JobStep) -> JobResult<JobStep> {
        let mut created = step.clone();
        created.id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.steps.write().await.insert(created.id, created.clone());
        Ok(created)
    }

    async fn finish(&self, id: i64, completion: &StepCompletion) -> JobResult<()> {
        let mut steps = self.steps.write().await;
        let step = steps.get_mut(&id).ok_or(JobError::StepNotFound { id })?;
        step.apply_completion(completion);
        Ok(())
    }

    async fn list_by_run(&self, run_id: i64) -> JobResult<Vec<JobStep>> {
        let mut steps: Vec<JobStep> = self
            .steps
            .read()
            .await
            .values()
            .filter(|step| step.run_id == run_id)
            .cloned()
            .collect();
        steps.sort_by_key(|step| step.ordinal);
        Ok(steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use jobs_core::models::{JobStatus, StepStatus, TriggerSource};

    fn completion(status: RunStatus) -> RunCompletion {
        RunCompletion {
            status,
            message: "done".to_string(),
            exception: None,
            finished_at: Utc::now(),
            elapsed_ms: 1,
        }
    }

    #[tokio::test]
    async fn test_job_crud() {
        let repo = InMemoryJobRepository::new();
        let a = repo.create(&Job::new("a", "noop", "* * * * * *")).await.unwrap();
        let mut b = repo
            .create(&Job::new("b", "noop", "* * * * * *").with_status(JobStatus::Disabled))
            .await
            .unwrap();
        assert_eq!((a.id, b.id), (1, 2));

        let enabled = repo.list_enabled().await.unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].name, "a");

        b.status = JobStatus::Enabled;
        repo.update(&b).await.unwrap();
        assert_eq!(repo.list_enabled().await.unwrap().len(), 2);

        repo.delete(a.id).await.unwrap();
        assert!(repo.get_by_id(a.id).await.unwrap().is_none());
        assert!(matches!(
            repo.delete(a.id).await,
            Err(JobError::JobNotFound { id: 1 })
        ));
    }

    #[tokio::test]
    async fn test_run_finish_only_once() {
        let repo = InMemoryJobRunRepository::new();
        let mut job = Job::new("a", "noop", "* * * * * *");
        job.id = 5;
        let run = repo
            .create(&JobRun::running(&job, TriggerSource::Manual))
            .await
            .unwrap();

        assert!(repo
            .latest_by_status(5, RunStatus::Running)
            .await
            .unwrap()
            .is_some());
        repo.finish(run.id, &completion(RunStatus::Success))
            .await
            .unwrap();
        let err = repo
            .finish(run.id, &completion(RunStatus::Failed))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert!(repo
            .latest_by_status(5, RunStatus::Running)
            .await
            .unwrap()
            .is_none());
        assert!(matches!(
            repo.finish(99, &completion(RunStatus::Success)).await,
            Err(JobError::RunNotFound { id: 99 })
        ));
    }

    #[tokio::test]
    async fn test_list_by_job_newest_first() {
        let repo = InMemoryJobRunRepository::new();
        let mut job = Job::new("a", "noop", "* * * * * *");
        job.id = 1;
        for _ in 0..3 {
            repo.create(&JobRun::running(&job, TriggerSource::Cron))
                .await
                .unwrap();
        }
        let ids: Vec<i64> = repo
            .list_by_job(1, 2)
            .await
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![3, 2]);
    }

    #[tokio::test]
    async fn test_steps_listed_by_ordinal() {
        let repo = InMemoryJobStepRepository::new();
        let second = repo.create(&JobStep::running(1, 2, "b")).await.unwrap();
        repo.create(&JobStep::running(1, 1, "a")).await.unwrap();
        repo.create(&JobStep::running(2, 1, "other")).await.unwrap();

        repo.finish(
            second.id,
            &StepCompletion {
                status: StepStatus::Success,
                output: Some("ok".to_string()),
                error: None,
                finished_at: Utc::now(),
                duration_ms: 3,
            },
        )
        .await
        .unwrap();

        let steps = repo.list_by_run(1).await.unwrap();
        assert_eq!(
            steps.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        assert_eq!(steps[1].output.as_deref(), Some("ok"));
    }
}
