//! 任务调度器
//!
//! 服务对象，持有每个启用任务的cron条目。任务定义的增删改都经由调度器完成：
//! 先校验并持久化，再重新推导该任务的调度条目。任意时刻一个任务ID最多只有
//! 一个活动条目。
//!
//! 定时触发和手动触发的执行都交给 [`ExecutionEngine`]，运行在被跟踪的任务上，
//! 停止调度器时会在超时时间内等待它们结束。

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use jobs_core::config::SchedulerConfig;
use jobs_core::models::{Job, JobStatus, MisfirePolicy, RunStatus, TriggerSource};
use jobs_core::{JobError, JobRepository, JobResult, JobRunRepository, StepEvent};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use crate::cron_utils::CronScheduler;
use crate::execution::{ExecutionEngine, RunRequest};
use crate::heartbeat::with_heartbeat;
use crate::metrics;
use crate::stream_hub::LogSubscription;

struct CronEntry {
    handle: JoinHandle<()>,
    cron_expression: String,
}

#[derive(Default)]
struct SchedulerState {
    entries: HashMap<i64, CronEntry>,
    /// 因上次执行未结束而跳过的触发次数
    skipped: HashMap<i64, u64>,
}

struct SchedulerInner {
    jobs: Arc<dyn JobRepository>,
    runs: Arc<dyn JobRunRepository>,
    engine: ExecutionEngine,
    config: SchedulerConfig,
    state: RwLock<SchedulerState>,
    in_flight: Mutex<HashSet<i64>>,
    tracker: TaskTracker,
    started: AtomicBool,
    /// 串行化任务变更和启停
    ops: tokio::sync::Mutex<()>,
}

/// 本进程内的“执行中”标记，释放时自动清除
struct InFlightGuard {
    inner: Arc<SchedulerInner>,
    job_id: i64,
}

impl InFlightGuard {
    fn try_acquire(inner: &Arc<SchedulerInner>, job_id: i64) -> Option<Self> {
        let inserted = inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job_id);
        inserted.then(|| Self {
            inner: Arc::clone(inner),
            job_id,
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.job_id);
    }
}

impl SchedulerInner {
    fn state_read(&self) -> std::sync::RwLockReadGuard<'_, SchedulerState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn state_write(&self) -> std::sync::RwLockWriteGuard<'_, SchedulerState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// 重新推导任务的调度条目：先摘除旧条目，任务启用且服务运行中时再挂上新条目
    fn reschedule(self: &Arc<Self>, job: &Job) -> JobResult<()> {
        let cron = if job.is_enabled() && self.started.load(Ordering::Acquire) {
            Some(CronScheduler::new(&job.cron_expression)?)
        } else {
            None
        };

        let mut state = self.state_write();
        if let Some(entry) = state.entries.remove(&job.id) {
            entry.handle.abort();
            debug!("移除调度条目: job_id={}, cron={}", job.id, entry.cron_expression);
        }

        if let Some(cron) = cron {
            let handle = tokio::spawn(cron_loop(Arc::downgrade(self), job.clone(), cron));
            state.entries.insert(
                job.id,
                CronEntry {
                    handle,
                    cron_expression: job.cron_expression.clone(),
                },
            );
            debug!("添加调度条目: job_id={}, cron={}", job.id, job.cron_expression);
        }

        Ok(())
    }

    fn unschedule(&self, job_id: i64) {
        let mut state = self.state_write();
        if let Some(entry) = state.entries.remove(&job_id) {
            entry.handle.abort();
        }
        state.skipped.remove(&job_id);
    }

    /// 定时触发一次执行
    fn fire(self: &Arc<Self>, job: &Job) {
        let guard = if job.forbids_overlap() {
            match InFlightGuard::try_acquire(self, job.id) {
                Some(guard) => Some(guard),
                None => {
                    *self.state_write().skipped.entry(job.id).or_default() += 1;
                    metrics::record_cron_skipped("running");
                    info!("任务 {} 上次执行尚未结束，跳过本次触发", job.id);
                    return;
                }
            }
        } else {
            None
        };

        let engine = self.engine.clone();
        let request = RunRequest::new(job.clone(), TriggerSource::Cron);
        self.tracker.spawn(async move {
            let _guard = guard;
            if let Err(e) = engine.execute(request).await {
                error!("定时执行任务失败: error={}", e);
            }
        });
    }
}

/// 错过触发时按策略决定补触发的次数，`missed` 包含本次醒来对应的触发点
fn fires_for(policy: MisfirePolicy, missed: usize) -> usize {
    match policy {
        MisfirePolicy::FireAll => missed.max(1),
        MisfirePolicy::Default | MisfirePolicy::FireOnce => 1,
        MisfirePolicy::DoNothing => 0,
    }
}

/// 单个任务的cron驱动：睡眠到下次触发时间，醒来后按错过执行策略触发
///
/// 延迟取tokio时钟与墙上时钟两者中的较大值，系统休眠后醒来同样能识别错过的触发。
async fn cron_loop(inner: Weak<SchedulerInner>, job: Job, cron: CronScheduler) {
    let threshold = match inner.upgrade() {
        Some(inner) => inner.config.misfire_threshold(),
        None => return,
    };
    let mut last = Local::now();

    loop {
        let Some(next) = cron.next_after(&last) else {
            info!("任务 {} 没有后续触发时间，调度结束", job.id);
            return;
        };
        let wait = (next - Local::now()).to_std().unwrap_or(Duration::ZERO);
        let deadline = tokio::time::Instant::now() + wait;
        tokio::time::sleep_until(deadline).await;

        let Some(inner) = inner.upgrade() else {
            return;
        };

        let wall_lateness = (Local::now() - next).to_std().unwrap_or(Duration::ZERO);
        let lateness = tokio::time::Instant::now()
            .saturating_duration_since(deadline)
            .max(wall_lateness);
        if lateness <= threshold {
            inner.fire(&job);
            last = next;
            continue;
        }

        let now = next
            + chrono::Duration::from_std(lateness).unwrap_or_else(|_| chrono::Duration::zero());
        let missed = cron.count_between(&next, &now) + 1;
        let fires = fires_for(job.misfire_policy, missed);
        warn!(
            "任务 {} 错过执行: 预定时间={}, 延迟={}ms, 错过次数={}, 补触发次数={}",
            job.id,
            next.format("%Y-%m-%d %H:%M:%S"),
            lateness.as_millis(),
            missed,
            fires
        );
        if fires == 0 {
            metrics::record_cron_skipped("misfire");
        }
        for _ in 0..fires {
            inner.fire(&job);
        }
        last = now;
    }
}

/// 定时任务调度器
#[derive(Clone)]
pub struct JobScheduler {
    inner: Arc<SchedulerInner>,
}

impl JobScheduler {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        runs: Arc<dyn JobRunRepository>,
        engine: ExecutionEngine,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                jobs,
                runs,
                engine,
                config,
                state: RwLock::new(SchedulerState::default()),
                in_flight: Mutex::new(HashSet::new()),
                tracker: TaskTracker::new(),
                started: AtomicBool::new(false),
                ops: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.inner.engine
    }

    pub fn is_running(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    /// 加载全部启用的任务并挂上调度条目
    ///
    /// cron表达式无效的任务只记录日志并跳过，不影响启动。
    pub async fn start(&self) -> JobResult<()> {
        let _ops = self.inner.ops.lock().await;
        if self.inner.started.swap(true, Ordering::AcqRel) {
            warn!("调度器已经在运行");
            return Ok(());
        }
        self.inner.tracker.reopen();

        let jobs = match self.inner.jobs.list_enabled().await {
            Ok(jobs) => jobs,
            Err(e) => {
                self.inner.started.store(false, Ordering::Release);
                return Err(e);
            }
        };

        let mut scheduled = 0;
        for job in &jobs {
            match self.inner.reschedule(job) {
                Ok(()) => scheduled += 1,
                Err(e) => warn!("任务 {} ({}) 调度失败，已跳过: {}", job.id, job.name, e),
            }
        }

        info!("调度器启动完成: 启用任务={}, 已调度={}", jobs.len(), scheduled);
        Ok(())
    }

    /// 停止所有调度条目，并在超时时间内等待执行中的任务结束
    pub async fn stop(&self) {
        let _ops = self.inner.ops.lock().await;
        if !self.inner.started.swap(false, Ordering::AcqRel) {
            return;
        }

        let entries: Vec<CronEntry> = {
            let mut state = self.inner.state_write();
            state.entries.drain().map(|(_, entry)| entry).collect()
        };
        for entry in &entries {
            entry.handle.abort();
        }
        info!("已停止 {} 个调度条目", entries.len());

        self.inner.tracker.close();
        let in_flight = self.inner.tracker.len();
        if in_flight > 0 {
            info!("等待 {} 个执行中的任务结束", in_flight);
        }
        let timeout = self.inner.config.shutdown_timeout();
        if tokio::time::timeout(timeout, self.inner.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                "等待执行中的任务超时({}秒)，剩余 {} 个",
                timeout.as_secs(),
                self.inner.tracker.len()
            );
        }
        info!("调度器已停止");
    }

    fn validate_job(job: &Job) -> JobResult<()> {
        if job.name.trim().is_empty() {
            return Err(JobError::InvalidArgument("任务名称不能为空".to_string()));
        }
        if job.invoke_target.trim().is_empty() {
            return Err(JobError::InvalidArgument("调用目标不能为空".to_string()));
        }
        CronScheduler::validate_cron_expression(&job.cron_expression)
    }

    async fn load_job(&self, job_id: i64) -> JobResult<Job> {
        self.inner
            .jobs
            .get_by_id(job_id)
            .await?
            .ok_or(JobError::JobNotFound { id: job_id })
    }

    #[instrument(skip_all, fields(job_name = %job.name))]
    pub async fn create_job(&self, job: Job) -> JobResult<Job> {
        Self::validate_job(&job)?;
        let _ops = self.inner.ops.lock().await;

        let created = self.inner.jobs.create(&job).await?;
        self.inner.reschedule(&created)?;
        info!("创建任务: job_id={}, cron={}", created.id, created.cron_expression);
        Ok(created)
    }

    #[instrument(skip_all, fields(job_id = job.id))]
    pub async fn update_job(&self, mut job: Job) -> JobResult<Job> {
        Self::validate_job(&job)?;
        let _ops = self.inner.ops.lock().await;

        self.load_job(job.id).await?;
        job.updated_at = Utc::now();
        self.inner.jobs.update(&job).await?;
        self.inner.reschedule(&job)?;
        info!("更新任务: job_id={}, cron={}", job.id, job.cron_expression);
        Ok(job)
    }

    #[instrument(skip(self))]
    pub async fn change_status(&self, job_id: i64, status: JobStatus) -> JobResult<Job> {
        let _ops = self.inner.ops.lock().await;

        let mut job = self.load_job(job_id).await?;
        job.status = status;
        job.updated_at = Utc::now();
        self.inner.jobs.update(&job).await?;
        self.inner.reschedule(&job)?;
        info!("修改任务状态: job_id={}, status={:?}", job_id, status);
        Ok(job)
    }

    #[instrument(skip(self))]
    pub async fn delete_job(&self, job_id: i64) -> JobResult<()> {
        let _ops = self.inner.ops.lock().await;

        self.inner.jobs.delete(job_id).await?;
        self.inner.unschedule(job_id);
        info!("删除任务: job_id={}", job_id);
        Ok(())
    }

    /// 手动触发一次执行，返回预先创建的执行记录ID
    ///
    /// 任务禁止并发且最近一次执行仍在运行时返回冲突错误，不创建执行记录。
    /// 执行使用调用方令牌的子令牌，调用方取消会传递给执行器。
    #[instrument(skip(self, parent_cancel))]
    pub async fn trigger_job(
        &self,
        job_id: i64,
        parent_cancel: Option<&CancellationToken>,
    ) -> JobResult<i64> {
        let job = self.load_job(job_id).await?;

        if job.forbids_overlap() {
            if let Some(running) = self
                .inner
                .runs
                .latest_by_status(job.id, RunStatus::Running)
                .await?
            {
                metrics::record_lock_conflict();
                return Err(JobError::Conflict(format!(
                    "任务 {} 正在执行中(run_id={})，不允许并发执行",
                    job.id, running.id
                )));
            }
        }

        let run_id = self
            .inner
            .engine
            .open_run(&job, TriggerSource::Manual)
            .await?;

        let cancel = parent_cancel
            .map(CancellationToken::child_token)
            .unwrap_or_else(CancellationToken::new);
        let guard = InFlightGuard::try_acquire(&self.inner, job.id);
        let engine = self.inner.engine.clone();
        let request = RunRequest::new(job, TriggerSource::Manual)
            .with_run_id(run_id)
            .with_cancel(cancel);

        self.inner.tracker.spawn(async move {
            let _guard = guard;
            if let Err(e) = engine.execute(request).await {
                error!("手动执行任务失败: run_id={}, error={}", run_id, e);
            }
        });

        info!("手动触发任务: job_id={}, run_id={}", job_id, run_id);
        Ok(run_id)
    }

    /// 订阅执行日志流，不回放订阅之前的事件
    ///
    /// 不检查执行状态：订阅已结束的执行永远收不到事件，也不会被关闭。
    /// 需要在结束时终止的场景使用 [`JobScheduler::stream_with_heartbeat`]。
    pub fn subscribe_log_stream(&self, run_id: i64) -> LogSubscription {
        self.inner.engine.hub().subscribe(run_id)
    }

    /// 订阅执行日志流并按配置的间隔附加心跳
    ///
    /// 执行已结束时只产出 `connected` 和 `complete` 后结束。
    pub async fn stream_with_heartbeat(
        &self,
        run_id: i64,
    ) -> JobResult<BoxStream<'static, StepEvent>> {
        // 先订阅再查状态，查询之后才结束的执行仍会收到 complete
        let subscription = self.subscribe_log_stream(run_id);
        let run = self
            .inner
            .runs
            .get_by_id(run_id)
            .await?
            .ok_or(JobError::RunNotFound { id: run_id })?;

        if run.is_terminal() {
            debug!("执行已结束，日志流直接返回终态: run_id={}", run_id);
            let message = run.message.unwrap_or_default();
            let events = [
                StepEvent::connected(run_id),
                StepEvent::complete(run_id, run.status, &message),
            ];
            return Ok(stream::iter(events).boxed());
        }

        Ok(with_heartbeat(subscription, self.inner.config.heartbeat_interval()).boxed())
    }

    pub fn validate_cron(&self, cron_expression: &str) -> JobResult<()> {
        CronScheduler::validate_cron_expression(cron_expression)
    }

    /// 预览接下来 `count` 次触发时间
    pub fn next_fire_times(
        &self,
        cron_expression: &str,
        count: usize,
    ) -> JobResult<Vec<DateTime<Local>>> {
        Ok(CronScheduler::new(cron_expression)?.upcoming_times(&Local::now(), count))
    }

    pub fn is_scheduled(&self, job_id: i64) -> bool {
        self.inner.state_read().entries.contains_key(&job_id)
    }

    pub fn scheduled_job_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.inner.state_read().entries.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// 因上次执行未结束而跳过的定时触发次数
    pub fn skipped_fires(&self, job_id: i64) -> u64 {
        self.inner
            .state_read()
            .skipped
            .get(&job_id)
            .copied()
            .unwrap_or(0)
    }

    /// 正在执行中的任务数量
    pub fn in_flight_runs(&self) -> usize {
        self.inner.tracker.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ExecutorRegistry;
    use crate::stream_hub::LogStreamHub;
    use jobs_infrastructure::memory::{
        InMemoryJobRepository, InMemoryJobRunRepository, InMemoryJobStepRepository,
    };

    fn scheduler() -> JobScheduler {
        let jobs = Arc::new(InMemoryJobRepository::new());
        let runs = Arc::new(InMemoryJobRunRepository::new());
        let steps = Arc::new(InMemoryJobStepRepository::new());
        let engine = ExecutionEngine::new(
            Arc::new(ExecutorRegistry::new()),
            runs.clone(),
            steps,
            LogStreamHub::default(),
        );
        JobScheduler::new(jobs, runs, engine, SchedulerConfig::default())
    }

    #[test]
    fn test_fires_for_each_misfire_policy() {
        assert_eq!(fires_for(MisfirePolicy::FireAll, 4), 4);
        assert_eq!(fires_for(MisfirePolicy::FireAll, 0), 1);
        assert_eq!(fires_for(MisfirePolicy::FireOnce, 4), 1);
        assert_eq!(fires_for(MisfirePolicy::Default, 4), 1);
        assert_eq!(fires_for(MisfirePolicy::DoNothing, 4), 0);
    }

    #[tokio::test]
    async fn test_invalid_job_rejected_before_persist() {
        let scheduler = scheduler();
        let err = scheduler
            .create_job(Job::new("bad", "noop", "not a cron"))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidCron { .. }));

        let err = scheduler
            .create_job(Job::new("bad", " ", "0 * * * * *"))
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert!(scheduler.scheduled_job_ids().is_empty());
    }

    #[tokio::test]
    async fn test_jobs_not_scheduled_until_started() {
        let scheduler = scheduler();
        let job = scheduler
            .create_job(Job::new("a", "noop", "0 0 3 * * *"))
            .await
            .unwrap();
        assert!(!scheduler.is_scheduled(job.id));

        scheduler.start().await.unwrap();
        assert!(scheduler.is_running());
        assert!(scheduler.is_scheduled(job.id));

        scheduler.stop().await;
        assert!(!scheduler.is_running());
        assert!(scheduler.scheduled_job_ids().is_empty());
    }

    #[tokio::test]
    async fn test_next_fire_times_preview() {
        let scheduler = scheduler();
        let times = scheduler.next_fire_times("0 */15 * * * ?", 4).unwrap();
        assert_eq!(times.len(), 4);
        assert!(times.windows(2).all(|w| w[1] > w[0]));
        assert!(scheduler.validate_cron("0 */15 * * * ?").is_ok());
        assert!(scheduler.next_fire_times("nope", 1).is_err());
    }
}
