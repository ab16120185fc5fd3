//! 执行引擎
//!
//! 单次执行的完整流程：
//!
//! ```text
//! 加锁 ──▶ 打开执行日志 ──▶ 执行器(步骤) ──▶ 写入终态 ──▶ 释放锁
//! ```
//!
//! 执行日志打开之后，无论执行器成功、失败还是panic，终态都会写入且只写一次。
//! 打开执行日志失败是唯一返回给调用方的错误。

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use jobs_core::models::{
    truncate_chars, Job, JobRun, RunCompletion, RunStatus, TriggerSource, MAX_EXCEPTION_CHARS,
};
use jobs_core::{JobError, JobResult, JobRunRepository, JobStepRepository, StepEvent};
use tokio_util::sync::CancellationToken;
use tracing::{error, field, info, info_span, warn, Instrument};

use crate::executor::{ExecutionPayload, JobParams};
use crate::lock::{DistributedLock, LockGuard};
use crate::metrics;
use crate::registry::ExecutorRegistry;
use crate::step_logger::StepLogger;
use crate::stream_hub::LogStreamHub;

/// 一次执行请求
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub job: Job,
    pub trigger: TriggerSource,
    /// 已预先创建的执行记录ID，为空时由引擎创建
    pub run_id: Option<i64>,
    pub cancel: CancellationToken,
}

impl RunRequest {
    pub fn new(job: Job, trigger: TriggerSource) -> Self {
        Self {
            job,
            trigger,
            run_id: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_run_id(mut self, run_id: i64) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// 一次执行的结果
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub run_id: i64,
    pub status: RunStatus,
    pub message: String,
}

/// 执行器之外确定的失败原因，或执行器给出的结论
struct Verdict {
    status: RunStatus,
    reason: Option<String>,
    exception: Option<String>,
}

impl Verdict {
    fn success() -> Self {
        Self {
            status: RunStatus::Success,
            reason: None,
            exception: None,
        }
    }

    fn failed(reason: Option<String>, exception: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failed,
            reason,
            exception: Some(exception.into()),
        }
    }
}

/// 生成执行摘要
///
/// 形如 `手动触发 执行成功, 耗时 12ms`，有失败步骤时追加 `, 2 个步骤失败`。
pub fn build_summary(
    trigger: TriggerSource,
    status: RunStatus,
    elapsed: Duration,
    failed_steps: u32,
    reason: Option<&str>,
) -> String {
    let verdict = if status == RunStatus::Success {
        "执行成功"
    } else {
        "执行失败"
    };
    let mut summary = match reason {
        Some(reason) => format!("{} {}: {}", trigger.label(), verdict, reason),
        None => format!("{} {}", trigger.label(), verdict),
    };
    summary.push_str(&format!(", 耗时 {}ms", elapsed.as_millis()));
    if failed_steps > 0 {
        summary.push_str(&format!(", {failed_steps} 个步骤失败"));
    }
    summary
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "未知的panic".to_string()
    }
}

#[derive(Clone)]
pub struct ExecutionEngine {
    registry: Arc<ExecutorRegistry>,
    runs: Arc<dyn JobRunRepository>,
    steps: Arc<dyn JobStepRepository>,
    hub: LogStreamHub,
    lock: Option<DistributedLock>,
    exception_max_chars: usize,
}

impl ExecutionEngine {
    pub fn new(
        registry: Arc<ExecutorRegistry>,
        runs: Arc<dyn JobRunRepository>,
        steps: Arc<dyn JobStepRepository>,
        hub: LogStreamHub,
    ) -> Self {
        Self {
            registry,
            runs,
            steps,
            hub,
            lock: None,
            exception_max_chars: MAX_EXCEPTION_CHARS,
        }
    }

    /// 配置共享缓存锁，未配置时禁止并发的任务只依赖调度器的本地跳过
    pub fn with_lock(mut self, lock: DistributedLock) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn with_exception_max_chars(mut self, max_chars: usize) -> Self {
        self.exception_max_chars = max_chars.max(1);
        self
    }

    pub fn registry(&self) -> &Arc<ExecutorRegistry> {
        &self.registry
    }

    pub fn hub(&self) -> &LogStreamHub {
        &self.hub
    }

    /// 以任务快照创建一条运行中的执行记录
    pub async fn open_run(&self, job: &Job, trigger: TriggerSource) -> JobResult<i64> {
        let run = self.runs.create(&JobRun::running(job, trigger)).await?;
        info!(
            "创建执行记录: run_id={}, job_id={}, trigger={}",
            run.id,
            job.id,
            trigger.as_str()
        );
        Ok(run.id)
    }

    /// 执行一次任务并等待结束
    ///
    /// 执行体运行在独立的任务上，调用方放弃等待不会中断执行或跳过终态写入。
    /// 执行体异常退出时，预先创建的执行记录在这里补写失败终态。
    pub async fn execute(&self, request: RunRequest) -> JobResult<RunOutcome> {
        let pre_created = request.run_id;
        let trigger = request.trigger;
        let started = Instant::now();

        let engine = self.clone();
        let join_error = match tokio::spawn(async move { engine.run(request).await }).await {
            Ok(result) => return result,
            Err(e) => e,
        };

        let reason = format!("执行任务异常退出: {join_error}");
        error!("{}", reason);
        match pre_created {
            Some(run_id) => Ok(self.recover(run_id, trigger, reason, started).await),
            None => Err(JobError::Internal(reason)),
        }
    }

    /// 执行体异常退出后收尾，终态已写入时沿用已有记录
    async fn recover(
        &self,
        run_id: i64,
        trigger: TriggerSource,
        reason: String,
        started: Instant,
    ) -> RunOutcome {
        match self.runs.get_by_id(run_id).await {
            Ok(Some(run)) if run.is_terminal() => {
                self.hub.close(run_id);
                RunOutcome {
                    run_id,
                    status: run.status,
                    message: run.message.unwrap_or_default(),
                }
            }
            other => {
                if let Err(e) = other {
                    error!("读取执行记录失败: run_id={}, error={}", run_id, e);
                }
                self.finalize(run_id, trigger, Verdict::failed(None, reason), started, None)
                    .await
            }
        }
    }

    async fn run(&self, request: RunRequest) -> JobResult<RunOutcome> {
        let RunRequest {
            job,
            trigger,
            run_id,
            cancel,
        } = request;

        let span = info_span!(
            "job_run",
            job_id = job.id,
            job_name = %job.name,
            trigger = trigger.as_str(),
            run_id = field::Empty
        );

        async move {
            let started = Instant::now();
            metrics::record_run_started(trigger);

            let (guard, lock_failure) = self.acquire_lock(&job).await;

            let run_id = match run_id {
                Some(run_id) => run_id,
                None => match self.open_run(&job, trigger).await {
                    Ok(run_id) => run_id,
                    Err(e) => {
                        error!("创建执行记录失败: job_id={}, error={}", job.id, e);
                        if let Some(guard) = guard {
                            guard.release().await;
                        }
                        return Err(e);
                    }
                },
            };
            tracing::Span::current().record("run_id", run_id);

            let (verdict, logger) = match lock_failure {
                Some(verdict) => (verdict, None),
                None => {
                    let logger = StepLogger::new(run_id, Arc::clone(&self.steps), self.hub.clone());
                    let verdict = self
                        .invoke(&job, run_id, trigger, logger.clone(), cancel)
                        .await;
                    (verdict, Some(logger))
                }
            };

            let outcome = self
                .finalize(run_id, trigger, verdict, started, logger.as_ref())
                .await;

            if let Some(guard) = guard {
                guard.release().await;
            }

            Ok(outcome)
        }
        .instrument(span)
        .await
    }

    async fn acquire_lock(&self, job: &Job) -> (Option<LockGuard>, Option<Verdict>) {
        let Some(lock) = self.lock.as_ref().filter(|_| job.forbids_overlap()) else {
            return (None, None);
        };

        let acquired = match AssertUnwindSafe(lock.acquire(job)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(JobError::LockBackend(format!(
                "锁存储发生panic: {}",
                panic_message(panic)
            ))),
        };

        match acquired {
            Ok(Some(guard)) => (Some(guard), None),
            Ok(None) => {
                metrics::record_lock_conflict();
                warn!("任务正在其他实例执行，本次不执行: job_id={}", job.id);
                let reason = "任务正在执行中，获取任务锁失败".to_string();
                (None, Some(Verdict::failed(Some(reason.clone()), reason)))
            }
            Err(e) => {
                error!("获取任务锁失败: job_id={}, error={}", job.id, e);
                (
                    None,
                    Some(Verdict::failed(
                        Some("获取任务锁失败".to_string()),
                        e.to_string(),
                    )),
                )
            }
        }
    }

    async fn invoke(
        &self,
        job: &Job,
        run_id: i64,
        trigger: TriggerSource,
        steps: StepLogger,
        cancel: CancellationToken,
    ) -> Verdict {
        let Some(executor) = self.registry.resolve(&job.invoke_target) else {
            warn!("未注册的调用目标: {}", job.invoke_target);
            let reason = format!("未注册的调用目标: {}", job.invoke_target);
            return Verdict::failed(Some(reason.clone()), reason);
        };

        let payload = ExecutionPayload {
            job: job.clone(),
            run_id,
            trigger,
            params: JobParams::from(job.invoke_params.as_str()),
            steps,
            cancel,
            span: tracing::Span::current(),
        };

        info!("开始执行任务: target={}", job.invoke_target);
        match AssertUnwindSafe(executor.execute(payload)).catch_unwind().await {
            Ok(Ok(())) => Verdict::success(),
            Ok(Err(e)) => {
                warn!("任务执行失败: {}", e);
                Verdict::failed(None, e.to_string())
            }
            Err(panic) => {
                let message = panic_message(panic);
                error!("执行器发生panic: {}", message);
                Verdict::failed(None, format!("执行器发生panic: {message}"))
            }
        }
    }

    /// 写入终态并结束日志流，不受执行取消令牌影响
    async fn finalize(
        &self,
        run_id: i64,
        trigger: TriggerSource,
        verdict: Verdict,
        started: Instant,
        logger: Option<&StepLogger>,
    ) -> RunOutcome {
        let elapsed = started.elapsed();
        let failed_steps = logger.map_or(0, StepLogger::failed_steps);
        let message = build_summary(
            trigger,
            verdict.status,
            elapsed,
            failed_steps,
            verdict.reason.as_deref(),
        );

        let completion = RunCompletion {
            status: verdict.status,
            message: message.clone(),
            exception: verdict
                .exception
                .as_deref()
                .map(|e| truncate_chars(e, self.exception_max_chars)),
            finished_at: Utc::now(),
            elapsed_ms: elapsed.as_millis() as i64,
        };

        if let Err(e) = self.runs.finish(run_id, &completion).await {
            error!("写入执行终态失败: run_id={}, error={}", run_id, e);
        }

        if let Some(logger) = logger {
            logger.close();
        }
        self.hub
            .publish(&StepEvent::complete(run_id, verdict.status, &message));
        self.hub.close(run_id);

        metrics::record_run_finished(verdict.status, elapsed);
        info!("任务执行结束: {}", message);

        RunOutcome {
            run_id,
            status: verdict.status,
            message,
        }
    }
}
