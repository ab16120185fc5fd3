//! 步骤日志器
//!
//! 每次执行一个 [`StepLogger`]。执行器通过它按顺序开启步骤，向步骤追加日志行，
//! 最后以成功或失败结束步骤。步骤记录持久化到步骤仓储，过程中的每个变化
//! 同时作为 [`StepEvent`] 推送到日志流中心。

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use chrono::Utc;
use jobs_core::models::{JobStep, StepCompletion, StepStatus};
use jobs_core::{JobError, JobResult, JobStepRepository, StepEvent};
use tracing::{debug, warn};

use crate::stream_hub::LogStreamHub;

#[derive(Clone)]
pub struct StepLogger {
    inner: Arc<LoggerInner>,
}

struct LoggerInner {
    run_id: i64,
    repo: Arc<dyn JobStepRepository>,
    hub: LogStreamHub,
    next_ordinal: tokio::sync::Mutex<i32>,
    closed: AtomicBool,
    failed_steps: AtomicU32,
}

impl LoggerInner {
    fn publish(&self, event: StepEvent) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.hub.publish(&event);
    }
}

impl StepLogger {
    pub fn new(run_id: i64, repo: Arc<dyn JobStepRepository>, hub: LogStreamHub) -> Self {
        Self {
            inner: Arc::new(LoggerInner {
                run_id,
                repo,
                hub,
                next_ordinal: tokio::sync::Mutex::new(1),
                closed: AtomicBool::new(false),
                failed_steps: AtomicU32::new(0),
            }),
        }
    }

    pub fn run_id(&self) -> i64 {
        self.inner.run_id
    }

    /// 开启新步骤
    ///
    /// 序号分配、插入记录和推送 `step_start` 在同一把锁内完成，
    /// 因此序号从1开始连续，事件顺序与序号一致。插入失败时序号不会被消耗。
    pub async fn start_step(&self, name: &str) -> JobResult<Step> {
        let mut next_ordinal = self.inner.next_ordinal.lock().await;

        let draft = JobStep::running(self.inner.run_id, *next_ordinal, name);
        let record = self.inner.repo.create(&draft).await?;
        *next_ordinal += 1;

        debug!(
            "开始步骤: run_id={}, ordinal={}, name={}",
            record.run_id, record.ordinal, record.name
        );
        self.inner.publish(StepEvent::step_start(&record));

        Ok(Step {
            logger: Arc::clone(&self.inner),
            record,
            buffer: Mutex::new(Vec::new()),
            started: Instant::now(),
            finished: AtomicBool::new(false),
        })
    }

    /// 停止推送事件，可重复调用
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            debug!("关闭步骤日志器: run_id={}", self.inner.run_id);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// 以失败结束的步骤数
    pub fn failed_steps(&self) -> u32 {
        self.inner.failed_steps.load(Ordering::Acquire)
    }
}

/// 执行中的一个步骤
pub struct Step {
    logger: Arc<LoggerInner>,
    record: JobStep,
    buffer: Mutex<Vec<String>>,
    started: Instant,
    finished: AtomicBool,
}

impl Step {
    pub fn id(&self) -> i64 {
        self.record.id
    }

    pub fn ordinal(&self) -> i32 {
        self.record.ordinal
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// 追加一行日志并推送 `step_log`，步骤结束后的调用被忽略
    pub fn log(&self, line: impl Into<String>) {
        if self.is_finished() {
            return;
        }
        let line = line.into();
        self.logger
            .publish(StepEvent::step_log(&self.record, &line));
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line);
    }

    pub async fn success(&self) -> JobResult<()> {
        self.finish(StepStatus::Success, None).await
    }

    pub async fn fail(&self, error: impl Display) -> JobResult<()> {
        self.finish(StepStatus::Failed, Some(error.to_string())).await
    }

    async fn finish(&self, status: StepStatus, error: Option<String>) -> JobResult<()> {
        if self.finished.swap(true, Ordering::AcqRel) {
            return Err(JobError::StepAlreadyFinished {
                ordinal: self.record.ordinal,
            });
        }

        let output = {
            let lines = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
            (!lines.is_empty()).then(|| lines.join("\n"))
        };
        let completion = StepCompletion {
            status,
            output,
            error,
            finished_at: Utc::now(),
            duration_ms: self.started.elapsed().as_millis() as i64,
        };

        if status == StepStatus::Failed {
            self.logger.failed_steps.fetch_add(1, Ordering::AcqRel);
        }

        let persisted = self.logger.repo.finish(self.record.id, &completion).await;
        if let Err(e) = &persisted {
            warn!(
                "保存步骤终态失败: run_id={}, ordinal={}, error={}",
                self.record.run_id, self.record.ordinal, e
            );
        }

        let mut finished = self.record.clone();
        finished.apply_completion(&completion);
        self.logger.publish(StepEvent::step_end(&finished));

        persisted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobs_core::StepEventKind;
    use jobs_infrastructure::memory::InMemoryJobStepRepository;

    fn logger(run_id: i64) -> (StepLogger, Arc<InMemoryJobStepRepository>, LogStreamHub) {
        let repo = Arc::new(InMemoryJobStepRepository::new());
        let hub = LogStreamHub::new(64);
        let logger = StepLogger::new(run_id, repo.clone(), hub.clone());
        (logger, repo, hub)
    }

    #[tokio::test]
    async fn test_log_lines_are_joined_into_output() {
        let (logger, repo, hub) = logger(1);
        let mut subscription = hub.subscribe(1);

        let step = logger.start_step("导入").await.unwrap();
        step.log("x");
        step.log("y");
        step.log("z");
        step.success().await.unwrap();

        let steps = repo.list_by_run(1).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].output.as_deref(), Some("x\ny\nz"));
        assert_eq!(steps[0].status, StepStatus::Success);
        assert!(steps[0].finished_at.is_some());

        let mut kinds = Vec::new();
        let mut last = None;
        while let Some(event) = subscription.try_recv() {
            kinds.push(event.kind);
            last = Some(event);
        }
        assert_eq!(
            kinds,
            vec![
                StepEventKind::StepStart,
                StepEventKind::StepLog,
                StepEventKind::StepLog,
                StepEventKind::StepLog,
                StepEventKind::StepEnd
            ]
        );
        assert_eq!(last.unwrap().status.as_deref(), Some("success"));
    }

    #[tokio::test]
    async fn test_concurrent_steps_get_gap_free_ordinals() {
        let (logger, repo, _hub) = logger(2);

        let mut handles = Vec::new();
        for i in 0..20 {
            let logger = logger.clone();
            handles.push(tokio::spawn(async move {
                let step = logger.start_step(&format!("step-{i}")).await.unwrap();
                step.success().await.unwrap();
                step.ordinal()
            }));
        }
        let mut ordinals = Vec::new();
        for handle in handles {
            ordinals.push(handle.await.unwrap());
        }
        ordinals.sort();
        assert_eq!(ordinals, (1..=20).collect::<Vec<_>>());

        let persisted: Vec<i32> = repo
            .list_by_run(2)
            .await
            .unwrap()
            .iter()
            .map(|s| s.ordinal)
            .collect();
        assert_eq!(persisted, (1..=20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_second_terminal_call_is_rejected() {
        let (logger, repo, _hub) = logger(3);
        let step = logger.start_step("校验").await.unwrap();
        step.fail("磁盘已满").await.unwrap();

        let err = step.success().await.unwrap_err();
        assert!(matches!(err, JobError::StepAlreadyFinished { ordinal: 1 }));

        let steps = repo.list_by_run(3).await.unwrap();
        assert_eq!(steps[0].status, StepStatus::Failed);
        assert_eq!(steps[0].error.as_deref(), Some("磁盘已满"));
        assert_eq!(steps[0].output, None);
        assert_eq!(logger.failed_steps(), 1);
    }

    #[tokio::test]
    async fn test_close_stops_publishing() {
        let (logger, _repo, hub) = logger(4);
        let mut subscription = hub.subscribe(4);
        let step = logger.start_step("a").await.unwrap();
        assert!(subscription.try_recv().is_some());

        logger.close();
        logger.close();
        assert!(logger.is_closed());
        step.log("late");
        step.success().await.unwrap();
        assert!(subscription.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_log_after_finish_is_ignored() {
        let (logger, repo, _hub) = logger(5);
        let step = logger.start_step("a").await.unwrap();
        step.log("before");
        step.success().await.unwrap();
        step.log("after");

        assert!(step.is_finished());
        let steps = repo.list_by_run(5).await.unwrap();
        assert_eq!(steps[0].output.as_deref(), Some("before"));
    }
}
