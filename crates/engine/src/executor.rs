//! 执行器契约
//!
//! 每个调用目标对应一个实现了 [`JobExecutor`] 的执行器。执行器通过
//! [`ExecutionPayload`] 拿到任务快照、参数副本、步骤日志器和取消令牌，
//! 返回 `Ok(())` 表示成功，返回错误表示失败。

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use jobs_core::models::{Job, TriggerSource};
use jobs_core::{JobError, JobResult};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::step_logger::StepLogger;

/// 任务参数的独立副本
///
/// 执行器可以随意消费，不会影响调用方持有的任务定义。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobParams(Vec<u8>);

impl JobParams {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(u8::is_ascii_whitespace)
    }

    /// 将参数解析为指定类型，空参数按 `{}` 处理
    pub fn parse<T: DeserializeOwned>(&self) -> JobResult<T> {
        let bytes: &[u8] = if self.is_empty() { b"{}" } else { &self.0 };
        serde_json::from_slice(bytes)
            .map_err(|e| JobError::InvalidParams(format!("解析任务参数失败: {e}")))
    }

    pub fn value(&self) -> JobResult<serde_json::Value> {
        self.parse()
    }
}

impl From<&str> for JobParams {
    fn from(value: &str) -> Self {
        Self::new(value.as_bytes())
    }
}

/// 交给执行器的一次执行上下文
pub struct ExecutionPayload {
    pub job: Job,
    pub run_id: i64,
    pub trigger: TriggerSource,
    pub params: JobParams,
    pub steps: StepLogger,
    /// 手动触发时派生自调用方令牌，定时触发时为新令牌
    pub cancel: CancellationToken,
    pub span: tracing::Span,
}

#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, payload: ExecutionPayload) -> JobResult<()>;

    fn description(&self) -> &str {
        ""
    }
}

/// 以闭包实现的执行器
pub struct FnExecutor<F> {
    func: F,
}

#[async_trait]
impl<F, Fut> JobExecutor for FnExecutor<F>
where
    F: Fn(ExecutionPayload) -> Fut + Send + Sync,
    Fut: Future<Output = JobResult<()>> + Send + 'static,
{
    async fn execute(&self, payload: ExecutionPayload) -> JobResult<()> {
        (self.func)(payload).await
    }
}

/// 把异步闭包包装为执行器
///
/// ```rust,ignore
/// registry.register("refresh_cache", executor_fn(|payload| async move {
///     let step = payload.steps.start_step("刷新").await?;
///     step.log("done");
///     step.success().await
/// }))?;
/// ```
pub fn executor_fn<F, Fut>(func: F) -> Arc<dyn JobExecutor>
where
    F: Fn(ExecutionPayload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult<()>> + Send + 'static,
{
    Arc::new(FnExecutor { func })
}
