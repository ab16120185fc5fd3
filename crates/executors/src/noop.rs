use async_trait::async_trait;
use jobs_core::JobResult;
use jobs_engine::{ExecutionPayload, JobExecutor};
use tracing::debug;

/// 空执行器，只把参数写入一个步骤
#[derive(Debug, Default)]
pub struct NoopExecutor;

#[async_trait]
impl JobExecutor for NoopExecutor {
    async fn execute(&self, payload: ExecutionPayload) -> JobResult<()> {
        debug!("执行空任务: run_id={}", payload.run_id);
        let step = payload.steps.start_step("noop").await?;
        if payload.params.is_empty() {
            step.log("无参数");
        } else {
            step.log(format!("参数: {}", payload.params.as_str()));
        }
        step.success().await
    }

    fn description(&self) -> &str {
        "空任务，用于冒烟检查"
    }
}
