use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use jobs_core::{JobError, JobResult};
use jobs_engine::{ExecutionPayload, JobExecutor, Step};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{info, warn, Instrument};

/// Shell任务参数
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShellTaskParams {
    /// 要执行的命令
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Shell任务执行器
///
/// stdout和stderr逐行写入同一个步骤，非零退出码视为失败。取消令牌触发时
/// 终止子进程。
#[derive(Debug, Default)]
pub struct ShellExecutor;

impl ShellExecutor {
    pub fn new() -> Self {
        Self
    }
}

async fn pipe_lines<R>(reader: Option<R>, step: &Step, prefix: &str)
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return;
    };
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => step.log(format!("{prefix}{line}")),
            Ok(None) => break,
            Err(e) => {
                step.log(format!("读取输出失败: {e}"));
                break;
            }
        }
    }
}

#[async_trait]
impl JobExecutor for ShellExecutor {
    async fn execute(&self, payload: ExecutionPayload) -> JobResult<()> {
        let params: ShellTaskParams = payload.params.parse()?;
        if params.command.trim().is_empty() {
            return Err(JobError::InvalidParams("Shell命令不能为空".to_string()));
        }

        let span = payload.span.clone();
        async move {
            info!(
                "执行Shell任务: run_id={}, command={}, args={:?}",
                payload.run_id, params.command, params.args
            );

            let step = payload.steps.start_step(&params.command).await?;

            let mut cmd = Command::new(&params.command);
            cmd.args(&params.args)
                .envs(&params.env)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);
            if let Some(dir) = &params.working_dir {
                cmd.current_dir(dir);
            }

            let mut child = match cmd.spawn() {
                Ok(child) => child,
                Err(e) => {
                    let message = format!("启动Shell命令失败: {e}");
                    step.fail(&message).await?;
                    return Err(JobError::Execution(message));
                }
            };

            let stdout = child.stdout.take();
            let stderr = child.stderr.take();
            let output = async {
                tokio::join!(
                    pipe_lines(stdout, &step, ""),
                    pipe_lines(stderr, &step, "[stderr] ")
                );
                child.wait().await
            };

            let waited = tokio::select! {
                status = output => Some(status),
                _ = payload.cancel.cancelled() => None,
            };
            let Some(status) = waited else {
                warn!("Shell任务被取消，终止子进程: run_id={}", payload.run_id);
                if let Err(e) = child.kill().await {
                    warn!("终止子进程失败: run_id={}, error={}", payload.run_id, e);
                }
                step.fail("任务被取消").await?;
                return Err(JobError::Execution("任务被取消".to_string()));
            };

            let status = match status {
                Ok(status) => status,
                Err(e) => {
                    let message = format!("等待进程结束失败: {e}");
                    step.fail(&message).await?;
                    return Err(JobError::Execution(message));
                }
            };

            info!(
                "Shell任务执行完成: run_id={}, success={}, exit_code={:?}",
                payload.run_id,
                status.success(),
                status.code()
            );

            if status.success() {
                step.success().await
            } else {
                let message = format!("命令执行失败，退出码: {:?}", status.code());
                step.fail(&message).await?;
                Err(JobError::Execution(message))
            }
        }
        .instrument(span)
        .await
    }

    fn description(&self) -> &str {
        "执行Shell命令"
    }
}
