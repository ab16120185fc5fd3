use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Job;
use crate::errors::{JobError, JobResult};

/// 异常信息持久化前截断的最大字符数
pub const MAX_EXCEPTION_CHARS: usize = 2000;

/// 任务执行日志
///
/// 一次执行尝试的审计记录。任务名称、分组、调用目标和参数在派发时做快照，
/// 之后对任务定义的修改或删除不会影响历史记录。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRun {
    pub id: i64,
    pub job_id: i64,
    pub job_name: String,
    pub job_group: String,
    pub invoke_target: String,
    pub invoke_params: String,
    pub trigger: TriggerSource,
    pub status: RunStatus,
    pub message: Option<String>,
    pub exception: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub elapsed_ms: Option<i64>,
}

impl JobRun {
    /// 以任务快照创建一条运行中的执行记录
    pub fn running(job: &Job, trigger: TriggerSource) -> Self {
        Self {
            id: 0, // 将由存储层生成
            job_id: job.id,
            job_name: job.name.clone(),
            job_group: job.group.clone(),
            invoke_target: job.invoke_target.clone(),
            invoke_params: job.invoke_params.clone(),
            trigger,
            status: RunStatus::Running,
            message: None,
            exception: None,
            created_at: Utc::now(),
            finished_at: None,
            elapsed_ms: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == RunStatus::Running
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_running()
    }

    /// 应用终态，只允许从运行中转换一次
    pub fn apply_completion(&mut self, completion: &RunCompletion) -> JobResult<()> {
        if self.is_terminal() {
            return Err(JobError::Conflict(format!(
                "执行记录 {} 已处于终态 {}",
                self.id, self.status
            )));
        }
        if !completion.status.is_terminal() {
            return Err(JobError::InvalidArgument(
                "执行记录只能转换为成功或失败".to_string(),
            ));
        }
        self.status = completion.status;
        self.message = Some(completion.message.clone());
        self.exception = completion.exception.clone();
        self.finished_at = Some(completion.finished_at);
        self.elapsed_ms = Some(completion.elapsed_ms);
        Ok(())
    }
}

/// 执行记录的终态数据
#[derive(Debug, Clone, PartialEq)]
pub struct RunCompletion {
    pub status: RunStatus,
    pub message: String,
    pub exception: Option<String>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: i64,
}

/// 执行状态，`Running` 的编码为 2
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum RunStatus {
    Success,
    Failed,
    Running,
}

impl RunStatus {
    pub fn code(self) -> i32 {
        match self {
            RunStatus::Success => 0,
            RunStatus::Failed => 1,
            RunStatus::Running => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl TryFrom<i32> for RunStatus {
    type Error = JobError;

    fn try_from(code: i32) -> JobResult<Self> {
        match code {
            0 => Ok(RunStatus::Success),
            1 => Ok(RunStatus::Failed),
            2 => Ok(RunStatus::Running),
            other => Err(JobError::InvalidArgument(format!("未知的执行状态: {other}"))),
        }
    }
}

impl From<RunStatus> for i32 {
    fn from(value: RunStatus) -> Self {
        value.code()
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Success => write!(f, "success"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Running => write!(f, "running"),
        }
    }
}

/// 触发来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Cron,
    Manual,
}

impl TriggerSource {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerSource::Cron => "cron",
            TriggerSource::Manual => "manual",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            TriggerSource::Cron => "定时触发",
            TriggerSource::Manual => "手动触发",
        }
    }
}

impl std::str::FromStr for TriggerSource {
    type Err = JobError;

    fn from_str(s: &str) -> JobResult<Self> {
        match s {
            "cron" => Ok(TriggerSource::Cron),
            "manual" => Ok(TriggerSource::Manual),
            other => Err(JobError::InvalidArgument(format!("未知的触发来源: {other}"))),
        }
    }
}

/// 按字符（而非字节）截断文本
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// 按默认上限截断异常文本
pub fn truncate_exception(text: &str) -> String {
    truncate_chars(text, MAX_EXCEPTION_CHARS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completion(status: RunStatus) -> RunCompletion {
        RunCompletion {
            status,
            message: "done".to_string(),
            exception: None,
            finished_at: Utc::now(),
            elapsed_ms: 5,
        }
    }

    #[test]
    fn test_run_snapshot_from_job() {
        let mut job = Job::new("同步字典", "noop", "0 * * * * *").with_params("{\"a\":1}");
        job.id = 9;
        let run = JobRun::running(&job, TriggerSource::Manual);
        assert_eq!(run.job_id, 9);
        assert_eq!(run.job_name, "同步字典");
        assert_eq!(run.invoke_params, "{\"a\":1}");
        assert!(run.is_running());
        assert_eq!(run.status.code(), 2);
    }

    #[test]
    fn test_completion_applies_once() {
        let job = Job::new("a", "noop", "* * * * * *");
        let mut run = JobRun::running(&job, TriggerSource::Cron);
        run.apply_completion(&completion(RunStatus::Success)).unwrap();
        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.elapsed_ms, Some(5));

        let err = run.apply_completion(&completion(RunStatus::Failed)).unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(run.status, RunStatus::Success);
    }

    #[test]
    fn test_completion_rejects_running() {
        let job = Job::new("a", "noop", "* * * * * *");
        let mut run = JobRun::running(&job, TriggerSource::Cron);
        assert!(run.apply_completion(&completion(RunStatus::Running)).is_err());
        assert!(run.is_running());
    }

    #[test]
    fn test_truncate_exception_counts_chars() {
        let short = "错误";
        assert_eq!(truncate_exception(short), short);

        let long = "异".repeat(MAX_EXCEPTION_CHARS + 10);
        let truncated = truncate_exception(&long);
        assert_eq!(truncated.chars().count(), MAX_EXCEPTION_CHARS);
        assert_eq!(truncate_chars("abcdef", 3), "abc");
        assert_eq!(truncate_chars("abc", 0), "");
    }
}
