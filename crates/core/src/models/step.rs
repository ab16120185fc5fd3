use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{JobError, JobResult};

/// 执行步骤
///
/// 一次执行中按序号排列的子阶段。`ordinal` 从1开始，同一执行内连续无空洞。
/// `output` 为步骤日志缓冲区按行拼接的结果，只在终态时写入。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobStep {
    pub id: i64,
    pub run_id: i64,
    pub ordinal: i32,
    pub name: String,
    pub status: StepStatus,
    pub output: Option<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl JobStep {
    pub fn running(run_id: i64, ordinal: i32, name: &str) -> Self {
        Self {
            id: 0,
            run_id,
            ordinal,
            name: name.to_string(),
            status: StepStatus::Running,
            output: None,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: None,
        }
    }

    pub fn apply_completion(&mut self, completion: &StepCompletion) {
        self.status = completion.status;
        self.output = completion.output.clone();
        self.error = completion.error.clone();
        self.finished_at = Some(completion.finished_at);
        self.duration_ms = Some(completion.duration_ms);
    }
}

/// 步骤终态数据
#[derive(Debug, Clone, PartialEq)]
pub struct StepCompletion {
    pub status: StepStatus,
    pub output: Option<String>,
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Success,
    Failed,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Running => "running",
            StepStatus::Success => "success",
            StepStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StepStatus {
    type Err = JobError;

    fn from_str(s: &str) -> JobResult<Self> {
        match s {
            "running" => Ok(StepStatus::Running),
            "success" => Ok(StepStatus::Success),
            "failed" => Ok(StepStatus::Failed),
            other => Err(JobError::InvalidArgument(format!("未知的步骤状态: {other}"))),
        }
    }
}
