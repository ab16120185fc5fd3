use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{JobError, JobResult};

/// 调用参数中用于覆盖分布式锁过期时间的键
pub const LOCK_TTL_PARAM_KEY: &str = "lockTTLSeconds";

/// 定时任务定义
///
/// 由后台管理的CRUD层维护，调度器和执行引擎只读取它。
///
/// # 字段说明
///
/// - `invoke_target`: 执行器注册表中的键，保存时不校验是否已注册
/// - `invoke_params`: 不透明的JSON文本，原样交给执行器
/// - `cron_expression`: 秒级精度的cron表达式，在校验和调度时解析
///
/// # 使用示例
///
/// ```rust
/// use jobs_core::models::{Concurrency, Job, JobStatus};
///
/// let job = Job::new("清理临时文件", "shell", "0 0 2 * * ?")
///     .with_params(r#"{"command":"rm","args":["-rf","/tmp/cache"]}"#)
///     .with_concurrency(Concurrency::Forbid);
/// assert_eq!(job.status, JobStatus::Enabled);
/// assert!(job.forbids_overlap());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: i64,
    pub name: String,
    pub group: String,
    pub invoke_target: String,
    pub invoke_params: String,
    pub cron_expression: String,
    pub misfire_policy: MisfirePolicy,
    pub concurrency: Concurrency,
    pub status: JobStatus,
    pub remark: Option<String>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_by: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// 创建新任务，默认分组为 `DEFAULT`，允许并发，启用状态
    pub fn new(name: &str, invoke_target: &str, cron_expression: &str) -> Self {
        let now = Utc::now();
        Self {
            id: 0, // 将由存储层生成
            name: name.to_string(),
            group: "DEFAULT".to_string(),
            invoke_target: invoke_target.to_string(),
            invoke_params: String::new(),
            cron_expression: cron_expression.to_string(),
            misfire_policy: MisfirePolicy::Default,
            concurrency: Concurrency::Allow,
            status: JobStatus::Enabled,
            remark: None,
            created_by: None,
            created_at: now,
            updated_by: None,
            updated_at: now,
        }
    }

    pub fn with_group(mut self, group: &str) -> Self {
        self.group = group.to_string();
        self
    }

    pub fn with_params(mut self, params: &str) -> Self {
        self.invoke_params = params.to_string();
        self
    }

    pub fn with_concurrency(mut self, concurrency: Concurrency) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_misfire_policy(mut self, policy: MisfirePolicy) -> Self {
        self.misfire_policy = policy;
        self
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = status;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.status == JobStatus::Enabled
    }

    pub fn forbids_overlap(&self) -> bool {
        self.concurrency == Concurrency::Forbid
    }

    /// 从调用参数中读取锁过期时间覆盖值
    ///
    /// 仅当参数是JSON对象且 `lockTTLSeconds` 为正整数时生效。
    pub fn lock_ttl_override(&self) -> Option<u64> {
        if self.invoke_params.trim().is_empty() {
            return None;
        }
        let value: serde_json::Value = serde_json::from_str(&self.invoke_params).ok()?;
        let ttl = value.get(LOCK_TTL_PARAM_KEY)?;
        ttl.as_u64()
            .or_else(|| ttl.as_f64().filter(|v| v.fract() == 0.0 && *v > 0.0).map(|v| v as u64))
            .or_else(|| ttl.as_str().and_then(|s| s.trim().parse::<u64>().ok()))
            .filter(|ttl| *ttl > 0)
    }
}

/// 错过执行策略
///
/// 调度器醒来时已经超过预定触发时间的处理方式。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(try_from = "i32", into = "i32")]
pub enum MisfirePolicy {
    /// 默认策略，补触发一次
    #[default]
    Default,
    /// 忽略错过，每个错过的时间点都补触发
    FireAll,
    /// 只补触发一次
    FireOnce,
    /// 不补触发
    DoNothing,
}

impl MisfirePolicy {
    pub fn code(self) -> i32 {
        match self {
            MisfirePolicy::Default => 0,
            MisfirePolicy::FireAll => 1,
            MisfirePolicy::FireOnce => 2,
            MisfirePolicy::DoNothing => 3,
        }
    }
}

impl TryFrom<i32> for MisfirePolicy {
    type Error = JobError;

    fn try_from(code: i32) -> JobResult<Self> {
        match code {
            0 => Ok(MisfirePolicy::Default),
            1 => Ok(MisfirePolicy::FireAll),
            2 => Ok(MisfirePolicy::FireOnce),
            3 => Ok(MisfirePolicy::DoNothing),
            other => Err(JobError::InvalidMisfirePolicy(other)),
        }
    }
}

impl From<MisfirePolicy> for i32 {
    fn from(policy: MisfirePolicy) -> Self {
        policy.code()
    }
}

/// 并发策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(try_from = "i32", into = "i32")]
pub enum Concurrency {
    #[default]
    Allow,
    Forbid,
}

impl Concurrency {
    pub fn code(self) -> i32 {
        match self {
            Concurrency::Allow => 0,
            Concurrency::Forbid => 1,
        }
    }
}

impl TryFrom<i32> for Concurrency {
    type Error = JobError;

    fn try_from(code: i32) -> JobResult<Self> {
        match code {
            0 => Ok(Concurrency::Allow),
            1 => Ok(Concurrency::Forbid),
            other => Err(JobError::InvalidArgument(format!("未知的并发策略: {other}"))),
        }
    }
}

impl From<Concurrency> for i32 {
    fn from(value: Concurrency) -> Self {
        value.code()
    }
}

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(try_from = "i32", into = "i32")]
pub enum JobStatus {
    #[default]
    Enabled,
    Disabled,
}

impl JobStatus {
    pub fn code(self) -> i32 {
        match self {
            JobStatus::Enabled => 0,
            JobStatus::Disabled => 1,
        }
    }
}

impl TryFrom<i32> for JobStatus {
    type Error = JobError;

    fn try_from(code: i32) -> JobResult<Self> {
        match code {
            0 => Ok(JobStatus::Enabled),
            1 => Ok(JobStatus::Disabled),
            other => Err(JobError::InvalidArgument(format!("未知的任务状态: {other}"))),
        }
    }
}

impl From<JobStatus> for i32 {
    fn from(value: JobStatus) -> Self {
        value.code()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Enabled => write!(f, "enabled"),
            JobStatus::Disabled => write!(f, "disabled"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_misfire_policy_codes() {
        for code in 0..=3 {
            let policy = MisfirePolicy::try_from(code).unwrap();
            assert_eq!(policy.code(), code);
        }
        assert!(matches!(
            MisfirePolicy::try_from(7),
            Err(JobError::InvalidMisfirePolicy(7))
        ));
    }

    #[test]
    fn test_job_serde_uses_codes() {
        let job = Job::new("备份", "shell", "0 0 2 * * ?")
            .with_concurrency(Concurrency::Forbid)
            .with_misfire_policy(MisfirePolicy::DoNothing);
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["concurrency"], 1);
        assert_eq!(value["misfire_policy"], 3);
        assert_eq!(value["status"], 0);

        let mut raw = value.clone();
        raw["misfire_policy"] = serde_json::json!(5);
        assert!(serde_json::from_value::<Job>(raw).is_err());
    }

    #[test]
    fn test_lock_ttl_override() {
        let job = Job::new("a", "noop", "* * * * * *");
        assert_eq!(job.lock_ttl_override(), None);

        let job = job.with_params(r#"{"lockTTLSeconds": 30}"#);
        assert_eq!(job.lock_ttl_override(), Some(30));

        let job = job.with_params(r#"{"lockTTLSeconds": "45"}"#);
        assert_eq!(job.lock_ttl_override(), Some(45));

        let job = job.with_params(r#"{"lockTTLSeconds": 0}"#);
        assert_eq!(job.lock_ttl_override(), None);

        let job = job.with_params(r#"{"lockTTLSeconds": -5}"#);
        assert_eq!(job.lock_ttl_override(), None);

        let job = job.with_params("not json");
        assert_eq!(job.lock_ttl_override(), None);
    }
}
