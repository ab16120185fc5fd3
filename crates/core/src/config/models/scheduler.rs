use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::models::MAX_EXCEPTION_CHARS;

/// 调度与执行引擎配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// 任务参数未覆盖时的分布式锁过期时间
    pub default_lock_ttl_seconds: u64,
    /// 每个日志流订阅者的缓冲区大小
    pub stream_buffer_size: usize,
    /// 日志流心跳间隔
    pub heartbeat_interval_seconds: u64,
    /// 触发延迟超过该值视为错过执行
    pub misfire_threshold_ms: u64,
    /// 异常信息持久化前截断的字符数
    pub exception_max_chars: usize,
    /// 停止时等待执行中任务的最长时间
    pub shutdown_timeout_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_lock_ttl_seconds: 180,
            stream_buffer_size: 256,
            heartbeat_interval_seconds: 15,
            misfire_threshold_ms: 1000,
            exception_max_chars: MAX_EXCEPTION_CHARS,
            shutdown_timeout_seconds: 30,
        }
    }
}

impl SchedulerConfig {
    pub fn default_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.default_lock_ttl_seconds)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    pub fn misfire_threshold(&self) -> Duration {
        Duration::from_millis(self.misfire_threshold_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.default_lock_ttl_seconds == 0 {
            return Err(anyhow::anyhow!("默认锁过期时间必须大于0"));
        }

        if self.stream_buffer_size == 0 {
            return Err(anyhow::anyhow!("日志流缓冲区大小必须大于0"));
        }

        if self.heartbeat_interval_seconds == 0 {
            return Err(anyhow::anyhow!("心跳间隔必须大于0"));
        }

        if self.exception_max_chars == 0 {
            return Err(anyhow::anyhow!("异常截断长度必须大于0"));
        }

        Ok(())
    }
}
