use thiserror::Error;

/// 任务引擎错误类型定义
#[derive(Debug, Error)]
pub enum JobError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("任务未找到: {id}")]
    JobNotFound { id: i64 },

    #[error("任务执行日志未找到: {id}")]
    RunNotFound { id: i64 },

    #[error("任务步骤未找到: {id}")]
    StepNotFound { id: i64 },

    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },

    #[error("未知的错过执行策略: {0}")]
    InvalidMisfirePolicy(i32),

    #[error("无效的参数: {0}")]
    InvalidArgument(String),

    #[error("执行器已注册: {0}")]
    DuplicateExecutor(String),

    #[error("任务冲突: {0}")]
    Conflict(String),

    #[error("分布式锁错误: {0}")]
    LockBackend(String),

    #[error("步骤已结束: {ordinal}")]
    StepAlreadyFinished { ordinal: i32 },

    #[error("无效的任务参数: {0}")]
    InvalidParams(String),

    #[error("任务执行错误: {0}")]
    Execution(String),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl JobError {
    /// 是否为并发冲突（锁被占用或已有运行中的实例）
    pub fn is_conflict(&self) -> bool {
        matches!(self, JobError::Conflict(_))
    }

    /// 是否为校验类错误，这类错误在进入执行引擎之前同步返回
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            JobError::InvalidCron { .. }
                | JobError::InvalidMisfirePolicy(_)
                | JobError::InvalidArgument(_)
        )
    }
}

/// 统一的Result类型
pub type JobResult<T> = std::result::Result<T, JobError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(JobError::Conflict("busy".to_string()).is_conflict());
        assert!(!JobError::Internal("x".to_string()).is_conflict());
        assert!(JobError::InvalidMisfirePolicy(9).is_validation());
        assert!(JobError::InvalidCron {
            expr: "bad".to_string(),
            message: "parse".to_string()
        }
        .is_validation());
        assert!(!JobError::LockBackend("down".to_string()).is_validation());
    }

    #[test]
    fn test_error_display() {
        let err = JobError::JobNotFound { id: 42 };
        assert_eq!(err.to_string(), "任务未找到: 42");
        let err = JobError::StepAlreadyFinished { ordinal: 3 };
        assert_eq!(err.to_string(), "步骤已结束: 3");
    }
}
