//! 持久化协作者接口定义
//!
//! 任务定义、执行日志和步骤日志的存储由外部协作者提供，引擎只依赖这里的接口：
//! - 任务仓储接口 (JobRepository)
//! - 执行日志仓储接口 (JobRunRepository)
//! - 步骤日志仓储接口 (JobStepRepository)
//!
//! 每次调用视为独立事务；查询不存在的记录返回 `None`，
//! 更新不存在的记录返回对应的 `*NotFound` 错误。
//!
//! ## 使用示例
//!
//! ```rust,ignore
//! use jobs_core::traits::JobRunRepository;
//! use jobs_core::models::{JobRun, RunStatus, TriggerSource};
//!
//! async fn already_running(repo: &dyn JobRunRepository, job_id: i64) -> JobResult<bool> {
//!     Ok(repo.latest_by_status(job_id, RunStatus::Running).await?.is_some())
//! }
//! ```

use async_trait::async_trait;

use crate::models::{Job, JobRun, JobStep, RunCompletion, RunStatus, StepCompletion};
use crate::JobResult;

/// 任务仓储接口
///
/// 任务定义归CRUD层所有，调度器在增删改和启动时通过它读写。
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// 创建任务，返回带有生成ID的任务
    async fn create(&self, job: &Job) -> JobResult<Job>;

    /// 根据ID获取任务
    async fn get_by_id(&self, id: i64) -> JobResult<Option<Job>>;

    /// 更新任务
    async fn update(&self, job: &Job) -> JobResult<()>;

    /// 删除任务
    async fn delete(&self, id: i64) -> JobResult<()>;

    /// 列出所有启用状态的任务（启动调度时使用）
    async fn list_enabled(&self) -> JobResult<Vec<Job>>;
}

/// 执行日志仓储接口
#[async_trait]
pub trait JobRunRepository: Send + Sync {
    /// 创建执行记录，返回带有生成ID的记录
    async fn create(&self, run: &JobRun) -> JobResult<JobRun>;

    /// 根据ID获取执行记录
    async fn get_by_id(&self, id: i64) -> JobResult<Option<JobRun>>;

    /// 写入终态。记录不处于运行中时返回冲突错误，保证只转换一次
    async fn finish(&self, id: i64, completion: &RunCompletion) -> JobResult<()>;

    /// 获取某个任务指定状态的最新一条执行记录
    async fn latest_by_status(&self, job_id: i64, status: RunStatus)
        -> JobResult<Option<JobRun>>;

    /// 按创建时间倒序列出某个任务最近的执行记录
    async fn list_by_job(&self, job_id: i64, limit: usize) -> JobResult<Vec<JobRun>>;
}

/// 步骤日志仓储接口
#[async_trait]
pub trait JobStepRepository: Send + Sync {
    /// 创建步骤记录，返回带有生成ID的记录
    async fn create(&self, step: &JobStep) -> JobResult<JobStep>;

    /// 写入步骤终态
    async fn finish(&self, id: i64, completion: &StepCompletion) -> JobResult<()>;

    /// 按序号升序列出某次执行的全部步骤
    async fn list_by_run(&self, run_id: i64) -> JobResult<Vec<JobStep>>;
}
