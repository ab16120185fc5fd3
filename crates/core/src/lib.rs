//! 定时任务引擎的共享类型：数据模型、错误、配置和外部协作者接口。

pub mod config;
pub mod errors;
pub mod models;
pub mod traits;

pub use errors::{JobError, JobResult};
pub use models::{
    Concurrency, Job, JobRun, JobStatus, JobStep, MisfirePolicy, RunCompletion, RunStatus,
    StepCompletion, StepEvent, StepEventKind, StepStatus, TriggerSource,
};
pub use traits::{JobRepository, JobRunRepository, JobStepRepository, LockStore};
