//! 定时任务调度与执行引擎
//!
//! - [`JobScheduler`] 维护cron条目，处理任务增删改和手动触发
//! - [`ExecutionEngine`] 执行单次运行：加锁、执行器、终态写入
//! - [`StepLogger`] 执行内的步骤记录
//! - [`LogStreamHub`] 按执行ID推送步骤事件

pub mod cron_utils;
pub mod execution;
pub mod executor;
pub mod heartbeat;
pub mod lock;
mod metrics;
pub mod registry;
pub mod scheduler;
pub mod step_logger;
pub mod stream_hub;

pub use cron_utils::CronScheduler;
pub use execution::{build_summary, ExecutionEngine, RunOutcome, RunRequest};
pub use executor::{executor_fn, ExecutionPayload, FnExecutor, JobExecutor, JobParams};
pub use heartbeat::{with_heartbeat, DEFAULT_HEARTBEAT_INTERVAL};
pub use lock::{lock_key, DistributedLock, LockGuard, LOCK_KEY_PREFIX, MAX_LOCK_TTL};
pub use registry::ExecutorRegistry;
pub use scheduler::JobScheduler;
pub use step_logger::{Step, StepLogger};
pub use stream_hub::{LogStreamHub, LogSubscription, UnsubscribeHandle, DEFAULT_STREAM_BUFFER};
