//! # 数据模型
//!
//! 定时任务引擎的核心数据结构：
//!
//! - [`Job`] 任务定义，由CRUD层维护
//! - [`JobRun`] 一次执行的审计记录（任务日志）
//! - [`JobStep`] 执行内按序号排列的步骤
//! - [`StepEvent`] 推送给订阅者的瞬时事件
//!
//! ## 状态流转
//!
//! ```text
//! JobRun:  Running ──▶ Success
//!             └──────▶ Failed      (只转换一次)
//!
//! JobStep: Running ──▶ Success | Failed
//! ```
//!
//! 枚举字段在序列化时使用数值编码（与后台管理界面的字典值一致），
//! 未知编码在反序列化时即被拒绝。

pub mod event;
pub mod job;
pub mod run;
pub mod step;

pub use event::*;
pub use job::*;
pub use run::*;
pub use step::*;
