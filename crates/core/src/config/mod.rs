//! 配置加载
//!
//! 加载顺序：默认值 → TOML配置文件 → 环境变量（前缀 `JOBS_`，层级分隔符 `__`）。

pub mod models;

pub use models::*;
