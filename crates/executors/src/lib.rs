//! 内置执行器
//!
//! 启动时通过 [`register_builtin`] 注册到执行器注册表：
//!
//! - `shell` 执行本地命令
//! - `http` 发送HTTP请求
//! - `noop` 空任务

use std::sync::Arc;

use jobs_core::JobResult;
use jobs_engine::ExecutorRegistry;

pub mod http;
pub mod noop;
pub mod shell;

pub use http::{HttpExecutor, HttpTaskParams};
pub use noop::NoopExecutor;
pub use shell::{ShellExecutor, ShellTaskParams};

pub const SHELL_TARGET: &str = "shell";
pub const HTTP_TARGET: &str = "http";
pub const NOOP_TARGET: &str = "noop";

/// 注册全部内置执行器
pub fn register_builtin(registry: &ExecutorRegistry) -> JobResult<()> {
    registry.register(SHELL_TARGET, Arc::new(ShellExecutor::new()))?;
    registry.register(HTTP_TARGET, Arc::new(HttpExecutor::new()))?;
    registry.register(NOOP_TARGET, Arc::new(NoopExecutor))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_builtin() {
        let registry = ExecutorRegistry::new();
        register_builtin(&registry).unwrap();
        assert_eq!(registry.keys(), vec!["http", "noop", "shell"]);

        // 重复注册会冲突
        assert!(register_builtin(&registry).is_err());
    }
}
