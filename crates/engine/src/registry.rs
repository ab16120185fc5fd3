//! 执行器注册表
//!
//! 调用目标字符串到执行器实例的映射。键在注册和查找时都会去除首尾空白并转为小写。
//! 只能追加：一个键绑定后不能被替换。

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use jobs_core::{JobError, JobResult};
use tracing::info;

use crate::executor::JobExecutor;

#[derive(Default)]
pub struct ExecutorRegistry {
    executors: RwLock<HashMap<String, Arc<dyn JobExecutor>>>,
}

fn normalize_key(key: &str) -> String {
    key.trim().to_lowercase()
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册执行器
    ///
    /// 空键返回 `InvalidArgument`，已绑定的键返回 `DuplicateExecutor`。
    pub fn register(&self, key: &str, executor: Arc<dyn JobExecutor>) -> JobResult<()> {
        let key = normalize_key(key);
        if key.is_empty() {
            return Err(JobError::InvalidArgument("执行器键不能为空".to_string()));
        }

        let mut executors = self
            .executors
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if executors.contains_key(&key) {
            return Err(JobError::DuplicateExecutor(key));
        }

        info!("注册执行器: {} {}", key, executor.description());
        executors.insert(key, executor);
        Ok(())
    }

    /// 查找执行器，未注册返回 `None`
    pub fn resolve(&self, key: &str) -> Option<Arc<dyn JobExecutor>> {
        self.executors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&normalize_key(key))
            .cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.resolve(key).is_some()
    }

    /// 已注册的调用目标，按字母序
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .executors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.executors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
