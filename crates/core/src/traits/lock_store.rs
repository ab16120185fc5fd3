use std::time::Duration;

use async_trait::async_trait;

use crate::JobResult;

/// 共享缓存协作者
///
/// 分布式锁只需要两个原语：带过期时间的 SET NX，以及比较令牌后原子删除。
/// 除锁管理器之外，任何代码都不应直接操作锁键。
#[async_trait]
pub trait LockStore: Send + Sync {
    /// 键不存在时写入令牌并设置过期时间，写入成功返回 `true`
    async fn set_nx_ex(&self, key: &str, token: &str, ttl: Duration) -> JobResult<bool>;

    /// 仅当键的当前值等于 `token` 时删除，删除成功返回 `true`
    async fn compare_and_delete(&self, key: &str, token: &str) -> JobResult<bool>;

    /// 后端名称，用于日志
    fn backend_name(&self) -> &'static str;
}
