//! 分布式锁管理
//!
//! 只在任务禁止并发且配置了共享缓存时启用。加锁是带过期时间的 SET NX，
//! 释放时先比较令牌再删除，保证只删除自己持有的锁。

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use jobs_core::models::Job;
use jobs_core::{JobResult, LockStore};
use tracing::{debug, error, warn};

/// 锁键前缀
pub const LOCK_KEY_PREFIX: &str = "jobs:lock:";

/// 锁过期时间上限，参数覆盖值超过时按上限处理
pub const MAX_LOCK_TTL: Duration = Duration::from_secs(30 * 24 * 3600);

pub fn lock_key(job_id: i64) -> String {
    format!("{LOCK_KEY_PREFIX}{job_id}")
}

/// 生成本进程唯一的锁令牌：`主机名:进程号:随机串`
fn new_token() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    let random: [u8; 16] = rand::random();
    let mut token = format!("{}:{}:", host, std::process::id());
    for byte in random {
        let _ = write!(token, "{byte:02x}");
    }
    token
}

#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn LockStore>,
    default_ttl: Duration,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn LockStore>, default_ttl: Duration) -> Self {
        Self { store, default_ttl }
    }

    /// 任务参数 `lockTTLSeconds` 覆盖默认过期时间，不超过 [`MAX_LOCK_TTL`]
    pub fn ttl_for(&self, job: &Job) -> Duration {
        job.lock_ttl_override()
            .map(Duration::from_secs)
            .unwrap_or(self.default_ttl)
            .min(MAX_LOCK_TTL)
    }

    /// 尝试获取任务锁，不等待
    ///
    /// 锁被占用时返回 `Ok(None)`，后端故障返回错误。
    pub async fn acquire(&self, job: &Job) -> JobResult<Option<LockGuard>> {
        let key = lock_key(job.id);
        let token = new_token();
        let ttl = self.ttl_for(job);

        if self.store.set_nx_ex(&key, &token, ttl).await? {
            debug!(
                "获取任务锁成功: key={}, ttl={}s, backend={}",
                key,
                ttl.as_secs(),
                self.store.backend_name()
            );
            Ok(Some(LockGuard {
                store: Arc::clone(&self.store),
                key,
                token,
                released: false,
            }))
        } else {
            debug!("任务锁已被占用: key={}", key);
            Ok(None)
        }
    }
}

/// 已持有的任务锁
pub struct LockGuard {
    store: Arc<dyn LockStore>,
    key: String,
    token: String,
    released: bool,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// 释放锁，错误只记录日志
    ///
    /// 返回是否确实删除了锁键；锁已过期或被他人持有时返回 `false`。
    pub async fn release(mut self) -> bool {
        self.released = true;
        match self.store.compare_and_delete(&self.key, &self.token).await {
            Ok(true) => {
                debug!("释放任务锁: key={}", self.key);
                true
            }
            Ok(false) => {
                warn!("任务锁已过期或不再由本实例持有: key={}", self.key);
                false
            }
            Err(e) => {
                error!("释放任务锁失败: key={}, error={}", self.key, e);
                false
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            warn!("任务锁未显式释放，将在过期后失效: key={}", self.key);
        }
    }
}
