use std::time::Duration;

use async_trait::async_trait;
use jobs_core::config::CacheConfig;
use jobs_core::{JobError, JobResult, LockStore};
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::info;

/// 令牌匹配时才删除锁键
const COMPARE_AND_DELETE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

fn backend_error(e: redis::RedisError) -> JobError {
    JobError::LockBackend(e.to_string())
}

/// 基于Redis的锁存储，多个调度实例共享
#[derive(Clone)]
pub struct RedisLockStore {
    conn: ConnectionManager,
    release_script: Script,
}

impl RedisLockStore {
    pub async fn new(config: &CacheConfig) -> JobResult<Self> {
        info!("连接Redis锁存储: {}", config.redis_url);

        let client = redis::Client::open(config.redis_url.as_str()).map_err(backend_error)?;
        let timeout = Duration::from_secs(config.connection_timeout_seconds);
        let mut conn = tokio::time::timeout(timeout, client.get_connection_manager())
            .await
            .map_err(|_| {
                JobError::LockBackend(format!("连接Redis超时({}秒)", timeout.as_secs()))
            })?
            .map_err(backend_error)?;

        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(backend_error)?;

        Ok(Self {
            conn,
            release_script: Script::new(COMPARE_AND_DELETE),
        })
    }
}

#[async_trait]
impl LockStore for RedisLockStore {
    async fn set_nx_ex(&self, key: &str, token: &str, ttl: Duration) -> JobResult<bool> {
        let mut conn = self.conn.clone();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(backend_error)?;
        Ok(reply.is_some())
    }

    async fn compare_and_delete(&self, key: &str, token: &str) -> JobResult<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .release_script
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(backend_error)?;
        Ok(deleted == 1)
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}
