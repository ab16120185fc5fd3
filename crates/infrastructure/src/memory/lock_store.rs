use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use jobs_core::{JobError, JobResult, LockStore};

/// 单进程锁存储
///
/// 过期时间在读取时判断，过期的键视为不存在。
#[derive(Debug, Default)]
pub struct InMemoryLockStore {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前未过期的持有者令牌
    pub fn holder(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(key)
            .filter(|(_, expires_at)| *expires_at > Instant::now())
            .map(|(token, _)| token.clone())
    }
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn set_nx_ex(&self, key: &str, token: &str, ttl: Duration) -> JobResult<bool> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        if let Some((_, expires_at)) = entries.get(key) {
            if *expires_at > now {
                return Ok(false);
            }
        }
        let expires_at = now
            .checked_add(ttl)
            .ok_or_else(|| JobError::LockBackend(format!("锁过期时间超出范围: {}s", ttl.as_secs())))?;
        entries.insert(key.to_string(), (token.to_string(), expires_at));
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, token: &str) -> JobResult<bool> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let owned = entries
            .get(key)
            .is_some_and(|(holder, expires_at)| holder == token && *expires_at > Instant::now());
        if owned {
            entries.remove(key);
        }
        Ok(owned)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_nx_and_compare_delete() {
        let store = InMemoryLockStore::new();
        let ttl = Duration::from_secs(60);
        assert!(store.set_nx_ex("k", "a", ttl).await.unwrap());
        assert!(!store.set_nx_ex("k", "b", ttl).await.unwrap());
        assert_eq!(store.holder("k").as_deref(), Some("a"));

        assert!(!store.compare_and_delete("k", "b").await.unwrap());
        assert!(store.compare_and_delete("k", "a").await.unwrap());
        assert!(store.holder("k").is_none());
        assert!(!store.compare_and_delete("k", "a").await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_key_is_free() {
        let store = InMemoryLockStore::new();
        assert!(store
            .set_nx_ex("k", "a", Duration::from_millis(20))
            .await
            .unwrap());
        std::thread::sleep(Duration::from_millis(40));

        assert!(store.holder("k").is_none());
        assert!(store.set_nx_ex("k", "b", Duration::from_secs(60)).await.unwrap());
        assert!(!store.compare_and_delete("k", "a").await.unwrap());
    }

    #[tokio::test]
    async fn test_overflowing_ttl_is_rejected() {
        let store = InMemoryLockStore::new();
        let err = store.set_nx_ex("k", "a", Duration::MAX).await.unwrap_err();
        assert!(matches!(err, JobError::LockBackend(_)));
        assert!(store.holder("k").is_none());

        assert!(store.set_nx_ex("k", "b", Duration::from_secs(60)).await.unwrap());
    }
}
