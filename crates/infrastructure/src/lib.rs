//! 持久化和共享缓存的参考实现
//!
//! - [`memory`] 进程内仓储和锁存储
//! - [`database`] 基于sqlx的SQLite仓储
//! - [`redis_lock`] 基于Redis的分布式锁存储

pub mod database;
pub mod memory;
pub mod redis_lock;

pub use database::{
    DatabaseManager, SqliteJobRepository, SqliteJobRunRepository, SqliteJobStepRepository,
};
pub use memory::{
    InMemoryJobRepository, InMemoryJobRunRepository, InMemoryJobStepRepository, InMemoryLockStore,
};
pub use redis_lock::RedisLockStore;
