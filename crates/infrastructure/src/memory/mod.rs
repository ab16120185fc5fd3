//! 内存实现的仓储和锁存储

mod lock_store;
mod repositories;

pub use lock_store::InMemoryLockStore;
pub use repositories::{InMemoryJobRepository, InMemoryJobRunRepository, InMemoryJobStepRepository};
