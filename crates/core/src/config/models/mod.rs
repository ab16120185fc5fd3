pub mod app_config;
pub mod cache;
pub mod database;
pub mod observability;
pub mod scheduler;

pub use app_config::AppConfig;
pub use cache::CacheConfig;
pub use database::{DatabaseConfig, MEMORY_DATABASE_URL};
pub use observability::ObservabilityConfig;
pub use scheduler::SchedulerConfig;
