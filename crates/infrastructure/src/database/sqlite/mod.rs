pub mod sqlite_job_repository;
pub mod sqlite_job_run_repository;
pub mod sqlite_job_step_repository;

pub use sqlite_job_repository::SqliteJobRepository;
pub use sqlite_job_run_repository::SqliteJobRunRepository;
pub use sqlite_job_step_repository::SqliteJobStepRepository;
