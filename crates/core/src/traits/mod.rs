pub mod lock_store;
pub mod repository;

pub use lock_store::*;
pub use repository::*;
