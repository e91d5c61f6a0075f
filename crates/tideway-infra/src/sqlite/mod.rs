//! SQLite storage layer.
//!
//! Resource storage backed by SQLite with WAL mode and split read/write
//! connection pools.

pub mod pool;
pub mod resource;

pub use pool::DatabasePool;
pub use resource::SqliteResourceStore;
