//! Storage ports.
//!
//! The infrastructure layer (tideway-infra) implements these traits with
//! SQLite. The core crate ships an in-memory implementation for tests and
//! ephemeral CLI runs.

pub mod execution;
pub mod resource;

pub use execution::ExecutionRepository;
pub use resource::{BoxResourceStore, MemoryResourceStore, ResourceKind, ResourceStore};
