//! Shared domain types for Tideway.
//!
//! This crate contains the types used across the Tideway workflow engine:
//! workflow documents, execution status, claim-check references, engine
//! configuration, and their associated error types.
//!
//! Zero infrastructure dependencies -- only serde, semver, chrono, thiserror.

pub mod claimcheck;
pub mod config;
pub mod error;
pub mod execution;
pub mod workflow;
