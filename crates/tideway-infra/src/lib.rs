//! Infrastructure layer for Tideway.
//!
//! Implements the ports defined in `tideway-core`: the SQLite resource
//! store, the opendal claim-check blob store and the network call
//! activities. Also loads engine configuration from disk and environment.

pub mod activity;
pub mod blob;
pub mod config;
pub mod sqlite;
