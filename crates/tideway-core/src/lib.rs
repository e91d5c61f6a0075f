//! Workflow interpreter, substrate contract and engine services for Tideway.
//!
//! This crate defines the ports the infrastructure layer implements
//! (resource storage, blob storage, activities). It depends only on
//! `tideway-types`, never on `tideway-infra` or any database or network
//! client.

pub mod claimcheck;
pub mod execution;
pub mod repository;
pub mod substrate;
pub mod workflow;
