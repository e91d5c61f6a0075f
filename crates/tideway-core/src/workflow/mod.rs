//! Serverless Workflow interpreter.
//!
//! - `loader` parses documents and enforces the supported DSL range
//! - `tasks` compiles a document into executable units and runs them
//! - `state` holds the per-run data, context and output
//! - `expression` evaluates `${ ... }` expressions
//! - `options` and `retry` shape activity scheduling
//! - `runner` drives whole executions across continue-as-new
//! - `validation` checks documents without running them

pub mod expression;
pub mod loader;
pub mod options;
pub mod retry;
pub mod runner;
pub mod state;
pub mod tasks;
pub mod validation;

pub use runner::{RunInput, RunOutcome, RunnerConfig, WorkflowRunner};
