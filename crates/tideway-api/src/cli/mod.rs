//! CLI command definitions and dispatch for the `tide` binary.
//!
//! Uses clap derive macros for argument parsing.

pub mod purge;
pub mod run;
pub mod status;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;

use tideway_core::repository::ResourceKind;

/// Run Serverless Workflow documents on a durable substrate.
#[derive(Parser)]
#[command(name = "tide", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Also export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Default log filter for the chosen verbosity. `RUST_LOG` wins.
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 if self.quiet => "error",
            0 => "warn",
            1 => "info,tideway=debug",
            _ => "trace",
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a workflow document and wait for it to finish.
    Run {
        /// Path to the workflow document (YAML or JSON).
        file: PathBuf,

        /// Workflow input as inline JSON.
        #[arg(long, conflicts_with = "input_file")]
        input: Option<String>,

        /// Read workflow input from a JSON file.
        #[arg(long)]
        input_file: Option<PathBuf>,

        /// Organization the execution belongs to.
        #[arg(long)]
        org: Option<String>,
    },

    /// Validate a workflow document without running it.
    Validate {
        /// Path to the workflow document (YAML or JSON).
        file: PathBuf,

        /// Print the canonical YAML rendering on success.
        #[arg(long)]
        canonical: bool,
    },

    /// Show stored executions, or one execution in detail.
    #[command(alias = "ls")]
    Status {
        /// Execution id (omit to list).
        id: Option<String>,

        /// Maximum number of executions to list.
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Start the REST API server.
    Serve {
        /// Port to listen on.
        #[arg(short, long, default_value = "3000")]
        port: u16,

        /// Host to bind to.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },

    /// Delete stored resources or expired claim-check payloads.
    Purge {
        /// Resource kind to delete.
        #[arg(long, value_enum, conflicts_with = "all")]
        kind: Option<PurgeKind>,

        /// Delete every stored resource.
        #[arg(long)]
        all: bool,

        /// Sweep claim-check payloads older than the configured TTL.
        #[arg(long)]
        blobs: bool,

        /// Skip confirmation prompt.
        #[arg(long)]
        force: bool,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PurgeKind {
    Workflow,
    Execution,
}

impl From<PurgeKind> for ResourceKind {
    fn from(kind: PurgeKind) -> Self {
        match kind {
            PurgeKind::Workflow => ResourceKind::Workflow,
            PurgeKind::Execution => ResourceKind::WorkflowExecution,
        }
    }
}
