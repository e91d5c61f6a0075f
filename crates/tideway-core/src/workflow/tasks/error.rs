//! Build-time and run-time task errors.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::substrate::SubstrateError;
use crate::substrate::activity::{ActivityError, error_type};
use crate::workflow::options::OptionsError;
use crate::workflow::state::StateSnapshot;

/// Base URI for the standard error types.
pub const ERROR_TYPE_BASE: &str = "https://serverlessworkflow.io/spec/1.0.0/errors/";

/// Expand a short error type (`timeout`) to its URI. Values that already
/// look like URIs are returned unchanged.
pub fn error_type_uri(short_or_uri: &str) -> String {
    if short_or_uri.contains("://") {
        short_or_uri.to_string()
    } else {
        format!("{ERROR_TYPE_BASE}{}", short_or_uri.to_ascii_lowercase())
    }
}

/// Default status for a standard error type.
pub fn default_status(type_uri: &str) -> u16 {
    match type_uri.strip_prefix(ERROR_TYPE_BASE).unwrap_or(type_uri) {
        "validation" | "configuration" | "expression" => 400,
        "authentication" => 401,
        "authorization" => 403,
        "timeout" => 408,
        _ => 500,
    }
}

/// A structured workflow error, as raised by `raise` or derived from a
/// failed task. This is what `catch` sees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowError {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

impl WorkflowError {
    pub fn new(type_: &str, status: Option<u16>) -> Self {
        let type_ = error_type_uri(type_);
        let status = status.unwrap_or_else(|| default_status(&type_));
        Self {
            type_,
            status,
            title: None,
            detail: None,
            instance: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    /// True if `filter` (short name or URI) names this error's type.
    pub fn is_type(&self, filter: &str) -> bool {
        self.type_ == error_type_uri(filter)
    }
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let short = self.type_.strip_prefix(ERROR_TYPE_BASE).unwrap_or(&self.type_);
        write!(f, "{short} ({})", self.status)?;
        if let Some(title) = &self.title {
            write!(f, ": {title}")?;
        }
        if let Some(detail) = &self.detail {
            write!(f, " - {detail}")?;
        }
        Ok(())
    }
}

/// Errors raised while a workflow runs.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("raised {0}")]
    Raised(WorkflowError),

    #[error("task '{task}' failed: {source}")]
    Activity { task: String, source: ActivityError },

    #[error("task '{task}': {message}")]
    Expression { task: String, message: String },

    #[error("task '{task}': {source}")]
    Substrate { task: String, source: SubstrateError },

    #[error("execution cancelled")]
    Cancelled,

    /// Not a failure: the run must restart from the snapshot.
    #[error("continuing as new from '{}'", .0.resume_from)]
    ContinueAsNew(Box<StateSnapshot>),

    #[error("task '{task}': {message}")]
    Runtime { task: String, message: String },
}

impl TaskError {
    pub fn expression(task: &str, err: impl std::fmt::Display) -> Self {
        TaskError::Expression {
            task: task.to_string(),
            message: err.to_string(),
        }
    }

    pub fn runtime(task: &str, message: impl Into<String>) -> Self {
        TaskError::Runtime {
            task: task.to_string(),
            message: message.into(),
        }
    }

    /// Map a substrate failure, folding cancellation into [`TaskError::Cancelled`].
    pub fn substrate(task: &str, err: SubstrateError) -> Self {
        match err {
            SubstrateError::Cancelled => TaskError::Cancelled,
            source => TaskError::Substrate {
                task: task.to_string(),
                source,
            },
        }
    }

    pub fn activity(task: &str, err: ActivityError) -> Self {
        if err.is_cancelled() {
            return TaskError::Cancelled;
        }
        TaskError::Activity {
            task: task.to_string(),
            source: err,
        }
    }

    /// Whether `try`/`catch` may intercept this error.
    pub fn is_catchable(&self) -> bool {
        !matches!(self, TaskError::Cancelled | TaskError::ContinueAsNew(_))
    }

    /// Short tag used in logs and operator alerts.
    pub fn error_type(&self) -> &str {
        match self {
            TaskError::Raised(e) => e.type_.strip_prefix(ERROR_TYPE_BASE).unwrap_or(&e.type_),
            TaskError::Activity { source, .. } => &source.error_type,
            TaskError::Expression { .. } => "expression",
            TaskError::Substrate { .. } => "runtime",
            TaskError::Cancelled => "cancelled",
            TaskError::ContinueAsNew(_) => "continue_as_new",
            TaskError::Runtime { .. } => "runtime",
        }
    }

    /// Structured form exposed to `catch` blocks.
    pub fn to_workflow_error(&self, instance: Option<&str>) -> WorkflowError {
        let err = match self {
            TaskError::Raised(e) => return e.clone(),
            TaskError::Activity { task, source } => {
                let kind = match source.error_type.as_str() {
                    error_type::TIMEOUT => "timeout",
                    error_type::COMMUNICATION => "communication",
                    error_type::VALIDATION => "validation",
                    error_type::CONFIGURATION => "configuration",
                    other if other.contains("://") => other,
                    _ => "runtime",
                };
                WorkflowError::new(kind, source.status)
                    .with_title(format!("task '{task}' failed"))
                    .with_detail(source.message.clone())
            }
            TaskError::Expression { task, message } => WorkflowError::new("expression", None)
                .with_title(format!("task '{task}': invalid expression"))
                .with_detail(message.clone()),
            other => WorkflowError::new("runtime", None).with_detail(other.to_string()),
        };
        match instance {
            Some(id) => err.with_instance(id),
            None => err,
        }
    }

    pub fn to_value(&self, instance: Option<&str>) -> Value {
        serde_json::to_value(self.to_workflow_error(instance)).unwrap_or(Value::Null)
    }
}

/// Errors detected while compiling a workflow into executable units.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("task '{task}' has no recognised kind (keys: {keys:?})")]
    UnknownTaskKind { task: String, keys: Vec<String> },

    #[error("no compiler registered for {kind} task '{task}'")]
    UnsupportedKind { task: String, kind: String },

    #[error("task '{task}' jumps to unknown task '{target}'")]
    UnknownGotoTarget { task: String, target: String },

    #[error("switch '{task}' declares more than one default case")]
    MultipleDefaults { task: String },

    #[error("duplicate task name '{task}' in the same sequence")]
    DuplicateTaskName { task: String },

    #[error("task '{task}' is invalid: {reason}")]
    InvalidTask { task: String, reason: String },

    #[error(transparent)]
    Options(#[from] OptionsError),
}
