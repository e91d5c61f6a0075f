//! Activities: retryable units of work dispatched through the substrate.
//!
//! Follows the blanket-impl pattern used for other pluggable seams:
//! 1. `Activity` uses RPITIT for ergonomic implementations
//! 2. `ActivityDyn` is the object-safe variant with boxed futures
//! 3. `BoxActivity` wraps `Arc<dyn ActivityDyn>` and delegates

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::workflow::options::ActivityOptions;

use super::run::RunMetadata;

// ---------------------------------------------------------------------------
// Well-known activity names and error types
// ---------------------------------------------------------------------------

pub const ACTIVITY_CALL_HTTP: &str = "CallHTTP";
pub const ACTIVITY_CALL_GRPC: &str = "CallGRPC";
pub const ACTIVITY_UPDATE_STATUS: &str = "UpdateWorkflowExecutionStatus";
pub const ACTIVITY_CLAIM_CHECK_OFFLOAD: &str = "ClaimCheckOffload";
pub const ACTIVITY_CLAIM_CHECK_RETRIEVE: &str = "ClaimCheckRetrieve";
pub const ACTIVITY_VALIDATE_WORKFLOW: &str = "ValidateWorkflow";

pub mod error_type {
    pub const TIMEOUT: &str = "Timeout";
    pub const CANCELLED: &str = "Cancelled";
    pub const NOT_REGISTERED: &str = "ActivityNotRegistered";
    pub const COMMUNICATION: &str = "Communication";
    pub const VALIDATION: &str = "Validation";
    pub const RUNTIME: &str = "Runtime";
    pub const CONFIGURATION: &str = "Configuration";
}

// ---------------------------------------------------------------------------
// ActivityError
// ---------------------------------------------------------------------------

/// Failure reported by an activity attempt.
///
/// `error_type` drives retry decisions (`nonRetryableErrorTypes`) and catch
/// filtering; `non_retryable` short-circuits retries regardless of policy.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
#[error("{error_type}: {message}")]
pub struct ActivityError {
    pub error_type: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default)]
    pub non_retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ActivityError {
    pub fn retryable(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            status: None,
            non_retryable: false,
            details: None,
        }
    }

    pub fn non_retryable(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            non_retryable: true,
            ..Self::retryable(error_type, message)
        }
    }

    pub fn timeout(what: impl std::fmt::Display) -> Self {
        Self::retryable(error_type::TIMEOUT, format!("{what} timeout exceeded"))
    }

    pub fn cancelled() -> Self {
        Self::non_retryable(error_type::CANCELLED, "activity cancelled")
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.error_type == error_type::CANCELLED
    }
}

// ---------------------------------------------------------------------------
// Request / info / context
// ---------------------------------------------------------------------------

/// What the workflow asks the substrate to run.
#[derive(Debug, Clone)]
pub struct ActivityRequest {
    pub activity_type: String,
    /// Task that issued the request; used to derive the activity id.
    pub task_name: String,
    pub input: Value,
    pub options: ActivityOptions,
}

impl ActivityRequest {
    pub fn new(
        activity_type: impl Into<String>,
        task_name: impl Into<String>,
        input: Value,
        options: ActivityOptions,
    ) -> Self {
        Self {
            activity_type: activity_type.into(),
            task_name: task_name.into(),
            input,
            options,
        }
    }
}

/// Metadata describing a single attempt.
#[derive(Debug, Clone)]
pub struct ActivityInfo {
    /// `task-<task name>-<unix millis>`.
    pub activity_id: String,
    pub activity_type: String,
    pub task_queue: String,
    /// 1-based.
    pub attempt: u32,
    pub scheduled_at: DateTime<Utc>,
    pub start_to_close: Duration,
    /// Ambient metadata of the calling run.
    pub run: RunMetadata,
}

/// Build the activity id for a task dispatch.
pub fn activity_id(task_name: &str, at: DateTime<Utc>) -> String {
    format!("task-{task_name}-{}", at.timestamp_millis())
}

/// Recover the task name from an activity id produced by [`activity_id`].
pub fn task_name_from_activity_id(activity_id: &str) -> Option<&str> {
    let rest = activity_id.strip_prefix("task-")?;
    let (name, ts) = rest.rsplit_once('-')?;
    if name.is_empty() || ts.is_empty() || !ts.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(name)
}

/// Passed to each activity execution.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    pub info: ActivityInfo,
    /// Cancelled when the owning run is cancelled.
    pub cancel: CancellationToken,
}

// ---------------------------------------------------------------------------
// Activity traits
// ---------------------------------------------------------------------------

/// A unit of work the substrate can run with retries and timeouts.
pub trait Activity: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn execute(
        &self,
        ctx: ActivityContext,
        input: Value,
    ) -> impl Future<Output = Result<Value, ActivityError>> + Send;
}

/// Object-safe version of [`Activity`] with boxed futures.
pub trait ActivityDyn: Send + Sync {
    fn name(&self) -> &str;

    fn execute_boxed(
        &self,
        ctx: ActivityContext,
        input: Value,
    ) -> Pin<Box<dyn Future<Output = Result<Value, ActivityError>> + Send + '_>>;
}

impl<T: Activity> ActivityDyn for T {
    fn name(&self) -> &str {
        Activity::name(self)
    }

    fn execute_boxed(
        &self,
        ctx: ActivityContext,
        input: Value,
    ) -> Pin<Box<dyn Future<Output = Result<Value, ActivityError>> + Send + '_>> {
        Box::pin(self.execute(ctx, input))
    }
}

/// Type-erased, cheaply clonable activity handle.
#[derive(Clone)]
pub struct BoxActivity {
    inner: Arc<dyn ActivityDyn>,
}

impl BoxActivity {
    pub fn new<T: Activity>(activity: T) -> Self {
        Self {
            inner: Arc::new(activity),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub async fn execute(&self, ctx: ActivityContext, input: Value) -> Result<Value, ActivityError> {
        self.inner.execute_boxed(ctx, input).await
    }
}

impl std::fmt::Debug for BoxActivity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxActivity").field("name", &self.name()).finish()
    }
}

/// Adapts an async closure into an [`Activity`]. Handy for function
/// activities referenced by `call: <name>`.
pub struct FnActivity<F> {
    name: String,
    f: F,
}

impl<F> FnActivity<F> {
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F, Fut> Activity for FnActivity<F>
where
    F: Fn(ActivityContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ActivityError>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(
        &self,
        ctx: ActivityContext,
        input: Value,
    ) -> impl Future<Output = Result<Value, ActivityError>> + Send {
        (self.f)(ctx, input)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RegisteredActivity {
    /// Lane this activity is served on unless the request overrides it.
    pub task_queue: String,
    pub activity: BoxActivity,
}

/// Activities by name, each bound to a task queue lane.
#[derive(Debug, Clone, Default)]
pub struct ActivityRegistry {
    entries: HashMap<String, RegisteredActivity>,
}

impl ActivityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an activity on a lane. A later registration under the same
    /// name replaces the earlier one.
    pub fn register<T: Activity>(&mut self, task_queue: impl Into<String>, activity: T) {
        let activity = BoxActivity::new(activity);
        let name = activity.name().to_string();
        if self.entries.contains_key(&name) {
            tracing::warn!(activity = %name, "replacing previously registered activity");
        }
        self.entries.insert(
            name,
            RegisteredActivity {
                task_queue: task_queue.into(),
                activity,
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredActivity> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Registered activity names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_activity_id_roundtrip() {
        let at = Utc::now();
        let id = activity_id("fetch-users", at);
        assert!(id.starts_with("task-fetch-users-"));
        assert_eq!(task_name_from_activity_id(&id), Some("fetch-users"));
    }

    #[test]
    fn test_foreign_activity_ids_yield_none() {
        assert_eq!(task_name_from_activity_id("claimcheck-1"), None);
        assert_eq!(task_name_from_activity_id("task-noseparator"), None);
        assert_eq!(task_name_from_activity_id("task-name-abc"), None);
    }

    #[test]
    fn test_error_constructors() {
        let err = ActivityError::non_retryable(error_type::VALIDATION, "bad").with_status(422);
        assert!(err.non_retryable);
        assert_eq!(err.status, Some(422));
        assert_eq!(err.to_string(), "Validation: bad");
        assert!(ActivityError::cancelled().is_cancelled());
    }

    #[tokio::test]
    async fn test_registry_dispatches_fn_activity() {
        let mut registry = ActivityRegistry::new();
        registry.register(
            "lane",
            FnActivity::new("double", |_ctx, input: Value| async move {
                let n = input.as_i64().unwrap_or(0);
                Ok(json!(n * 2))
            }),
        );

        let entry = registry.get("double").unwrap();
        assert_eq!(entry.task_queue, "lane");
        let ctx = ActivityContext {
            info: ActivityInfo {
                activity_id: activity_id("t", Utc::now()),
                activity_type: "double".to_string(),
                task_queue: "lane".to_string(),
                attempt: 1,
                scheduled_at: Utc::now(),
                start_to_close: Duration::from_secs(1),
                run: RunMetadata::new("w", "ExecuteWorkflow", "lane"),
            },
            cancel: CancellationToken::new(),
        };
        let out = entry.activity.execute(ctx, json!(21)).await.unwrap();
        assert_eq!(out, json!(42));
        assert_eq!(registry.names(), vec!["double"]);
    }
}
