//! Status merge and persistence.
//!
//! `StatusMerger` is the only writer of execution status. Callers send
//! partial updates; absent or empty fields leave the stored value alone.

use std::sync::Arc;

use chrono::Utc;
use futures_util::future::BoxFuture;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use tideway_types::error::RepositoryError;
use tideway_types::execution::{ExecutionPhase, StatusAudit, WorkflowExecution, WorkflowExecutionStatus};

use crate::repository::ExecutionRepository;
use crate::substrate::activity::{ACTIVITY_UPDATE_STATUS, Activity, ActivityContext, ActivityError, error_type};

use super::stream::StreamBroker;

/// Audit event recorded on every merge.
pub const AUDIT_EVENT_UPDATED: &str = "updated";

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("invalid execution id '{0}'")]
    InvalidId(String),

    #[error("execution {0} not found")]
    NotFound(Uuid),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Apply a partial update onto the current status.
pub fn merge_status(current: &mut WorkflowExecutionStatus, partial: WorkflowExecutionStatus) {
    if !partial.tasks.is_empty() {
        current.tasks = partial.tasks;
    }
    if partial.phase != ExecutionPhase::Unspecified {
        current.phase = partial.phase;
    }
    if let Some(error) = partial.error.filter(|e| !e.is_empty()) {
        current.error = Some(error);
    }
    if partial.started_at.is_some() {
        current.started_at = partial.started_at;
    }
    if partial.completed_at.is_some() {
        current.completed_at = partial.completed_at;
    }
    if partial.output.is_some() {
        current.output = partial.output;
    }
}

/// Anything that can accept status updates for an execution.
pub trait StatusReporter: Send + Sync {
    fn update_status<'a>(
        &'a self,
        execution_id: &'a str,
        status: WorkflowExecutionStatus,
    ) -> BoxFuture<'a, Result<WorkflowExecution, StatusError>>;
}

#[derive(Debug, Clone)]
pub struct StatusMerger {
    executions: ExecutionRepository,
    broker: Arc<StreamBroker>,
    /// Serializes load-merge-put so concurrent fork branches never lose
    /// each other's task entries.
    write: Arc<Mutex<()>>,
}

impl StatusMerger {
    pub fn new(executions: ExecutionRepository, broker: Arc<StreamBroker>) -> Self {
        Self {
            executions,
            broker,
            write: Arc::new(Mutex::new(())),
        }
    }

    pub fn broker(&self) -> &Arc<StreamBroker> {
        &self.broker
    }

    /// Load once, merge, stamp the audit, persist once, then broadcast.
    pub async fn update_execution_status(
        &self,
        execution_id: &Uuid,
        partial: WorkflowExecutionStatus,
    ) -> Result<WorkflowExecution, StatusError> {
        let _guard = self.write.lock().await;
        let mut execution = self
            .executions
            .get(execution_id)
            .await?
            .ok_or(StatusError::NotFound(*execution_id))?;

        merge_status(&mut execution.status, partial);
        execution.status.audit = StatusAudit {
            updated_at: Some(Utc::now()),
            event: Some(AUDIT_EVENT_UPDATED.to_string()),
        };

        self.executions.put(&execution).await?;
        tracing::debug!(
            execution_id = %execution_id,
            phase = %execution.status.phase,
            tasks = execution.status.tasks.len(),
            "execution status updated"
        );
        self.broker.broadcast(&execution);
        Ok(execution)
    }
}

impl StatusReporter for StatusMerger {
    fn update_status<'a>(
        &'a self,
        execution_id: &'a str,
        status: WorkflowExecutionStatus,
    ) -> BoxFuture<'a, Result<WorkflowExecution, StatusError>> {
        Box::pin(async move {
            let id = Uuid::parse_str(execution_id).map_err(|_| StatusError::InvalidId(execution_id.to_string()))?;
            self.update_execution_status(&id, status).await
        })
    }
}

// ---------------------------------------------------------------------------
// Activity
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct UpdateStatusInput {
    execution_id: String,
    status: WorkflowExecutionStatus,
}

/// `UpdateWorkflowExecutionStatus`: lets workflow logic report status
/// through the substrate, with retries.
pub struct UpdateStatusActivity {
    reporter: Arc<dyn StatusReporter>,
}

impl UpdateStatusActivity {
    pub fn new(reporter: Arc<dyn StatusReporter>) -> Self {
        Self { reporter }
    }

    /// Build the activity input.
    pub fn input(execution_id: &str, status: &WorkflowExecutionStatus) -> Value {
        serde_json::json!({ "execution_id": execution_id, "status": status })
    }
}

impl Activity for UpdateStatusActivity {
    fn name(&self) -> &str {
        ACTIVITY_UPDATE_STATUS
    }

    async fn execute(&self, _ctx: ActivityContext, input: Value) -> Result<Value, ActivityError> {
        let req: UpdateStatusInput = serde_json::from_value(input)
            .map_err(|e| ActivityError::non_retryable(error_type::VALIDATION, e.to_string()))?;
        match self.reporter.update_status(&req.execution_id, req.status).await {
            Ok(execution) => Ok(serde_json::to_value(&execution.status).unwrap_or(Value::Null)),
            Err(e @ (StatusError::InvalidId(_) | StatusError::NotFound(_))) => {
                Err(ActivityError::non_retryable(error_type::VALIDATION, e.to_string()))
            }
            Err(e) => Err(ActivityError::retryable(error_type::RUNTIME, e.to_string())),
        }
    }
}
