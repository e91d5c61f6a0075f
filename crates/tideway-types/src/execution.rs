//! Execution status types for Tideway.
//!
//! A `WorkflowExecution` is the persisted record for a single run: the
//! spec that launched it (immutable after creation) and the status that
//! the engine writes as the run progresses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// Lifecycle phase shared by individual tasks and whole executions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionPhase {
    /// Sentinel meaning "no change" in a partial status update.
    #[default]
    Unspecified,
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionPhase::Completed | ExecutionPhase::Failed | ExecutionPhase::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionPhase::Unspecified => "UNSPECIFIED",
            ExecutionPhase::Pending => "PENDING",
            ExecutionPhase::InProgress => "IN_PROGRESS",
            ExecutionPhase::Completed => "COMPLETED",
            ExecutionPhase::Failed => "FAILED",
            ExecutionPhase::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Progress of a single task (one activity invocation).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTask {
    pub task_id: String,
    pub task_name: String,
    pub status: ExecutionPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Audit stamp written on every status persistence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusAudit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
}

/// Aggregate execution status. Also used as a partial update, where empty
/// or absent fields mean "leave unchanged".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecutionStatus {
    #[serde(default)]
    pub phase: ExecutionPhase,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<WorkflowTask>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default)]
    pub audit: StatusAudit,
}

impl WorkflowExecutionStatus {
    /// A partial update that only carries a phase change.
    pub fn phase(phase: ExecutionPhase) -> Self {
        Self {
            phase,
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Execution record
// ---------------------------------------------------------------------------

/// What was asked for. Never mutated by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSpec {
    /// Raw workflow document (YAML or JSON).
    pub workflow: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
}

/// Persisted execution record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub spec: ExecutionSpec,
    #[serde(default)]
    pub status: WorkflowExecutionStatus,
    pub created_at: DateTime<Utc>,
}

impl WorkflowExecution {
    pub fn new(spec: ExecutionSpec) -> Self {
        Self {
            id: Uuid::now_v7(),
            spec,
            status: WorkflowExecutionStatus::phase(ExecutionPhase::Pending),
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Three-state validation outcome.
///
/// `Invalid` is user-actionable (the document is wrong); `Failed` means the
/// validator itself broke and an operator should look.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationState {
    Valid,
    Invalid,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub state: ValidationState,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Canonical YAML rendering of the document, when it could be parsed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical_document: Option<String>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.state == ValidationState::Valid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_serializes_screaming_snake() {
        let json = serde_json::to_string(&ExecutionPhase::InProgress).unwrap();
        assert_eq!(json, "\"IN_PROGRESS\"");
        let back: ExecutionPhase = serde_json::from_str("\"COMPLETED\"").unwrap();
        assert_eq!(back, ExecutionPhase::Completed);
    }

    #[test]
    fn missing_phase_defaults_to_unspecified() {
        let status: WorkflowExecutionStatus = serde_json::from_str("{}").unwrap();
        assert_eq!(status.phase, ExecutionPhase::Unspecified);
        assert!(status.tasks.is_empty());
    }

    #[test]
    fn terminal_phases() {
        assert!(ExecutionPhase::Failed.is_terminal());
        assert!(ExecutionPhase::Cancelled.is_terminal());
        assert!(!ExecutionPhase::InProgress.is_terminal());
        assert!(!ExecutionPhase::Unspecified.is_terminal());
    }

    #[test]
    fn new_execution_is_pending() {
        let exec = WorkflowExecution::new(ExecutionSpec {
            workflow: "document: {}".to_string(),
            input: Value::Null,
            org_id: None,
        });
        assert_eq!(exec.status.phase, ExecutionPhase::Pending);
    }

    #[test]
    fn validation_state_serializes() {
        let json = serde_json::to_string(&ValidationState::Invalid).unwrap();
        assert_eq!(json, "\"INVALID\"");
    }
}
