//! Ambient run metadata.
//!
//! Every workflow run carries a `RunMetadata` that the substrate attaches to
//! each activity invocation. The execution id travels here as a typed search
//! attribute, so activities and interceptors can recover it without it
//! appearing in any activity signature.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Workflow type for user workflow executions.
pub const WORKFLOW_TYPE_EXECUTE: &str = "ExecuteWorkflow";
/// Workflow type for validation-only runs.
pub const WORKFLOW_TYPE_VALIDATE: &str = "ValidateWorkflow";

const DETACHED_SUFFIX: &str = "/detached";

/// Indexed run attributes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchAttributes {
    /// The execution record this run reports progress against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    /// Attributes declared in document metadata `searchAttributes`.
    #[serde(default, flatten)]
    pub custom: Map<String, Value>,
}

impl SearchAttributes {
    pub fn for_execution(execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: Some(execution_id.into()),
            custom: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Stable across continue-as-new.
    pub workflow_id: String,
    /// Fresh for every run, including continued ones.
    pub run_id: Uuid,
    pub workflow_type: String,
    pub task_queue: String,
    #[serde(default)]
    pub search_attributes: SearchAttributes,
}

impl RunMetadata {
    pub fn new(
        workflow_id: impl Into<String>,
        workflow_type: impl Into<String>,
        task_queue: impl Into<String>,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            run_id: Uuid::now_v7(),
            workflow_type: workflow_type.into(),
            task_queue: task_queue.into(),
            search_attributes: SearchAttributes::default(),
        }
    }

    pub fn with_search_attributes(mut self, attrs: SearchAttributes) -> Self {
        self.search_attributes = attrs;
        self
    }

    /// Same workflow, new run id. Used when continuing as new.
    pub fn continued(&self) -> Self {
        Self {
            run_id: Uuid::now_v7(),
            ..self.clone()
        }
    }

    /// A sibling run that ignores this run's cancellation. Used to report
    /// the final status of a cancelled run.
    pub fn detached(&self) -> Self {
        Self {
            workflow_id: format!("{}{DETACHED_SUFFIX}", self.workflow_id),
            run_id: Uuid::now_v7(),
            ..self.clone()
        }
    }

    pub fn execution_id(&self) -> Option<&str> {
        self.search_attributes.execution_id.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_continued_keeps_workflow_id() {
        let run = RunMetadata::new("exec-1", WORKFLOW_TYPE_EXECUTE, "q")
            .with_search_attributes(SearchAttributes::for_execution("exec-1"));
        let next = run.continued();
        assert_eq!(next.workflow_id, run.workflow_id);
        assert_ne!(next.run_id, run.run_id);
        assert_eq!(next.execution_id(), Some("exec-1"));
    }

    #[test]
    fn test_detached_run_is_a_separate_workflow() {
        let run = RunMetadata::new("exec-1", WORKFLOW_TYPE_EXECUTE, "q")
            .with_search_attributes(SearchAttributes::for_execution("exec-1"));
        let detached = run.detached();
        assert_ne!(detached.workflow_id, run.workflow_id);
        assert_eq!(detached.execution_id(), Some("exec-1"));
    }

    #[test]
    fn test_custom_attributes_flatten() {
        let mut attrs = SearchAttributes::for_execution("e");
        attrs.custom.insert("Team".to_string(), json!("payments"));
        let v = serde_json::to_value(&attrs).unwrap();
        assert_eq!(v, json!({"execution_id": "e", "Team": "payments"}));
    }
}
