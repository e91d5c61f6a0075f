//! Activity option resolution.
//!
//! Options are layered, each level overriding only the fields it sets:
//! engine defaults, then the document `timeout.after`, then document
//! metadata `activityOptions`, then the task `timeout.after`, then task
//! metadata `activityOptions`.

use std::time::Duration;

use serde_json::{Map, Value};
use thiserror::Error;

use tideway_types::workflow::{
    ActivityOptionsSpec, DurationSpec, METADATA_ACTIVITY_OPTIONS, PrioritySpec, WorkflowDefinition,
};

use super::retry::RetryPolicy;

/// Default start-to-close timeout when the document sets none.
pub const DEFAULT_START_TO_CLOSE: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Error)]
pub enum OptionsError {
    #[error("invalid {scope} activityOptions: {reason}")]
    Invalid { scope: String, reason: String },
}

/// Fully resolved options for one activity dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityOptions {
    pub schedule_to_close: Option<Duration>,
    pub schedule_to_start: Option<Duration>,
    pub start_to_close: Duration,
    pub retry: RetryPolicy,
    pub priority: Option<u32>,
    /// Overrides the lane the activity was registered on.
    pub task_queue: Option<String>,
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self {
            schedule_to_close: None,
            schedule_to_start: None,
            start_to_close: DEFAULT_START_TO_CLOSE,
            retry: RetryPolicy::default(),
            priority: None,
            task_queue: None,
        }
    }
}

impl ActivityOptions {
    /// Options for a task, layering the task timeout and task metadata over
    /// the document options.
    pub fn resolve(
        def: &WorkflowDefinition,
        task_name: &str,
        task_timeout: Option<&DurationSpec>,
        task_metadata: &Map<String, Value>,
    ) -> Result<Self, OptionsError> {
        let mut opts = Self::for_document(def)?;
        if let Some(after) = task_timeout {
            opts.start_to_close = to_duration(after, &format!("task '{task_name}' timeout"))?;
        }
        if let Some(raw) = task_metadata.get(METADATA_ACTIVITY_OPTIONS) {
            let spec = decode(raw, &format!("task '{task_name}'"))?;
            opts.apply(&spec, &format!("task '{task_name}'"))?;
        }
        Ok(opts)
    }

    /// Document-level options (no task overrides).
    pub fn for_document(def: &WorkflowDefinition) -> Result<Self, OptionsError> {
        let mut opts = Self::default();
        if let Some(timeout) = &def.timeout {
            opts.start_to_close = to_duration(&timeout.after, "document timeout")?;
        }
        if let Some(raw) = def.metadata(METADATA_ACTIVITY_OPTIONS) {
            let spec = decode(raw, "document")?;
            opts.apply(&spec, "document")?;
        }
        Ok(opts)
    }

    fn apply(&mut self, spec: &ActivityOptionsSpec, scope: &str) -> Result<(), OptionsError> {
        if let Some(d) = &spec.schedule_to_close_timeout {
            self.schedule_to_close = Some(to_duration(d, scope)?);
        }
        if let Some(d) = &spec.schedule_to_start_timeout {
            self.schedule_to_start = Some(to_duration(d, scope)?);
        }
        if let Some(d) = &spec.start_to_close_timeout {
            self.start_to_close = to_duration(d, scope)?;
        }
        if let Some(retry) = &spec.retry_policy {
            if let Some(d) = &retry.initial_interval {
                self.retry.initial_interval = to_duration(d, scope)?;
            }
            if let Some(c) = retry.backoff_coefficient {
                self.retry.backoff_coefficient = c;
            }
            if let Some(d) = &retry.maximum_interval {
                self.retry.maximum_interval = to_duration(d, scope)?;
            }
            if let Some(n) = retry.maximum_attempts {
                self.retry.maximum_attempts = n;
            }
            if !retry.non_retryable_error_types.is_empty() {
                self.retry.non_retryable_error_types = retry.non_retryable_error_types.clone();
            }
        }
        if let Some(PrioritySpec {
            priority_key: Some(key),
            ..
        }) = &spec.priority
        {
            self.priority = Some(*key);
        }
        if let Some(queue) = &spec.task_queue {
            self.task_queue = Some(queue.clone());
        }
        Ok(())
    }
}

fn decode(raw: &Value, scope: &str) -> Result<ActivityOptionsSpec, OptionsError> {
    serde_json::from_value(raw.clone()).map_err(|e| OptionsError::Invalid {
        scope: scope.to_string(),
        reason: e.to_string(),
    })
}

fn to_duration(spec: &DurationSpec, scope: &str) -> Result<Duration, OptionsError> {
    spec.to_duration().map_err(|e| OptionsError::Invalid {
        scope: scope.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::loader::load_definition;
    use serde_json::json;

    fn definition(extra: &str) -> WorkflowDefinition {
        let yaml = format!(
            r#"
document:
  dsl: "1.0.0"
  namespace: t
  name: opts
  version: "1"
{extra}
do:
  - a:
      set: {{ x: 1 }}
"#
        );
        load_definition(yaml.as_bytes()).unwrap()
    }

    #[test]
    fn test_defaults_without_overrides() {
        let opts = ActivityOptions::for_document(&definition("")).unwrap();
        assert_eq!(opts, ActivityOptions::default());
    }

    #[test]
    fn test_document_timeout_sets_start_to_close() {
        let def = definition("timeout:\n  after: PT30S");
        let opts = ActivityOptions::for_document(&def).unwrap();
        assert_eq!(opts.start_to_close, Duration::from_secs(30));
    }

    #[test]
    fn test_precedence_task_over_document_over_timeout() {
        let def = definition(
            r#"  metadata:
    activityOptions:
      startToCloseTimeout: PT20S
      retryPolicy:
        maximumAttempts: 7
        initialInterval: { milliseconds: 250 }
timeout:
  after: PT30S"#,
        );
        let mut task_meta = Map::new();
        task_meta.insert(
            METADATA_ACTIVITY_OPTIONS.to_string(),
            json!({
                "startToCloseTimeout": "PT5S",
                "retryPolicy": { "nonRetryableErrorTypes": ["Validation"] },
                "taskQueue": "special"
            }),
        );

        let doc_opts = ActivityOptions::for_document(&def).unwrap();
        assert_eq!(doc_opts.start_to_close, Duration::from_secs(20));
        assert_eq!(doc_opts.retry.maximum_attempts, 7);

        let opts = ActivityOptions::resolve(&def, "a", None, &task_meta).unwrap();
        assert_eq!(opts.start_to_close, Duration::from_secs(5));
        assert_eq!(opts.retry.maximum_attempts, 7);
        assert_eq!(opts.retry.initial_interval, Duration::from_millis(250));
        assert_eq!(opts.retry.non_retryable_error_types, vec!["Validation"]);
        assert_eq!(opts.task_queue.as_deref(), Some("special"));
    }

    #[test]
    fn test_bad_duration_names_scope() {
        let mut task_meta = Map::new();
        task_meta.insert(
            METADATA_ACTIVITY_OPTIONS.to_string(),
            json!({ "startToCloseTimeout": "5 seconds" }),
        );
        let err = ActivityOptions::resolve(&definition(""), "slow", None, &task_meta).unwrap_err();
        assert!(err.to_string().contains("task 'slow'"), "got: {err}");
    }
}
