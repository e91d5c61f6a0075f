//! Progress reporting interceptor.
//!
//! Observes every activity attempt and keeps a per-execution task list in
//! step with it. Each transition sends the complete list, so the status
//! merge can simply replace what it has.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde_json::Value;

use tideway_types::execution::{ExecutionPhase, WorkflowExecutionStatus, WorkflowTask};

use crate::substrate::activity::{
    ACTIVITY_CLAIM_CHECK_OFFLOAD, ACTIVITY_CLAIM_CHECK_RETRIEVE, ACTIVITY_UPDATE_STATUS, ACTIVITY_VALIDATE_WORKFLOW,
    ActivityError, ActivityInfo, task_name_from_activity_id,
};
use crate::substrate::interceptor::ActivityInterceptor;
use crate::substrate::run::WORKFLOW_TYPE_EXECUTE;

use super::status::StatusReporter;

/// Engine-internal activities that never show up as user tasks.
const INTERNAL_ACTIVITIES: [&str; 5] = [
    WORKFLOW_TYPE_EXECUTE,
    ACTIVITY_UPDATE_STATUS,
    ACTIVITY_CLAIM_CHECK_OFFLOAD,
    ACTIVITY_CLAIM_CHECK_RETRIEVE,
    ACTIVITY_VALIDATE_WORKFLOW,
];

pub struct ProgressInterceptor {
    reporter: Arc<dyn StatusReporter>,
    tasks: DashMap<String, Vec<WorkflowTask>>,
}

impl ProgressInterceptor {
    pub fn new(reporter: Arc<dyn StatusReporter>) -> Self {
        Self {
            reporter,
            tasks: DashMap::new(),
        }
    }

    /// Drop the tracked task list once an execution reached a final state.
    pub fn forget(&self, execution_id: &str) {
        self.tasks.remove(execution_id);
    }

    /// Execution id and task name, or `None` if this attempt is not reported.
    fn target<'a>(info: &'a ActivityInfo) -> Option<(&'a str, &'a str)> {
        if INTERNAL_ACTIVITIES.contains(&info.activity_type.as_str()) {
            return None;
        }
        let execution_id = info.run.execution_id()?;
        let task_name = task_name_from_activity_id(&info.activity_id)?;
        Some((execution_id, task_name))
    }

    /// Apply `update` to the task entry and return a copy of the full list.
    fn record(&self, execution_id: &str, info: &ActivityInfo, task_name: &str, update: impl FnOnce(&mut WorkflowTask)) -> Vec<WorkflowTask> {
        let mut list = self.tasks.entry(execution_id.to_string()).or_default();
        let idx = match list.iter().position(|t| t.task_id == info.activity_id) {
            Some(idx) => idx,
            None => {
                list.push(WorkflowTask {
                    task_id: info.activity_id.clone(),
                    task_name: task_name.to_string(),
                    status: ExecutionPhase::Pending,
                    started_at: None,
                    completed_at: None,
                    error: None,
                });
                list.len() - 1
            }
        };
        update(&mut list[idx]);
        list.clone()
    }

    async fn report(&self, execution_id: &str, tasks: Vec<WorkflowTask>) {
        let status = WorkflowExecutionStatus {
            tasks,
            ..Default::default()
        };
        if let Err(e) = self.reporter.update_status(execution_id, status).await {
            tracing::warn!(execution_id, error = %e, "failed to report task progress");
        }
    }
}

impl ActivityInterceptor for ProgressInterceptor {
    fn on_start<'a>(&'a self, info: &'a ActivityInfo) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let Some((execution_id, task_name)) = Self::target(info) else {
                return;
            };
            let tasks = self.record(execution_id, info, task_name, |task| {
                task.status = ExecutionPhase::InProgress;
                task.started_at.get_or_insert_with(Utc::now);
                task.completed_at = None;
                task.error = None;
            });
            tracing::debug!(execution_id, task = task_name, attempt = info.attempt, "task started");
            self.report(execution_id, tasks).await;
        })
    }

    fn on_finish<'a>(
        &'a self,
        info: &'a ActivityInfo,
        outcome: Result<&'a Value, &'a ActivityError>,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let Some((execution_id, task_name)) = Self::target(info) else {
                return;
            };
            let tasks = self.record(execution_id, info, task_name, |task| {
                task.completed_at = Some(Utc::now());
                match outcome {
                    Ok(_) => {
                        task.status = ExecutionPhase::Completed;
                        task.error = None;
                    }
                    Err(e) => {
                        task.status = ExecutionPhase::Failed;
                        task.error = Some(e.to_string());
                    }
                }
            });
            tracing::debug!(execution_id, task = task_name, ok = outcome.is_ok(), "task finished");
            self.report(execution_id, tasks).await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::status::StatusError;
    use crate::substrate::activity::{ACTIVITY_CALL_HTTP, activity_id};
    use crate::substrate::run::{RunMetadata, SearchAttributes};
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;
    use tideway_types::execution::{ExecutionSpec, WorkflowExecution};

    #[derive(Default)]
    struct Recorder {
        updates: Mutex<Vec<(String, WorkflowExecutionStatus)>>,
        fail: bool,
    }

    impl StatusReporter for Recorder {
        fn update_status<'a>(
            &'a self,
            execution_id: &'a str,
            status: WorkflowExecutionStatus,
        ) -> BoxFuture<'a, Result<WorkflowExecution, StatusError>> {
            Box::pin(async move {
                self.updates.lock().unwrap().push((execution_id.to_string(), status));
                if self.fail {
                    return Err(StatusError::InvalidId(execution_id.to_string()));
                }
                Ok(WorkflowExecution::new(ExecutionSpec {
                    workflow: String::new(),
                    input: json!(null),
                    org_id: None,
                }))
            })
        }
    }

    fn info(activity_type: &str, task: &str, execution_id: Option<&str>) -> ActivityInfo {
        let mut run = RunMetadata::new("wf", WORKFLOW_TYPE_EXECUTE, "q");
        if let Some(id) = execution_id {
            run = run.with_search_attributes(SearchAttributes::for_execution(id));
        }
        ActivityInfo {
            activity_id: activity_id(task, Utc::now()),
            activity_type: activity_type.to_string(),
            task_queue: "q".to_string(),
            attempt: 1,
            scheduled_at: Utc::now(),
            start_to_close: Duration::from_secs(1),
            run,
        }
    }

    #[tokio::test]
    async fn test_reports_full_task_list_on_each_transition() {
        let recorder = Arc::new(Recorder::default());
        let interceptor = ProgressInterceptor::new(recorder.clone());

        let fetch = info(ACTIVITY_CALL_HTTP, "fetch", Some("exec-1"));
        interceptor.on_start(&fetch).await;
        interceptor.on_finish(&fetch, Ok(&json!({}))).await;

        let store = info(ACTIVITY_CALL_HTTP, "store", Some("exec-1"));
        interceptor.on_start(&store).await;
        let err = ActivityError::non_retryable("Communication", "503");
        interceptor.on_finish(&store, Err(&err)).await;

        let updates = recorder.updates.lock().unwrap();
        assert_eq!(updates.len(), 4);
        assert!(updates.iter().all(|(id, _)| id == "exec-1"));

        assert_eq!(updates[0].1.tasks[0].status, ExecutionPhase::InProgress);
        assert_eq!(updates[1].1.tasks[0].status, ExecutionPhase::Completed);

        let last = &updates[3].1.tasks;
        assert_eq!(last.len(), 2);
        assert_eq!(last[0].task_name, "fetch");
        assert_eq!(last[0].status, ExecutionPhase::Completed);
        assert_eq!(last[1].task_name, "store");
        assert_eq!(last[1].status, ExecutionPhase::Failed);
        assert!(last[1].error.as_deref().unwrap().contains("503"));
        assert_eq!(updates[3].1.phase, ExecutionPhase::Unspecified);
    }

    #[tokio::test]
    async fn test_skips_internal_and_unattributed_activities() {
        let recorder = Arc::new(Recorder::default());
        let interceptor = ProgressInterceptor::new(recorder.clone());

        for internal in INTERNAL_ACTIVITIES {
            interceptor.on_start(&info(internal, "x", Some("exec-1"))).await;
        }
        interceptor.on_start(&info(ACTIVITY_CALL_HTTP, "x", None)).await;

        let mut foreign = info(ACTIVITY_CALL_HTTP, "x", Some("exec-1"));
        foreign.activity_id = "claimcheck-123".to_string();
        interceptor.on_start(&foreign).await;

        assert!(recorder.updates.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reporter_failure_is_swallowed() {
        let recorder = Arc::new(Recorder {
            fail: true,
            ..Default::default()
        });
        let interceptor = ProgressInterceptor::new(recorder.clone());
        let call = info(ACTIVITY_CALL_HTTP, "fetch", Some("exec-1"));
        interceptor.on_start(&call).await;
        interceptor.on_finish(&call, Ok(&json!(1))).await;
        assert_eq!(recorder.updates.lock().unwrap().len(), 2);

        interceptor.forget("exec-1");
        assert!(interceptor.tasks.is_empty());
    }
}
