//! Orchestration entry point.
//!
//! [`WorkflowRunner::execute`] is the function the substrate runs once per
//! workflow run: load, build, seed (or restore) state, report progress and
//! run the root sequence. It never returns an error; every failure becomes
//! a [`RunOutcome`] and a `FAILED` status.
//!
//! Continue-as-new hands back the next run's input.
//! [`WorkflowRunner::run_to_completion`] keeps opening fresh runs until the
//! workflow reaches a final state.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use tideway_types::config::{EngineConfig, TaskQueues};
use tideway_types::execution::{ExecutionPhase, ValidationResult, WorkflowExecution, WorkflowExecutionStatus};
use tideway_types::workflow::{METADATA_SEARCH_ATTRIBUTES, WorkflowDefinition};

use crate::claimcheck::ClaimCheckManager;
use crate::execution::status::UpdateStatusActivity;
use crate::substrate::BoxSubstrate;
use crate::substrate::activity::{
    ACTIVITY_CLAIM_CHECK_OFFLOAD, ACTIVITY_UPDATE_STATUS, ACTIVITY_VALIDATE_WORKFLOW, ActivityError,
    ActivityRequest, error_type,
};
use crate::substrate::run::{RunMetadata, SearchAttributes, WORKFLOW_TYPE_EXECUTE, WORKFLOW_TYPE_VALIDATE};

use super::loader::load_definition;
use super::options::ActivityOptions;
use super::state::{ExecutionState, StateSnapshot, seed_env};
use super::tasks::{DoTask, Executable, RunContext, TaskError, TaskFactory};
use super::validation::validation_failed;

/// Field the final output travels under through the offload activity.
const OUTPUT_FIELD: &str = "output";

/// Input of one workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInput {
    pub execution_id: String,
    /// Raw workflow document.
    pub workflow: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub env: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    /// Present on continued runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<StateSnapshot>,
}

impl RunInput {
    pub fn for_execution(execution: &WorkflowExecution) -> Self {
        Self {
            execution_id: execution.id.to_string(),
            workflow: execution.spec.workflow.clone(),
            input: execution.spec.input.clone(),
            env: Map::new(),
            org_id: execution.spec.org_id.clone(),
            snapshot: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed { output: Value },
    Failed { error_type: String, message: String },
    Cancelled,
    /// The run stopped at a continue-as-new point; start the next one.
    ContinueAsNew(Box<RunInput>),
}

impl RunOutcome {
    pub fn phase(&self) -> ExecutionPhase {
        match self {
            RunOutcome::Completed { .. } => ExecutionPhase::Completed,
            RunOutcome::Failed { .. } => ExecutionPhase::Failed,
            RunOutcome::Cancelled => ExecutionPhase::Cancelled,
            RunOutcome::ContinueAsNew(_) => ExecutionPhase::InProgress,
        }
    }

    fn failed(error_type: &str, message: impl Into<String>) -> Self {
        RunOutcome::Failed {
            error_type: error_type.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub queues: TaskQueues,
    /// History length that triggers continue-as-new. Zero disables it.
    pub max_history_length: u64,
}

impl From<&EngineConfig> for RunnerConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            queues: config.task_queues.clone(),
            max_history_length: config.max_history_length,
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

pub struct WorkflowRunner {
    substrate: BoxSubstrate,
    factory: Arc<TaskFactory>,
    claim_check: Option<Arc<ClaimCheckManager>>,
    config: RunnerConfig,
}

impl WorkflowRunner {
    pub fn new(substrate: BoxSubstrate, config: RunnerConfig) -> Self {
        Self {
            substrate,
            factory: Arc::new(TaskFactory::new()),
            claim_check: None,
            config,
        }
    }

    pub fn with_claim_check(mut self, manager: Arc<ClaimCheckManager>) -> Self {
        self.claim_check = Some(manager);
        self
    }

    pub fn with_factory(mut self, factory: Arc<TaskFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn substrate(&self) -> &BoxSubstrate {
        &self.substrate
    }

    /// Metadata for the first run of an execution.
    pub fn run_metadata(&self, execution_id: &str) -> RunMetadata {
        RunMetadata::new(execution_id, WORKFLOW_TYPE_EXECUTE, &self.config.queues.orchestration)
            .with_search_attributes(SearchAttributes::for_execution(execution_id))
    }

    /// Run an execution through every continue-as-new until it finishes.
    pub async fn run_to_completion(&self, mut input: RunInput) -> RunOutcome {
        let mut run = self.run_metadata(&input.execution_id);
        loop {
            self.substrate.begin_run(&run);
            match self.execute(&run, input).await {
                RunOutcome::ContinueAsNew(next) => {
                    self.substrate.end_run(&run, false);
                    let resume = next.snapshot.as_ref().map(|s| s.resume_from.clone()).unwrap_or_default();
                    tracing::info!(
                        execution_id = %next.execution_id,
                        previous_run = %run.run_id,
                        resume_from = %resume,
                        "continuing as new"
                    );
                    input = *next;
                    run = run.continued();
                }
                outcome => {
                    self.substrate.end_run(&run, true);
                    return outcome;
                }
            }
        }
    }

    /// Execute a single run.
    pub async fn execute(&self, run: &RunMetadata, input: RunInput) -> RunOutcome {
        let execution_id = input.execution_id.clone();
        let continued = input.snapshot.is_some();

        let (definition, root) = match self.prepare(&input) {
            Ok(prepared) => prepared,
            Err(outcome) => {
                if let RunOutcome::Failed { message, .. } = &outcome {
                    tracing::error!(execution_id = %execution_id, error = %message, "workflow could not be built");
                    self.report_final(run, &execution_id, Some(message.clone()), None, ExecutionPhase::Failed)
                        .await;
                }
                return outcome;
            }
        };

        if let Some(Value::Object(attrs)) = definition.metadata(METADATA_SEARCH_ATTRIBUTES) {
            self.substrate.upsert_search_attributes(run, attrs.clone());
        }

        let env = seed_env(&execution_id, input.org_id.as_deref(), &input.env);
        let mut state = match input.snapshot.clone() {
            Some(snapshot) => ExecutionState::restore(input.input.clone(), env, snapshot),
            None => ExecutionState::new(input.input.clone(), env),
        };

        if !continued {
            let status = WorkflowExecutionStatus {
                phase: ExecutionPhase::InProgress,
                started_at: Some(Utc::now()),
                ..Default::default()
            };
            self.report(run, &execution_id, status).await;
        }
        tracing::info!(
            execution_id = %execution_id,
            workflow = %definition.document.name,
            run_id = %run.run_id,
            continued,
            "workflow run started"
        );

        let ctx = RunContext {
            substrate: self.substrate.clone(),
            run: run.clone(),
            definition: Arc::clone(&definition),
            claim_check: self.claim_check.clone(),
            max_history_length: self.config.max_history_length,
        };

        match root.execute(&ctx, input.input.clone(), &mut state).await {
            Ok(output) => {
                tracing::info!(execution_id = %execution_id, "workflow completed");
                let output = self.offload_output(run, &execution_id, output).await;
                self.report_final(run, &execution_id, None, Some(output.clone()), ExecutionPhase::Completed)
                    .await;
                RunOutcome::Completed { output }
            }
            Err(TaskError::ContinueAsNew(snapshot)) => RunOutcome::ContinueAsNew(Box::new(RunInput {
                snapshot: Some(*snapshot),
                ..input
            })),
            Err(TaskError::Cancelled) => {
                tracing::info!(execution_id = %execution_id, "workflow cancelled");
                // The run itself is cancelled, so report from a detached one.
                let detached = run.detached();
                self.report_final(
                    &detached,
                    &execution_id,
                    Some("execution cancelled".to_string()),
                    None,
                    ExecutionPhase::Cancelled,
                )
                .await;
                self.substrate.end_run(&detached, true);
                RunOutcome::Cancelled
            }
            Err(err) => {
                tracing::error!(
                    execution_id = %execution_id,
                    error_type = err.error_type(),
                    error = %err,
                    "workflow failed"
                );
                let message = err.to_string();
                self.report_final(run, &execution_id, Some(message.clone()), None, ExecutionPhase::Failed)
                    .await;
                RunOutcome::failed(err.error_type(), message)
            }
        }
    }

    fn prepare(&self, input: &RunInput) -> Result<(Arc<WorkflowDefinition>, DoTask), RunOutcome> {
        let definition = load_definition(input.workflow.as_bytes())
            .map_err(|e| RunOutcome::failed(error_type::VALIDATION, e.to_string()))?;
        let root = self
            .factory
            .build_workflow(&definition)
            .map_err(|e| RunOutcome::failed(error_type::VALIDATION, e.to_string()))?;
        Ok((Arc::new(definition), root))
    }

    async fn report_final(
        &self,
        run: &RunMetadata,
        execution_id: &str,
        error: Option<String>,
        output: Option<Value>,
        phase: ExecutionPhase,
    ) {
        let status = WorkflowExecutionStatus {
            phase,
            error,
            output,
            completed_at: Some(Utc::now()),
            ..Default::default()
        };
        self.report(run, execution_id, status).await;
    }

    /// A final output above the claim-check threshold is offloaded before it
    /// reaches the status record. Offload failures keep it inline.
    async fn offload_output(&self, run: &RunMetadata, execution_id: &str, output: Value) -> Value {
        let Some(manager) = self.claim_check.as_ref().filter(|m| m.is_enabled()) else {
            return output;
        };
        if !manager.exceeds_threshold(&output) {
            return output;
        }

        let options = ActivityOptions {
            task_queue: Some(self.config.queues.orchestration.clone()),
            ..Default::default()
        };
        let mut fields = Map::new();
        fields.insert(OUTPUT_FIELD.to_string(), output.clone());
        let request = ActivityRequest::new(
            ACTIVITY_CLAIM_CHECK_OFFLOAD,
            "output-claimcheck",
            Value::Object(fields),
            options,
        );
        match self.substrate.execute_activity(run, request).await {
            Ok(Value::Object(mut replaced)) => {
                tracing::debug!(execution_id, "offloaded final output");
                replaced.remove(OUTPUT_FIELD).unwrap_or(output)
            }
            Ok(other) => {
                tracing::warn!(execution_id, result = %other, "unexpected claim-check offload result");
                output
            }
            Err(e) => {
                tracing::warn!(execution_id, error = %e, "final output offload failed, keeping it inline");
                output
            }
        }
    }

    /// Status goes through the substrate as an activity on the
    /// orchestration lane. Reporting failures never fail the workflow.
    async fn report(&self, run: &RunMetadata, execution_id: &str, status: WorkflowExecutionStatus) {
        let phase = status.phase;
        let options = ActivityOptions {
            task_queue: Some(self.config.queues.orchestration.clone()),
            ..Default::default()
        };
        let request = ActivityRequest::new(
            ACTIVITY_UPDATE_STATUS,
            "status",
            UpdateStatusActivity::input(execution_id, &status),
            options,
        );
        match self.substrate.execute_activity(run, request).await {
            Ok(_) => {}
            Err(ActivityError { error_type, .. }) if error_type == error_type::NOT_REGISTERED => {
                tracing::debug!(execution_id, %phase, "no status activity registered, status not persisted");
            }
            Err(e) => {
                tracing::warn!(execution_id, %phase, error = %e, "failed to report execution status");
            }
        }
    }

    /// Validate a document on the validation lane.
    pub async fn validate(&self, document: &str) -> ValidationResult {
        let run = RunMetadata::new(
            format!("validate-{}", uuid::Uuid::now_v7()),
            WORKFLOW_TYPE_VALIDATE,
            &self.config.queues.validation,
        );
        self.substrate.begin_run(&run);
        let options = ActivityOptions {
            task_queue: Some(self.config.queues.validation.clone()),
            ..Default::default()
        };
        let request = ActivityRequest::new(
            ACTIVITY_VALIDATE_WORKFLOW,
            "validate",
            json!({ "document": document }),
            options,
        );
        let result = match self.substrate.execute_activity(&run, request).await {
            Ok(value) => serde_json::from_value(value)
                .unwrap_or_else(|e| validation_failed(format!("unreadable validation result: {e}"))),
            Err(e) => {
                tracing::error!(error = %e, "validation activity failed");
                validation_failed(e.to_string())
            }
        };
        self.substrate.end_run(&run, true);
        result
    }
}
