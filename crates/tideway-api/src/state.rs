//! Application state wiring the engine together.
//!
//! AppState owns every long-lived handle (store, broker, status merger,
//! substrate, runner) and is shared by the CLI commands and REST handlers.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;

use tideway_core::claimcheck::activity::{ClaimCheckOffload, ClaimCheckRetrieve};
use tideway_core::claimcheck::{BoxBlobStore, ClaimCheckManager};
use tideway_core::execution::{ProgressInterceptor, StatusMerger, StreamBroker, UpdateStatusActivity};
use tideway_core::repository::{BoxResourceStore, ExecutionRepository};
use tideway_core::substrate::BoxSubstrate;
use tideway_core::substrate::activity::ActivityRegistry;
use tideway_core::substrate::local::{LocalSubstrate, LocalSubstrateConfig};
use tideway_core::workflow::validation::ValidateWorkflowActivity;
use tideway_core::workflow::{RunInput, RunOutcome, RunnerConfig, WorkflowRunner};
use tideway_infra::activity::register_call_activities;
use tideway_infra::blob::OpendalBlobStore;
use tideway_infra::config::{data_dir, load_engine_config};
use tideway_infra::sqlite::{DatabasePool, SqliteResourceStore};
use tideway_types::config::EngineConfig;
use tideway_types::execution::{ExecutionSpec, WorkflowExecution};

const BLOB_DIR: &str = "blobs";

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<EngineConfig>,
    pub data_dir: PathBuf,
    pub store: BoxResourceStore,
    pub executions: ExecutionRepository,
    pub broker: Arc<StreamBroker>,
    pub interceptor: Arc<ProgressInterceptor>,
    pub substrate: Arc<LocalSubstrate>,
    pub runner: Arc<WorkflowRunner>,
    pub claim_check: Arc<ClaimCheckManager>,
}

impl AppState {
    /// Load config, open the database and wire the engine.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = data_dir();
        tokio::fs::create_dir_all(&data_dir).await?;

        let config = load_engine_config(&data_dir).await?;
        let pool = DatabasePool::in_dir(&data_dir).await?;
        let store = BoxResourceStore::new(SqliteResourceStore::new(pool));

        let default_root = data_dir.join(BLOB_DIR).display().to_string();
        let claim_check = if config.claim_check.enabled {
            let blobs = OpendalBlobStore::from_config(&config.claim_check.blob_store, &default_root)?;
            ClaimCheckManager::new(BoxBlobStore::new(blobs), &config.claim_check)
        } else {
            ClaimCheckManager::disabled()
        };

        Self::assemble(config, data_dir, store, claim_check)
    }

    /// Wire the engine around an existing store.
    pub fn assemble(
        config: EngineConfig,
        data_dir: PathBuf,
        store: BoxResourceStore,
        claim_check: ClaimCheckManager,
    ) -> anyhow::Result<Self> {
        let executions = ExecutionRepository::new(store.clone());
        let broker = Arc::new(StreamBroker::new());
        let merger = Arc::new(StatusMerger::new(executions.clone(), Arc::clone(&broker)));
        let interceptor = Arc::new(ProgressInterceptor::new(merger.clone()));
        let claim_check = Arc::new(claim_check);

        let queues = &config.task_queues;
        let mut registry = ActivityRegistry::new();
        registry.register(&queues.orchestration, UpdateStatusActivity::new(merger));
        registry.register(&queues.orchestration, ClaimCheckOffload::new(Arc::clone(&claim_check)));
        registry.register(&queues.orchestration, ClaimCheckRetrieve::new(Arc::clone(&claim_check)));
        registry.register(&queues.validation, ValidateWorkflowActivity);
        register_call_activities(&mut registry, &queues.execution)?;

        let substrate = Arc::new(
            LocalSubstrate::new(
                registry,
                LocalSubstrateConfig {
                    max_concurrency: config.max_concurrency,
                    suggest_continue_as_new_at: config.max_history_length,
                },
            )
            .with_interceptor(interceptor.clone()),
        );

        let mut runner = WorkflowRunner::new(BoxSubstrate::from_arc(Arc::clone(&substrate)), RunnerConfig::from(&config));
        if claim_check.is_enabled() {
            runner = runner.with_claim_check(Arc::clone(&claim_check));
        }

        Ok(Self {
            config: Arc::new(config),
            data_dir,
            store,
            executions,
            broker,
            interceptor,
            substrate,
            runner: Arc::new(runner),
            claim_check,
        })
    }

    /// Persist a new `PENDING` execution.
    pub async fn submit(&self, workflow: String, input: Value, org_id: Option<String>) -> anyhow::Result<WorkflowExecution> {
        let execution = WorkflowExecution::new(ExecutionSpec { workflow, input, org_id });
        self.executions.put(&execution).await?;
        // Open the run now so signals and cancellation are accepted before
        // the runner picks it up.
        self.substrate.open_run(&execution.id.to_string());
        tracing::info!(execution_id = %execution.id, "execution submitted");
        Ok(execution)
    }

    /// Run an execution to its final state.
    pub async fn run(&self, execution: &WorkflowExecution) -> RunOutcome {
        let id = execution.id.to_string();
        let outcome = self.runner.run_to_completion(RunInput::for_execution(execution)).await;
        self.interceptor.forget(&id);
        outcome
    }

    /// Run an execution in the background.
    pub fn start(&self, execution: WorkflowExecution) {
        let state = self.clone();
        tokio::spawn(async move {
            let outcome = state.run(&execution).await;
            tracing::debug!(execution_id = %execution.id, phase = %outcome.phase(), "background run finished");
        });
    }
}
