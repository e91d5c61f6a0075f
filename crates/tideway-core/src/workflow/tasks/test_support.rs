//! Shared fixtures for task unit tests.

use std::sync::Arc;

use serde_json::{Map, Value};

use tideway_types::workflow::WorkflowDefinition;

use crate::substrate::activity::ActivityRegistry;
use crate::substrate::local::{LocalSubstrate, LocalSubstrateConfig};
use crate::substrate::run::{RunMetadata, SearchAttributes, WORKFLOW_TYPE_EXECUTE};
use crate::substrate::{BoxSubstrate, Substrate};
use crate::workflow::loader::load_definition;
use crate::workflow::state::{ExecutionState, seed_env};

use super::error::TaskError;
use super::{DoTask, Executable, RunContext, TaskFactory};

pub(crate) const EXECUTION_ID: &str = "0190c5e2-0000-7000-8000-000000000001";
pub(crate) const LANE: &str = "workflow_execution";

/// Parse a document whose `do:` list is `body`.
pub(crate) fn definition(body: &str) -> WorkflowDefinition {
    let yaml = format!(
        "document:\n  dsl: \"1.0.0\"\n  namespace: test\n  name: harness\n  version: \"1\"\ndo:{body}"
    );
    load_definition(yaml.as_bytes()).unwrap()
}

pub(crate) struct Harness {
    pub definition: Arc<WorkflowDefinition>,
    pub root: DoTask,
    pub substrate: Arc<LocalSubstrate>,
    pub ctx: RunContext,
    registry: ActivityRegistry,
}

impl Harness {
    pub fn new(definition: WorkflowDefinition) -> Self {
        Self::with_registry(definition, ActivityRegistry::new())
    }

    pub fn with_registry(definition: WorkflowDefinition, registry: ActivityRegistry) -> Self {
        Self::assemble(Arc::new(definition), registry, u64::MAX)
    }

    fn assemble(definition: Arc<WorkflowDefinition>, registry: ActivityRegistry, suggest_at: u64) -> Self {
        let root = TaskFactory::new().build_workflow(&definition).unwrap();
        let substrate = Arc::new(LocalSubstrate::new(
            registry.clone(),
            LocalSubstrateConfig {
                max_concurrency: 4,
                suggest_continue_as_new_at: suggest_at,
            },
        ));
        let run = RunMetadata::new(EXECUTION_ID, WORKFLOW_TYPE_EXECUTE, LANE)
            .with_search_attributes(SearchAttributes::for_execution(EXECUTION_ID));
        substrate.begin_run(&run);
        let ctx = RunContext {
            substrate: BoxSubstrate::from_arc(Arc::clone(&substrate)),
            run,
            definition: Arc::clone(&definition),
            claim_check: None,
            max_history_length: 0,
        };
        Self {
            definition,
            root,
            substrate,
            ctx,
            registry,
        }
    }

    /// Same document, substrate always suggesting continue-as-new.
    pub fn suggest_continue_as_new(self) -> Self {
        Self::assemble(self.definition, self.registry, 0)
    }

    pub fn without_suggestion(self) -> Self {
        Self::assemble(self.definition, self.registry, u64::MAX)
    }

    pub fn state(&self, input: Value) -> ExecutionState {
        ExecutionState::new(input, seed_env(EXECUTION_ID, None, &Map::new()))
    }

    pub async fn run(&self, state: &mut ExecutionState) -> Result<Value, TaskError> {
        let input = state.input().clone();
        self.root.execute(&self.ctx, input, state).await
    }
}
