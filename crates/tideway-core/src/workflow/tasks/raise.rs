//! `raise`: fail with a structured error.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;

use tideway_types::workflow::{ErrorSpec, TaskKind, TaskNode};

use crate::workflow::state::ExecutionState;

use super::error::{BuildError, TaskError, WorkflowError};
use super::factory::Builder;
use super::{Executable, ExecutableUnit, RunContext, evaluate_string};

pub struct RaiseTask {
    name: String,
    error: ErrorSpec,
}

pub(crate) fn compile(_builder: &Builder<'_>, node: &TaskNode) -> Result<ExecutableUnit, BuildError> {
    let TaskKind::Raise(spec) = &node.kind else {
        return Err(BuildError::InvalidTask {
            task: node.name.clone(),
            reason: "expected a raise task".to_string(),
        });
    };
    if spec.error.type_.trim().is_empty() {
        return Err(BuildError::InvalidTask {
            task: node.name.clone(),
            reason: "raise.error.type is required".to_string(),
        });
    }
    Ok(Arc::new(RaiseTask {
        name: node.name.clone(),
        error: spec.error.clone(),
    }))
}

impl RaiseTask {
    fn text(&self, raw: &Option<String>, context: &Value) -> Result<Option<String>, TaskError> {
        let Some(raw) = raw else {
            return Ok(None);
        };
        Ok(match evaluate_string(&self.name, raw, context)? {
            Value::String(s) => Some(s),
            Value::Null => None,
            other => Some(other.to_string()),
        })
    }

    fn build(&self, state: &ExecutionState, instance: Option<&str>) -> Result<WorkflowError, TaskError> {
        let context = state.expression_context();
        let mut error = WorkflowError::new(&self.error.type_, self.error.status);
        error.title = self.text(&self.error.title, &context)?;
        error.detail = self.text(&self.error.detail, &context)?;
        error.instance = instance.map(str::to_string);
        Ok(error)
    }
}

impl Executable for RaiseTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute<'a>(
        &'a self,
        ctx: &'a RunContext,
        _input: Value,
        state: &'a mut ExecutionState,
    ) -> BoxFuture<'a, Result<Value, TaskError>> {
        Box::pin(async move {
            let error = self.build(state, ctx.run.execution_id())?;
            tracing::info!(task = %self.name, error = %error, "raising error");
            Err(TaskError::Raised(error))
        })
    }
}
