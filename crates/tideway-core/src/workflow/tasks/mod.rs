//! Executable task units.
//!
//! A workflow document compiles into a tree of [`Executable`] units, rooted
//! at a `do` sequence. Compilation is done by the [`factory::TaskFactory`];
//! execution is driven by the sequence unit, which owns flow control,
//! guards, output/export transforms and continue-as-new.

pub mod call;
pub mod error;
pub mod factory;
pub mod for_each;
pub mod fork;
pub mod listen;
pub mod raise;
pub mod sequence;
pub mod set;
pub mod switch;
pub mod try_catch;
pub mod wait;

#[cfg(test)]
pub(crate) mod test_support;

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::{Map, Value};

use tideway_types::claimcheck::ClaimCheckRef;
use tideway_types::workflow::WorkflowDefinition;

use crate::claimcheck::ClaimCheckManager;
use crate::substrate::BoxSubstrate;
use crate::substrate::activity::{ACTIVITY_CLAIM_CHECK_OFFLOAD, ACTIVITY_CLAIM_CHECK_RETRIEVE, ActivityRequest};
use crate::substrate::run::RunMetadata;

use super::expression::with_evaluator;
use super::options::ActivityOptions;
use super::state::ExecutionState;

pub use error::{BuildError, TaskError, WorkflowError};
pub use factory::TaskFactory;
pub use sequence::DoTask;

/// Everything a unit needs from the run it executes in.
#[derive(Clone)]
pub struct RunContext {
    pub substrate: BoxSubstrate,
    pub run: RunMetadata,
    pub definition: Arc<WorkflowDefinition>,
    /// Present only when claim-check offloading is enabled.
    pub claim_check: Option<Arc<ClaimCheckManager>>,
    /// History length above which the root sequence continues as new.
    /// Zero disables the check (the substrate may still suggest it).
    pub max_history_length: u64,
}

impl RunContext {
    fn claim_check(&self) -> Option<&Arc<ClaimCheckManager>> {
        self.claim_check.as_ref().filter(|m| m.is_enabled())
    }
}

/// A compiled task.
pub trait Executable: Send + Sync {
    fn name(&self) -> &str;

    /// Run the task. `input` is the output of the previous task in the
    /// enclosing sequence (or the sequence's own input for the first one).
    fn execute<'a>(
        &'a self,
        ctx: &'a RunContext,
        input: Value,
        state: &'a mut ExecutionState,
    ) -> BoxFuture<'a, Result<Value, TaskError>>;
}

pub type ExecutableUnit = Arc<dyn Executable>;

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Expression context with `output` set to the given value.
pub(crate) fn context_with_output(state: &ExecutionState, output: &Value) -> Value {
    let mut ctx = state.expression_context();
    if let Some(obj) = ctx.as_object_mut() {
        obj.insert("output".to_string(), output.clone());
    }
    ctx
}

pub(crate) fn traverse(task: &str, value: &Value, context: &Value) -> Result<Value, TaskError> {
    with_evaluator(|ev| ev.traverse(value, context)).map_err(|e| TaskError::expression(task, e))
}

pub(crate) fn predicate(task: &str, raw: &str, context: &Value) -> Result<bool, TaskError> {
    with_evaluator(|ev| ev.evaluate_predicate(raw, context)).map_err(|e| TaskError::expression(task, e))
}

pub(crate) fn evaluate_string(task: &str, raw: &str, context: &Value) -> Result<Value, TaskError> {
    with_evaluator(|ev| ev.evaluate_string(raw, context)).map_err(|e| TaskError::expression(task, e))
}

/// Expression context for a task that needs real payloads: any claim-check
/// references in the data namespace are resolved (through the retrieve
/// activity) into a throwaway copy. The run state itself keeps the refs.
pub(crate) async fn resolved_context(
    ctx: &RunContext,
    task: &str,
    state: &ExecutionState,
) -> Result<Value, TaskError> {
    let refs: Map<String, Value> = state
        .data()
        .iter()
        .filter(|(_, v)| ClaimCheckRef::is_ref(v))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    if refs.is_empty() || ctx.claim_check().is_none() {
        return Ok(state.expression_context());
    }

    let request = ActivityRequest::new(
        ACTIVITY_CLAIM_CHECK_RETRIEVE,
        format!("{task}-claimcheck"),
        Value::Object(refs),
        ActivityOptions::for_document(&ctx.definition).unwrap_or_default(),
    );
    let resolved = ctx
        .substrate
        .execute_activity(&ctx.run, request)
        .await
        .map_err(|e| TaskError::activity(task, e))?;

    let mut view = state.branch();
    if let Value::Object(fields) = resolved {
        view.add_data(fields);
    }
    Ok(view.expression_context())
}

/// Offload data fields above the claim-check threshold. Failures are
/// logged and leave the state untouched.
pub(crate) async fn offload_oversized(ctx: &RunContext, task: &str, state: &mut ExecutionState) {
    let Some(manager) = ctx.claim_check() else {
        return;
    };
    let large: Map<String, Value> = state
        .data()
        .iter()
        .filter(|(_, v)| manager.exceeds_threshold(v))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    if large.is_empty() {
        return;
    }

    let fields: Vec<String> = large.keys().cloned().collect();
    let request = ActivityRequest::new(
        ACTIVITY_CLAIM_CHECK_OFFLOAD,
        format!("{task}-claimcheck"),
        Value::Object(large),
        ActivityOptions::for_document(&ctx.definition).unwrap_or_default(),
    );
    match ctx.substrate.execute_activity(&ctx.run, request).await {
        Ok(Value::Object(replaced)) => {
            tracing::debug!(task, fields = ?fields, "offloaded oversized state fields");
            state.add_data(replaced);
        }
        Ok(other) => {
            tracing::warn!(task, result = %other, "unexpected claim-check offload result");
        }
        Err(e) => {
            tracing::warn!(task, error = %e, "claim-check offload failed, keeping state inline");
        }
    }
}
