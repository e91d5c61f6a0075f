//! `listen`: suspend until external signals arrive.
//!
//! Each event filter waits on the substrate signal named by `with.id`.
//! A payload completes its filter when `acceptIf` (evaluated with the
//! payload as `output`) holds; otherwise the filter keeps waiting. The
//! `data` template, when present, shapes what the filter yields.
//!
//! `to.one` waits for a single filter, `to.any` for the first of several
//! and `to.all` for every one of them. The result is stored under the task
//! name. The wait is bounded by the task `timeout`, then by the `timeout`
//! metadata entry, then by one minute; running out raises a `timeout` error.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{self, BoxFuture, FutureExt};
use serde_json::Value;

use tideway_types::workflow::{DurationSpec, EventProperties, TaskKind, TaskNode};

use crate::workflow::state::ExecutionState;

use super::error::{BuildError, TaskError, WorkflowError};
use super::factory::Builder;
use super::{Executable, ExecutableUnit, RunContext, context_with_output, predicate, traverse};

/// Listener timeout when neither the task nor its metadata sets one.
pub const DEFAULT_LISTEN_TIMEOUT: Duration = Duration::from_secs(60);

const METADATA_TIMEOUT: &str = "timeout";
const EVENT_TYPE_SIGNAL: &str = "signal";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    One,
    Any,
    All,
}

pub struct ListenTask {
    name: String,
    strategy: Strategy,
    events: Vec<EventProperties>,
    timeout: Duration,
}

/// Effective timeout for a listen task node.
pub(crate) fn listen_timeout(node: &TaskNode) -> Result<Duration, String> {
    if let Some(timeout) = &node.base.timeout {
        return timeout.after.to_duration().map_err(|e| e.to_string());
    }
    match node.base.metadata.get(METADATA_TIMEOUT) {
        Some(raw) => serde_json::from_value::<DurationSpec>(raw.clone())
            .map_err(|e| e.to_string())?
            .to_duration()
            .map_err(|e| e.to_string()),
        None => Ok(DEFAULT_LISTEN_TIMEOUT),
    }
}

pub(crate) fn compile(_builder: &Builder<'_>, node: &TaskNode) -> Result<ExecutableUnit, BuildError> {
    let invalid = |reason: String| BuildError::InvalidTask {
        task: node.name.clone(),
        reason,
    };
    let TaskKind::Listen(spec) = &node.kind else {
        return Err(invalid("expected a listen task".to_string()));
    };

    let to = &spec.to;
    let (strategy, filters) = match (to.one.as_ref(), to.any.is_empty(), to.all.is_empty()) {
        (Some(one), true, true) => (Strategy::One, vec![one.clone()]),
        (None, false, true) => (Strategy::Any, to.any.clone()),
        (None, true, false) => (Strategy::All, to.all.clone()),
        _ => return Err(invalid("listen.to needs exactly one of one, any or all".to_string())),
    };

    let events: Vec<EventProperties> = filters.into_iter().map(|f| f.with).collect();
    if let Some(other) = events.iter().find(|e| e.type_ != EVENT_TYPE_SIGNAL) {
        return Err(invalid(format!(
            "event '{}' has unsupported type '{}', only '{EVENT_TYPE_SIGNAL}' is supported",
            other.id, other.type_
        )));
    }

    Ok(Arc::new(ListenTask {
        name: node.name.clone(),
        strategy,
        events,
        timeout: listen_timeout(node).map_err(|e| invalid(format!("timeout: {e}")))?,
    }))
}

impl ListenTask {
    /// Wait for one filter to accept a payload.
    async fn await_event(
        &self,
        ctx: &RunContext,
        event: &EventProperties,
        view: &ExecutionState,
    ) -> Result<Value, TaskError> {
        loop {
            let payload = ctx
                .substrate
                .receive_signal(&ctx.run, &event.id)
                .await
                .map_err(|e| TaskError::substrate(&self.name, e))?;
            let context = context_with_output(view, &payload);

            let accepted = match &event.accept_if {
                None => true,
                Some(Value::Bool(b)) => *b,
                Some(Value::String(raw)) => predicate(&self.name, raw, &context)?,
                Some(other) => {
                    return Err(TaskError::runtime(
                        &self.name,
                        format!("acceptIf must be a boolean or expression, got {other}"),
                    ));
                }
            };
            if !accepted {
                tracing::debug!(task = %self.name, signal = %event.id, "signal rejected by acceptIf");
                continue;
            }

            tracing::debug!(task = %self.name, signal = %event.id, "signal accepted");
            return match &event.data {
                Some(template) => traverse(&self.name, template, &context),
                None => Ok(payload),
            };
        }
    }

    async fn listen(&self, ctx: &RunContext, view: &ExecutionState) -> Result<Value, TaskError> {
        let waits = self
            .events
            .iter()
            .map(|event| self.await_event(ctx, event, view).boxed());

        match self.strategy {
            Strategy::One | Strategy::Any => {
                let (first, _, _) = future::select_all(waits).await;
                first
            }
            Strategy::All => {
                let values = future::try_join_all(waits).await?;
                Ok(Value::Array(values))
            }
        }
    }

    fn timed_out(&self, ctx: &RunContext) -> TaskError {
        let mut error = WorkflowError::new("timeout", None)
            .with_title(format!("listen task '{}' timed out", self.name))
            .with_detail(format!("no matching signal within {:?}", self.timeout));
        if let Some(id) = ctx.run.execution_id() {
            error = error.with_instance(id);
        }
        TaskError::Raised(error)
    }

    async fn run(&self, ctx: &RunContext, state: &mut ExecutionState) -> Result<Value, TaskError> {
        tracing::info!(
            task = %self.name,
            strategy = ?self.strategy,
            signals = ?self.events.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(),
            timeout_ms = self.timeout.as_millis() as u64,
            "listening for signals"
        );

        let view = state.branch();
        let result = tokio::select! {
            result = self.listen(ctx, &view) => result?,
            timer = ctx.substrate.sleep(&ctx.run, self.timeout) => {
                timer.map_err(|e| TaskError::substrate(&self.name, e))?;
                tracing::warn!(task = %self.name, "listen timed out");
                return Err(self.timed_out(ctx));
            }
        };

        state.set_field(self.name.clone(), result.clone());
        Ok(result)
    }
}

impl Executable for ListenTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute<'a>(
        &'a self,
        ctx: &'a RunContext,
        _input: Value,
        state: &'a mut ExecutionState,
    ) -> BoxFuture<'a, Result<Value, TaskError>> {
        Box::pin(self.run(ctx, state))
    }
}
