//! `try`: run a body, optionally recovering from its failure.
//!
//! A failure is caught when it passes every configured filter: the error
//! type and status under `catch.errors.with`, then `when` and `exceptWhen`.
//! Both predicates see the error bound under `catch.as` (default `error`).
//! A caught error stays bound in the data namespace, and the task output is
//! the output of `catch.do`, or the error itself when there is no handler.
//!
//! `finally` runs after the body and any handler, whatever their outcome,
//! except when the run was cancelled. A failing `finally` replaces the
//! original outcome.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;

use tideway_types::workflow::{ErrorFilter, TaskKind, TaskNode};

use crate::workflow::state::ExecutionState;

use super::error::{BuildError, TaskError};
use super::factory::Builder;
use super::sequence::DoTask;
use super::{Executable, ExecutableUnit, RunContext, predicate};

const DEFAULT_ERROR_BINDING: &str = "error";

struct Catch {
    filter: Option<ErrorFilter>,
    binding: String,
    when: Option<String>,
    except_when: Option<String>,
    handler: Option<DoTask>,
}

pub struct TryTask {
    name: String,
    body: DoTask,
    catch: Option<Catch>,
    finally: Option<DoTask>,
}

pub(crate) fn compile(builder: &Builder<'_>, node: &TaskNode) -> Result<ExecutableUnit, BuildError> {
    let TaskKind::Try(spec) = &node.kind else {
        return Err(BuildError::InvalidTask {
            task: node.name.clone(),
            reason: "expected a try task".to_string(),
        });
    };
    if spec.try_.is_empty() {
        return Err(BuildError::InvalidTask {
            task: node.name.clone(),
            reason: "try body has no tasks".to_string(),
        });
    }

    let name = &node.name;
    let catch = match &spec.catch {
        Some(catch) => Some(Catch {
            filter: catch.errors.as_ref().and_then(|e| e.with.clone()),
            binding: catch.as_.clone().unwrap_or_else(|| DEFAULT_ERROR_BINDING.to_string()),
            when: catch.when.clone(),
            except_when: catch.except_when.clone(),
            handler: match &catch.do_ {
                Some(tasks) if !tasks.is_empty() => {
                    Some(builder.sequence(name, tasks, &format!("{name}/catch/"), false)?)
                }
                _ => None,
            },
        }),
        None => None,
    };
    let finally = match &spec.finally {
        Some(tasks) if !tasks.is_empty() => Some(builder.sequence(name, tasks, &format!("{name}/finally/"), false)?),
        _ => None,
    };

    Ok(Arc::new(TryTask {
        name: name.clone(),
        body: builder.sequence(name, &spec.try_, &format!("{name}/try/"), false)?,
        catch,
        finally,
    }))
}

impl Catch {
    /// Whether `error` (already in structured form) is caught.
    fn accepts(&self, task: &str, error: &Value, state: &ExecutionState) -> Result<bool, TaskError> {
        if let Some(filter) = &self.filter {
            if let Some(type_) = &filter.type_ {
                let caught = error
                    .get("type")
                    .and_then(Value::as_str)
                    .is_some_and(|t| t == super::error::error_type_uri(type_));
                if !caught {
                    return Ok(false);
                }
            }
            if let Some(status) = filter.status {
                if error.get("status").and_then(Value::as_u64) != Some(u64::from(status)) {
                    return Ok(false);
                }
            }
        }

        if self.when.is_none() && self.except_when.is_none() {
            return Ok(true);
        }
        let mut view = state.branch();
        view.set_field(self.binding.clone(), error.clone());
        let context = view.expression_context();
        if let Some(when) = &self.when {
            if !predicate(task, when, &context)? {
                return Ok(false);
            }
        }
        if let Some(except_when) = &self.except_when {
            if predicate(task, except_when, &context)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl TryTask {
    async fn recover(
        &self,
        ctx: &RunContext,
        input: Value,
        err: TaskError,
        state: &mut ExecutionState,
    ) -> Result<Value, TaskError> {
        let Some(catch) = &self.catch else {
            return Err(err);
        };
        let error = err.to_value(ctx.run.execution_id());
        if !catch.accepts(&self.name, &error, state)? {
            tracing::debug!(task = %self.name, error = %err, "error does not match catch filter");
            return Err(err);
        }

        tracing::info!(task = %self.name, error_type = err.error_type(), error = %err, "caught task error");
        // A directive left behind by the failed body must not leak.
        state.take_directive();
        state.set_field(catch.binding.clone(), error.clone());
        match &catch.handler {
            Some(handler) => handler.execute(ctx, input, state).await,
            None => Ok(error),
        }
    }

    async fn run(&self, ctx: &RunContext, input: Value, state: &mut ExecutionState) -> Result<Value, TaskError> {
        let outcome = match self.body.execute(ctx, input.clone(), state).await {
            Ok(output) => Ok(output),
            Err(err) if !err.is_catchable() => return Err(err),
            Err(err) => self.recover(ctx, input.clone(), err, state).await,
        };

        if let Some(finally) = &self.finally {
            if matches!(outcome, Err(TaskError::Cancelled)) {
                return outcome;
            }
            // An `end` from the body still applies after `finally`.
            let pending = state.take_directive();
            if let Err(err) = finally.execute(ctx, input, state).await {
                tracing::warn!(task = %self.name, error = %err, succeeded = outcome.is_ok(), "finally block failed");
                return Err(err);
            }
            if let Some(directive) = pending {
                state.set_directive(directive);
            }
        }
        outcome
    }
}

impl Executable for TryTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute<'a>(
        &'a self,
        ctx: &'a RunContext,
        input: Value,
        state: &'a mut ExecutionState,
    ) -> BoxFuture<'a, Result<Value, TaskError>> {
        Box::pin(self.run(ctx, input, state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::activity::{ActivityError, ActivityRegistry, FnActivity, error_type};
    use crate::workflow::tasks::test_support::{Harness, LANE, definition};
    use serde_json::json;

    fn registry() -> ActivityRegistry {
        let mut registry = ActivityRegistry::new();
        registry.register(
            LANE,
            FnActivity::new("unavailable", |_ctx, _input: Value| async move {
                Err(ActivityError::non_retryable(error_type::COMMUNICATION, "HTTP 503").with_status(503))
            }),
        );
        registry
    }

    #[tokio::test]
    async fn test_raised_error_is_bound_and_handled() {
        let def = definition(
            r#"
  - guarded:
      try:
        - fail:
            raise:
              error:
                type: validation
                status: 422
                title: bad input
      catch:
        errors:
          with: { type: validation }
        as: problem
        do:
          - recover:
              set: { recovered: "${ data.problem.status }" }
"#,
        );
        let h = Harness::new(def);
        let mut state = h.state(json!({}));
        h.run(&mut state).await.unwrap();
        assert_eq!(state.field("recovered"), Some(&json!(422)));
        assert_eq!(state.field_path("problem.title"), Some(&json!("bad input")));
    }

    #[tokio::test]
    async fn test_filter_mismatch_propagates() {
        let def = definition(
            r#"
  - guarded:
      try:
        - fail:
            raise:
              error: { type: timeout }
      catch:
        errors:
          with: { type: validation }
"#,
        );
        let h = Harness::new(def);
        let mut state = h.state(json!({}));
        let err = h.run(&mut state).await.unwrap_err();
        assert!(matches!(err, TaskError::Raised(ref e) if e.is_type("timeout")));
        assert_eq!(state.field("error"), None);
    }

    #[tokio::test]
    async fn test_when_and_except_when_see_the_error() {
        let def = definition(
            r#"
  - guarded:
      try:
        - fetch:
            call: unavailable
      catch:
        errors:
          with: { status: 503 }
        when: "${ data.error.status >= 500 }"
        exceptWhen: "${ data.error.status == 501 }"
"#,
        );
        let h = Harness::with_registry(def, registry());
        let mut state = h.state(json!({}));
        let out = h.run(&mut state).await.unwrap();
        assert_eq!(out["status"], json!(503));
        assert!(
            out["type"]
                .as_str()
                .is_some_and(|t| t.ends_with("/communication"))
        );
    }

    #[tokio::test]
    async fn test_finally_runs_after_success_and_failure() {
        let def = definition(
            r#"
  - guarded:
      try:
        - maybe:
            if: "${ input.fail }"
            raise:
              error: { type: runtime }
      finally:
        - cleanup:
            set: { cleaned: true }
"#,
        );
        let h = Harness::new(def);

        let mut ok = h.state(json!({ "fail": false }));
        h.run(&mut ok).await.unwrap();
        assert_eq!(ok.field("cleaned"), Some(&json!(true)));

        let mut failed = h.state(json!({ "fail": true }));
        assert!(h.run(&mut failed).await.is_err());
        assert_eq!(failed.field("cleaned"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_end_in_body_survives_finally() {
        let def = definition(
            r#"
  - guarded:
      try:
        - stop:
            set: { stopped: true }
            then: end
      finally:
        - cleanup:
            set: { cleaned: true }
  - after:
      set: { after: true }
"#,
        );
        let h = Harness::new(def);
        let mut state = h.state(json!({}));
        h.run(&mut state).await.unwrap();
        assert_eq!(state.field("cleaned"), Some(&json!(true)));
        assert_eq!(state.field("after"), None);
    }
}
