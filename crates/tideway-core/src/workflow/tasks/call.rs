//! `call`: dispatch an activity through the substrate.
//!
//! `call: http` and `call: grpc` go to the built-in `CallHTTP` / `CallGRPC`
//! activities; any other name is looked up as a registered function
//! activity. Arguments are evaluated right before dispatch, against a
//! context in which claim-check references are resolved.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;

use tideway_types::workflow::{TaskKind, TaskNode};

use crate::substrate::activity::{ACTIVITY_CALL_GRPC, ACTIVITY_CALL_HTTP, ActivityRequest};
use crate::workflow::options::ActivityOptions;
use crate::workflow::state::ExecutionState;

use super::error::{BuildError, TaskError};
use super::factory::Builder;
use super::{Executable, ExecutableUnit, RunContext, resolved_context, traverse};

pub struct CallTask {
    name: String,
    activity_type: String,
    arguments: Value,
    options: ActivityOptions,
}

pub(crate) fn compile(builder: &Builder<'_>, node: &TaskNode) -> Result<ExecutableUnit, BuildError> {
    let invalid = |e: serde_json::Error| BuildError::InvalidTask {
        task: node.name.clone(),
        reason: e.to_string(),
    };
    let (activity_type, arguments) = match &node.kind {
        TaskKind::CallHttp(args) => (ACTIVITY_CALL_HTTP.to_string(), serde_json::to_value(args).map_err(invalid)?),
        TaskKind::CallGrpc(args) => (ACTIVITY_CALL_GRPC.to_string(), serde_json::to_value(args).map_err(invalid)?),
        TaskKind::CallFunction { function, with } => (function.clone(), with.clone()),
        _ => {
            return Err(BuildError::InvalidTask {
                task: node.name.clone(),
                reason: "expected a call task".to_string(),
            });
        }
    };
    Ok(Arc::new(CallTask {
        name: node.name.clone(),
        activity_type,
        arguments,
        options: builder.activity_options(node)?,
    }))
}

impl CallTask {
    async fn run(&self, ctx: &RunContext, state: &mut ExecutionState) -> Result<Value, TaskError> {
        let context = resolved_context(ctx, &self.name, state).await?;
        let input = traverse(&self.name, &self.arguments, &context)?;

        if ctx.substrate.is_cancelled(&ctx.run) {
            return Err(TaskError::Cancelled);
        }

        tracing::debug!(task = %self.name, activity = %self.activity_type, "dispatching call");
        let request = ActivityRequest::new(&self.activity_type, &self.name, input, self.options.clone());
        let result = ctx
            .substrate
            .execute_activity(&ctx.run, request)
            .await
            .map_err(|e| TaskError::activity(&self.name, e))?;

        state.set_field(self.name.clone(), result.clone());
        Ok(result)
    }
}

impl Executable for CallTask {
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
            FnActivity::new(ACTIVITY_CALL_HTTP, |_ctx, input: Value| async move { Ok(input) }),
        );
        registry.register(
            LANE,
            FnActivity::new("double", |_ctx, input: Value| async move {
                Ok(json!(input["n"].as_i64().unwrap_or(0) * 2))
            }),
        );
        registry.register(
            LANE,
            FnActivity::new("reject", |_ctx, _input: Value| async move {
                Err(ActivityError::non_retryable(error_type::VALIDATION, "nope").with_status(422))
            }),
        );
        registry
    }

    #[tokio::test]
    async fn test_http_arguments_are_evaluated_before_dispatch() {
        let def = definition(
            r#"
  - fetch:
      call: http
      with:
        method: get
        endpoint: "${ 'https://api.test/users/' + input.id }"
        headers:
          x-org: "${ env.__org_id }"
"#,
        );
        let h = Harness::with_registry(def, registry());
        let mut state = h.state(json!({ "id": "42" }));
        let out = h.run(&mut state).await.unwrap();
        assert_eq!(out["endpoint"], json!("https://api.test/users/42"));
        assert_eq!(out["method"], json!("get"));
        assert_eq!(state.field("fetch"), Some(&out));
    }

    #[tokio::test]
    async fn test_function_call_result_lands_in_data() {
        let def = definition(
            r#"
  - seed:
      set: { n: 21 }
  - compute:
      call: double
      with: { n: "${ data.n }" }
"#,
        );
        let h = Harness::with_registry(def, registry());
        let mut state = h.state(json!({}));
        h.run(&mut state).await.unwrap();
        assert_eq!(state.field("compute"), Some(&json!(42)));
    }

    #[tokio::test]
    async fn test_activity_failure_surfaces_as_task_error() {
        let def = definition("\n  - check:\n      call: reject\n");
        let h = Harness::with_registry(def, registry());
        let mut state = h.state(json!({}));
        let err = h.run(&mut state).await.unwrap_err();
        match err {
            TaskError::Activity { task, source } => {
                assert_eq!(task, "check");
                assert_eq!(source.status, Some(422));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn test_unregistered_function_fails_without_retry() {
        let def = definition("\n  - ghost:\n      call: missing\n");
        let h = Harness::with_registry(def, registry());
        let mut state = h.state(json!({}));
        let err = h.run(&mut state).await.unwrap_err();
        assert!(err.to_string().contains("not registered"), "got {err}");
    }
}
