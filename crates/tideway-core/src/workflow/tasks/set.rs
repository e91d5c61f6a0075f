//! `set`: evaluate a mapping and merge it into the data namespace.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;

use tideway_types::workflow::{TaskKind, TaskNode};

use crate::workflow::state::ExecutionState;

use super::error::{BuildError, TaskError};
use super::factory::Builder;
use super::{Executable, ExecutableUnit, RunContext, traverse};

pub struct SetTask {
    name: String,
    values: Value,
}

pub(crate) fn compile(_builder: &Builder<'_>, node: &TaskNode) -> Result<ExecutableUnit, BuildError> {
    let TaskKind::Set(values) = &node.kind else {
        return Err(BuildError::InvalidTask {
            task: node.name.clone(),
            reason: "expected a set task".to_string(),
        });
    };
    if !(values.is_object() || values.is_string()) {
        return Err(BuildError::InvalidTask {
            task: node.name.clone(),
            reason: "set must be a mapping or a runtime expression".to_string(),
        });
    }
    Ok(Arc::new(SetTask {
        name: node.name.clone(),
        values: values.clone(),
    }))
}

impl SetTask {
    fn apply(&self, state: &mut ExecutionState) -> Result<Value, TaskError> {
        let result = traverse(&self.name, &self.values, &state.expression_context())?;
        match &result {
            Value::Object(map) => state.add_data(map.clone()),
            other => {
                return Err(TaskError::runtime(
                    &self.name,
                    format!("set must produce an object, got {other}"),
                ));
            }
        }
        Ok(result)
    }
}

impl Executable for SetTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute<'a>(
        &'a self,
        _ctx: &'a RunContext,
        _input: Value,
        state: &'a mut ExecutionState,
    ) -> BoxFuture<'a, Result<Value, TaskError>> {
        Box::pin(async move { self.apply(state) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::tasks::test_support::{Harness, definition};
    use serde_json::json;

    #[tokio::test]
    async fn test_set_evaluates_nested_expressions() {
        let def = definition(
            r#"
  - init:
      set:
        user:
          name: "${ input.name|upper }"
          tags: ["${ input.tag }", fixed]
        count: 3
"#,
        );
        let h = Harness::new(def);
        let mut state = h.state(json!({ "name": "ada", "tag": "x" }));
        let out = h.run(&mut state).await.unwrap();
        assert_eq!(out["count"], json!(3));
        assert_eq!(state.field_path("user.name"), Some(&json!("ADA")));
        assert_eq!(state.field_path("user.tags.1"), Some(&json!("fixed")));
    }

    #[tokio::test]
    async fn test_set_from_expression_must_be_object() {
        let def = definition("\n  - bad:\n      set: \"${ input.n }\"\n");
        let h = Harness::new(def);
        let mut state = h.state(json!({ "n": 5 }));
        let err = h.run(&mut state).await.unwrap_err();
        assert!(err.to_string().contains("set must produce an object"), "got {err}");
    }

    #[tokio::test]
    async fn test_later_set_replaces_field() {
        let def = definition("\n  - a:\n      set: { x: 1 }\n  - b:\n      set: { x: 2 }\n");
        let h = Harness::new(def);
        let mut state = h.state(json!({}));
        h.run(&mut state).await.unwrap();
        assert_eq!(state.field("x"), Some(&json!(2)));
    }
}
