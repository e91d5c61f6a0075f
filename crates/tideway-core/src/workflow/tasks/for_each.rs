//! `for`: run a sequence once per collection item.
//!
//! `for.in` may be an array, an object or a whole-number count. Every
//! iteration runs on its own branch of the state with the item bound under
//! `each` (default `item`) and its index or key under `at` (default
//! `index`); nothing an iteration writes reaches the enclosing state.
//! `while` is checked before every iteration.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::{Map, Value};

use tideway_types::workflow::{FlowDirective, TaskKind, TaskNode};

use crate::workflow::state::ExecutionState;

use super::error::{BuildError, TaskError};
use super::factory::Builder;
use super::sequence::DoTask;
use super::{Executable, ExecutableUnit, RunContext, predicate, traverse};

const DEFAULT_EACH: &str = "item";
const DEFAULT_AT: &str = "index";

pub struct ForTask {
    name: String,
    each: String,
    at: String,
    collection: Value,
    while_: Option<String>,
    body: DoTask,
}

/// What `for.in` evaluated to.
enum Items {
    List(Vec<Value>),
    Keyed(Map<String, Value>),
}

pub(crate) fn compile(builder: &Builder<'_>, node: &TaskNode) -> Result<ExecutableUnit, BuildError> {
    let TaskKind::For(spec) = &node.kind else {
        return Err(BuildError::InvalidTask {
            task: node.name.clone(),
            reason: "expected a for task".to_string(),
        });
    };
    Ok(Arc::new(ForTask {
        name: node.name.clone(),
        each: spec.for_.each.clone().unwrap_or_else(|| DEFAULT_EACH.to_string()),
        at: spec.for_.at.clone().unwrap_or_else(|| DEFAULT_AT.to_string()),
        collection: spec.for_.in_.clone(),
        while_: spec.while_.clone(),
        body: builder.sequence(&node.name, &spec.do_, &format!("{}/", node.name), false)?,
    }))
}

impl ForTask {
    fn items(&self, state: &ExecutionState) -> Result<Items, TaskError> {
        match traverse(&self.name, &self.collection, &state.expression_context())? {
            Value::Array(items) => Ok(Items::List(items)),
            Value::Null => Ok(Items::List(Vec::new())),
            Value::Object(map) => Ok(Items::Keyed(map)),
            Value::Number(n) => {
                let count = n
                    .as_i64()
                    .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                    .ok_or_else(|| {
                        TaskError::runtime(&self.name, format!("for.in count must be a whole number, got {n}"))
                    })?;
                Ok(Items::List((0..count.max(0)).map(Value::from).collect()))
            }
            other => Err(TaskError::runtime(
                &self.name,
                format!("for.in must evaluate to an array, object or count, got {other}"),
            )),
        }
    }

    /// Run one iteration on its own branch. `None` means `while` stopped the
    /// loop before the body ran.
    async fn iterate(
        &self,
        ctx: &RunContext,
        state: &ExecutionState,
        key: Value,
        item: Value,
        ended: &mut bool,
    ) -> Result<Option<Value>, TaskError> {
        let mut scope = state.branch();
        scope.set_field(self.at.clone(), key);
        scope.set_field(self.each.clone(), item.clone());

        if let Some(cond) = &self.while_
            && !predicate(&self.name, cond, &scope.expression_context())?
        {
            tracing::debug!(task = %self.name, "while condition false, leaving loop");
            return Ok(None);
        }

        let out = self.body.execute(ctx, item, &mut scope).await?;
        *ended = matches!(scope.take_directive(), Some(FlowDirective::End));
        Ok(Some(out))
    }

    async fn run(&self, ctx: &RunContext, state: &mut ExecutionState) -> Result<Value, TaskError> {
        let mut ended = false;
        let output = match self.items(state)? {
            Items::List(items) => {
                let mut outputs = Vec::with_capacity(items.len());
                for (index, item) in items.into_iter().enumerate() {
                    match self.iterate(ctx, state, Value::from(index), item, &mut ended).await? {
                        Some(out) => outputs.push(out),
                        None => break,
                    }
                    if ended {
                        break;
                    }
                }
                Value::Array(outputs)
            }
            Items::Keyed(map) => {
                let mut outputs = Map::with_capacity(map.len());
                for (key, item) in map {
                    match self.iterate(ctx, state, Value::String(key.clone()), item, &mut ended).await? {
                        Some(out) => {
                            outputs.insert(key, out);
                        }
                        None => break,
                    }
                    if ended {
                        break;
                    }
                }
                Value::Object(outputs)
            }
        };

        if ended {
            state.set_directive(FlowDirective::End);
        }
        Ok(output)
    }
}

impl Executable for ForTask {
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
    use crate::workflow::tasks::test_support::{Harness, definition};
    use serde_json::json;

    #[tokio::test]
    async fn test_iterates_array_with_item_and_index() {
        let def = definition(
            r#"
  - init:
      set: { base: 10 }
  - sum:
      for:
        each: n
        in: "${ input.numbers }"
        at: i
      do:
        - add:
            set: { total: "${ data.base + data.n }", position: "${ data.i }" }
"#,
        );
        let h = Harness::new(def);
        let mut state = h.state(json!({ "numbers": [1, 2, 3] }));
        h.run(&mut state).await.unwrap();
        assert_eq!(
            state.field("sum"),
            Some(&json!([
                { "total": 11, "position": 0 },
                { "total": 12, "position": 1 },
                { "total": 13, "position": 2 }
            ]))
        );
        // Iteration bindings and writes stay inside each iteration.
        assert_eq!(state.field("n"), None);
        assert_eq!(state.field("i"), None);
        assert_eq!(state.field("total"), None);
        assert_eq!(state.field("base"), Some(&json!(10)));
    }

    #[tokio::test]
    async fn test_integer_count_iterates_that_many_times() {
        let def = definition(
            "\n  - loop:\n      for: { in: \"${ input.n }\" }\n      do:\n        - x:\n            set: { y: \"${ data.item * 2 }\" }\n",
        );
        let h = Harness::new(def);
        let mut state = h.state(json!({ "n": 3 }));
        h.run(&mut state).await.unwrap();
        assert_eq!(state.field("loop"), Some(&json!([{ "y": 0 }, { "y": 2 }, { "y": 4 }])));
    }

    #[tokio::test]
    async fn test_object_input_produces_keyed_output() {
        let def = definition(
            r#"
  - loop:
      for:
        in: { a: 1, b: 2 }
      do:
        - x:
            set: { key: "${ data.index }", y: "${ data.item }" }
"#,
        );
        let h = Harness::new(def);
        let mut state = h.state(json!({}));
        h.run(&mut state).await.unwrap();
        assert_eq!(
            state.field("loop"),
            Some(&json!({ "a": { "key": "a", "y": 1 }, "b": { "key": "b", "y": 2 } }))
        );
    }

    #[tokio::test]
    async fn test_loop_keeps_existing_fields_named_like_bindings() {
        let def = definition(
            r#"
  - keep:
      set: { item: keep }
  - loop:
      for: { in: "${ [1, 2] }" }
      do:
        - x:
            set: { y: "${ data.item }" }
"#,
        );
        let h = Harness::new(def);
        let mut state = h.state(json!({}));
        h.run(&mut state).await.unwrap();
        assert_eq!(state.field("item"), Some(&json!("keep")));
        assert_eq!(state.field("y"), None);
        assert_eq!(state.field("loop"), Some(&json!([{ "y": 1 }, { "y": 2 }])));
    }

    #[tokio::test]
    async fn test_while_stops_early() {
        let def = definition(
            r#"
  - loop:
      for:
        in: "${ [1, 2, 3, 4, 5] }"
      while: "${ data.item < 3 }"
      do:
        - echo:
            set: { seen: "${ data.item }" }
"#,
        );
        let h = Harness::new(def);
        let mut state = h.state(json!({}));
        h.run(&mut state).await.unwrap();
        assert_eq!(state.field("loop"), Some(&json!([{ "seen": 1 }, { "seen": 2 }])));
    }

    #[tokio::test]
    async fn test_non_iterable_is_an_error() {
        let def = definition(
            "\n  - loop:\n      for: { in: \"${ input.n }\" }\n      do:\n        - x:\n            set: { y: 1 }\n",
        );
        let h = Harness::new(def);
        for bad in [json!({ "n": "three" }), json!({ "n": 1.5 }), json!({ "n": true })] {
            let mut state = h.state(bad);
            assert!(h.run(&mut state).await.is_err());
        }
    }
}
