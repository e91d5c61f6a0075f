//! `do`: ordered task sequence with flow control.
//!
//! The sequence is where per-task semantics live:
//! - `if` guards skip a task without running it
//! - `output.as` reshapes a task's output, which is then stored under the
//!   task's name; `export.as` writes into `context`
//! - `then` (or a switch decision) continues, exits, ends or jumps
//! - oversized data fields are offloaded after each task
//! - the root sequence decides when to continue as new

use std::collections::HashSet;

use futures_util::future::BoxFuture;
use serde_json::Value;

use tideway_types::workflow::{FlowDirective, METADATA_CAN_MAX_HISTORY_LENGTH, TaskKind, TaskList, TaskNode};

use crate::workflow::state::ExecutionState;

use super::error::{BuildError, TaskError};
use super::factory::Builder;
use super::{Executable, ExecutableUnit, RunContext, context_with_output, offload_oversized, predicate, traverse};

struct Step {
    /// `<prefix><name>-<index>`; the resume point after continue-as-new.
    id: String,
    name: String,
    guard: Option<String>,
    then: Option<FlowDirective>,
    output_as: Option<Value>,
    export_as: Option<Value>,
    /// Nested sequences are entered even while skipping towards the resume
    /// point, since the resume point may lie inside them.
    never_skip: bool,
    unit: ExecutableUnit,
}

pub struct DoTask {
    name: String,
    steps: Vec<Step>,
    root: bool,
    /// Document-level `canMaxHistoryLength`, overriding the engine limit.
    can_max_history: Option<u64>,
}

pub(crate) fn compile(builder: &Builder<'_>, node: &TaskNode) -> Result<ExecutableUnit, BuildError> {
    let TaskKind::Do(tasks) = &node.kind else {
        return Err(BuildError::InvalidTask {
            task: node.name.clone(),
            reason: "expected a do task".to_string(),
        });
    };
    Ok(std::sync::Arc::new(builder.sequence(&node.name, tasks, &format!("{}/", node.name), false)?))
}

impl DoTask {
    pub(crate) fn build(
        builder: &Builder<'_>,
        name: &str,
        tasks: &TaskList,
        id_prefix: &str,
        root: bool,
    ) -> Result<Self, BuildError> {
        let names: HashSet<&str> = tasks.iter().map(|t| t.name.as_str()).collect();
        if names.len() != tasks.len() {
            let mut seen = HashSet::new();
            let dup = tasks
                .iter()
                .find(|t| !seen.insert(t.name.as_str()))
                .map(|t| t.name.clone())
                .unwrap_or_default();
            return Err(BuildError::DuplicateTaskName { task: dup });
        }

        let check_target = |task: &str, directive: &FlowDirective| match directive {
            FlowDirective::Goto(target) if !names.contains(target.as_str()) => Err(BuildError::UnknownGotoTarget {
                task: task.to_string(),
                target: target.clone(),
            }),
            _ => Ok(()),
        };

        let mut steps = Vec::with_capacity(tasks.len());
        for (index, node) in tasks.iter().enumerate() {
            if let Some(then) = &node.base.then {
                check_target(&node.name, then)?;
            }
            if let TaskKind::Switch(cases) = &node.kind {
                for case in cases {
                    check_target(&node.name, &case.then)?;
                }
            }

            let id = format!("{id_prefix}{}-{index}", node.name);
            // Nested sequences get the step id as prefix.
            let unit = match &node.kind {
                TaskKind::Do(inner) => {
                    std::sync::Arc::new(builder.sequence(&node.name, inner, &format!("{id}/"), false)?) as ExecutableUnit
                }
                _ => builder.build(node)?,
            };
            steps.push(Step {
                never_skip: matches!(node.kind, TaskKind::Do(_)),
                id,
                name: node.name.clone(),
                guard: node.base.if_.clone(),
                then: node.base.then.clone(),
                output_as: node.base.output.as_ref().map(|t| t.as_.clone()),
                export_as: node.base.export.as_ref().map(|t| t.as_.clone()),
                unit,
            });
        }

        let can_max_history = if root {
            builder
                .definition()
                .metadata(METADATA_CAN_MAX_HISTORY_LENGTH)
                .and_then(Value::as_u64)
        } else {
            None
        };

        Ok(Self {
            name: name.to_string(),
            steps,
            root,
            can_max_history,
        })
    }

    /// Wrap a single task as a one-step sequence (fork branches).
    pub(crate) fn single(builder: &Builder<'_>, node: &TaskNode, id_prefix: &str) -> Result<Self, BuildError> {
        Self::build(builder, &node.name, &TaskList(vec![node.clone()]), id_prefix, false)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    fn should_continue_as_new(&self, ctx: &RunContext) -> bool {
        if ctx.substrate.continue_as_new_suggested(&ctx.run) {
            return true;
        }
        let limit = self.can_max_history.unwrap_or(ctx.max_history_length);
        limit > 0 && ctx.substrate.history_length(&ctx.run) > limit
    }

    async fn run(&self, ctx: &RunContext, input: Value, state: &mut ExecutionState) -> Result<Value, TaskError> {
        let mut index = 0;
        let mut current = input;
        let mut executed = 0usize;

        while let Some(step) = self.steps.get(index) {
            if ctx.substrate.is_cancelled(&ctx.run) {
                return Err(TaskError::Cancelled);
            }

            if let Some(resume) = state.resume_from() {
                if resume == step.id {
                    tracing::info!(task = %step.name, id = %step.id, "resuming after continue-as-new");
                    state.clear_resume();
                } else if !step.never_skip {
                    index += 1;
                    continue;
                }
            } else if self.root && executed > 0 && self.should_continue_as_new(ctx) {
                tracing::info!(
                    workflow = %self.name,
                    next = %step.id,
                    history = ctx.substrate.history_length(&ctx.run),
                    "continuing as new"
                );
                return Err(TaskError::ContinueAsNew(Box::new(state.snapshot(step.id.clone()))));
            }

            // Guards were already evaluated by the run that got here.
            if let Some(guard) = step.guard.as_ref().filter(|_| state.resume_from().is_none()) {
                if !predicate(&step.name, guard, &state.expression_context())? {
                    tracing::debug!(task = %step.name, "guard false, skipping");
                    index += 1;
                    continue;
                }
            }

            let was_resuming = state.resume_from().is_some();
            tracing::debug!(task = %step.name, id = %step.id, "task starting");
            let raw = step.unit.execute(ctx, current.clone(), state).await?;
            executed += 1;

            // A nested sequence that only skipped produced nothing new.
            if was_resuming && state.resume_from().is_some() {
                index += 1;
                continue;
            }

            let output = match &step.output_as {
                Some(template) => traverse(&step.name, template, &context_with_output(state, &raw))?,
                None => raw,
            };
            state.set_output(output.clone());
            state.set_field(step.name.clone(), output.clone());
            if let Some(template) = &step.export_as {
                let exported = traverse(&step.name, template, &context_with_output(state, &output))?;
                state.export(step.name.clone(), exported);
            }
            offload_oversized(ctx, &step.name, state).await;
            current = output;

            let directive = state.take_directive().or_else(|| step.then.clone());
            match directive {
                None | Some(FlowDirective::Continue) => index += 1,
                Some(FlowDirective::Exit) => {
                    tracing::debug!(task = %step.name, sequence = %self.name, "exit");
                    break;
                }
                Some(FlowDirective::End) => {
                    tracing::debug!(task = %step.name, "end");
                    // Propagates up through every enclosing sequence.
                    state.set_directive(FlowDirective::End);
                    return Ok(current);
                }
                Some(FlowDirective::Goto(target)) => match self.steps.iter().position(|s| s.name == target) {
                    Some(next) => index = next,
                    None => return Err(TaskError::runtime(&step.name, format!("unknown jump target '{target}'"))),
                },
            }
        }

        Ok(current)
    }
}

impl std::fmt::Debug for DoTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DoTask")
            .field("name", &self.name)
            .field("steps", &self.steps.iter().map(|s| s.id.as_str()).collect::<Vec<_>>())
            .field("root", &self.root)
            .finish()
    }
}

impl Executable for DoTask {
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
    use crate::workflow::tasks::TaskFactory;
    use crate::workflow::tasks::test_support::{Harness, definition};
    use serde_json::json;

    #[tokio::test]
    async fn test_sequential_set_and_output_chain() {
        let def = definition(
            r#"
  - first:
      set: { a: 1 }
  - second:
      set: { b: "${ data.a + 1 }" }
      output:
        as: "${ output.b * 10 }"
  - third:
      set: { c: "${ output }" }
"#,
        );
        let h = Harness::new(def);
        let mut state = h.state(json!({}));
        h.run(&mut state).await.unwrap();
        assert_eq!(state.field("a"), Some(&json!(1)));
        assert_eq!(state.field("b"), Some(&json!(2)));
        assert_eq!(state.field("c"), Some(&json!(20)));
    }

    #[tokio::test]
    async fn test_output_stored_under_task_name() {
        let def = definition(
            r#"
  - mk:
      set: { a: 1 }
  - shaped:
      set: { b: 2 }
      output:
        as: "${ output.b + data.a }"
  - group:
      do:
        - inner:
            set: { c: 3 }
"#,
        );
        let h = Harness::new(def);
        let mut state = h.state(json!({}));
        h.run(&mut state).await.unwrap();
        assert_eq!(state.field("a"), Some(&json!(1)));
        assert_eq!(state.field("mk"), Some(&json!({ "a": 1 })));
        assert_eq!(state.field("shaped"), Some(&json!(3)));
        assert_eq!(state.field("inner"), Some(&json!({ "c": 3 })));
        assert_eq!(state.field("group"), Some(&json!({ "c": 3 })));
    }

    #[tokio::test]
    async fn test_guard_skips_task() {
        let def = definition(
            r#"
  - maybe:
      if: "${ input.enabled }"
      set: { ran: true }
  - always:
      set: { done: true }
"#,
        );
        let h = Harness::new(def);
        let mut state = h.state(json!({ "enabled": false }));
        h.run(&mut state).await.unwrap();
        assert_eq!(state.field("ran"), None);
        assert_eq!(state.field("done"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_export_writes_context() {
        let def = definition(
            r#"
  - fetch:
      set: { user: { id: 7 } }
      export:
        as: "${ output.user.id }"
  - use:
      set: { copied: "${ context.fetch }" }
"#,
        );
        let h = Harness::new(def);
        let mut state = h.state(json!({}));
        h.run(&mut state).await.unwrap();
        assert_eq!(state.context().get("fetch"), Some(&json!(7)));
        assert_eq!(state.field("copied"), Some(&json!(7)));
    }

    #[tokio::test]
    async fn test_then_end_and_goto() {
        let def = definition(
            r#"
  - start:
      set: { n: 0 }
  - bump:
      set: { n: "${ data.n + 1 }" }
  - check:
      switch:
        - again:
            when: "${ data.n < 3 }"
            then: bump
        - stop:
            then: finish
  - skipped:
      set: { skipped: true }
  - finish:
      set: { finished: true }
      then: end
  - after:
      set: { after: true }
"#,
        );
        let h = Harness::new(def);
        let mut state = h.state(json!({}));
        h.run(&mut state).await.unwrap();
        assert_eq!(state.field("n"), Some(&json!(3)));
        assert_eq!(state.field("skipped"), None);
        assert_eq!(state.field("finished"), Some(&json!(true)));
        assert_eq!(state.field("after"), None);
    }

    #[tokio::test]
    async fn test_end_inside_nested_do_stops_parent() {
        let def = definition(
            r#"
  - outer:
      do:
        - inner:
            set: { inner: true }
            then: end
  - after:
      set: { after: true }
"#,
        );
        let h = Harness::new(def);
        let mut state = h.state(json!({}));
        h.run(&mut state).await.unwrap();
        assert_eq!(state.field("inner"), Some(&json!({ "inner": true })));
        assert_eq!(state.field("after"), None);
    }

    #[tokio::test]
    async fn test_exit_only_leaves_nested_do() {
        let def = definition(
            r#"
  - outer:
      do:
        - inner:
            set: { inner: true }
            then: exit
        - unreachable:
            set: { unreachable: true }
  - after:
      set: { after: true }
"#,
        );
        let h = Harness::new(def);
        let mut state = h.state(json!({}));
        h.run(&mut state).await.unwrap();
        assert_eq!(state.field("unreachable"), None);
        assert_eq!(state.field("after"), Some(&json!({ "after": true })));
    }

    #[tokio::test]
    async fn test_continue_as_new_snapshots_and_resumes() {
        let def = definition(
            r#"
  - one:
      set: { a: 1 }
  - two:
      set: { b: 2 }
  - three:
      set: { c: 3 }
"#,
        );
        // The substrate suggests continue-as-new from the start; the root
        // sequence still runs one task first, then snapshots before `two`.
        let h = Harness::new(def).suggest_continue_as_new();
        let mut state = h.state(json!({}));
        let err = h.run(&mut state).await.unwrap_err();
        let TaskError::ContinueAsNew(snapshot) = err else {
            panic!("expected continue-as-new, got {err}");
        };
        assert_eq!(snapshot.resume_from, "two-1");
        assert_eq!(snapshot.data.get("a"), Some(&json!(1)));
        assert_eq!(snapshot.data.get("one"), Some(&json!({ "a": 1 })));

        let h = h.without_suggestion();
        let mut resumed = ExecutionState::restore(json!({}), Default::default(), *snapshot);
        h.run(&mut resumed).await.unwrap();
        assert_eq!(resumed.field("b"), Some(&json!(2)));
        assert_eq!(resumed.field("c"), Some(&json!(3)));
        assert_eq!(resumed.field("a"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_duplicate_names_rejected() {
        let def = definition("\n  - a:\n      set: { x: 1 }\n  - a:\n      set: { x: 2 }\n");
        let err = TaskFactory::new().build_workflow(&def).unwrap_err();
        assert!(matches!(err, BuildError::DuplicateTaskName { ref task } if task == "a"));
    }
}
