//! `switch`: pick the first matching case and hand its directive to the
//! enclosing sequence. A case without `when` is the default and only
//! applies when nothing else matched.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;

use tideway_types::workflow::{FlowDirective, TaskKind, TaskNode};

use crate::workflow::state::ExecutionState;

use super::error::{BuildError, TaskError};
use super::factory::Builder;
use super::{Executable, ExecutableUnit, RunContext, predicate};

struct Case {
    name: String,
    when: String,
    then: FlowDirective,
}

pub struct SwitchTask {
    name: String,
    cases: Vec<Case>,
    default: Option<(String, FlowDirective)>,
}

pub(crate) fn compile(_builder: &Builder<'_>, node: &TaskNode) -> Result<ExecutableUnit, BuildError> {
    let TaskKind::Switch(entries) = &node.kind else {
        return Err(BuildError::InvalidTask {
            task: node.name.clone(),
            reason: "expected a switch task".to_string(),
        });
    };

    let mut cases = Vec::with_capacity(entries.len());
    let mut default = None;
    for case in entries {
        match &case.when {
            Some(when) => cases.push(Case {
                name: case.name.clone(),
                when: when.clone(),
                then: case.then.clone(),
            }),
            None if default.is_some() => {
                return Err(BuildError::MultipleDefaults {
                    task: node.name.clone(),
                });
            }
            None => default = Some((case.name.clone(), case.then.clone())),
        }
    }

    Ok(Arc::new(SwitchTask {
        name: node.name.clone(),
        cases,
        default,
    }))
}

impl SwitchTask {
    fn decide(&self, state: &ExecutionState) -> Result<Option<(&str, &FlowDirective)>, TaskError> {
        let context = state.expression_context();
        for case in &self.cases {
            if predicate(&self.name, &case.when, &context)? {
                return Ok(Some((&case.name, &case.then)));
            }
        }
        Ok(self.default.as_ref().map(|(name, then)| (name.as_str(), then)))
    }
}

impl Executable for SwitchTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute<'a>(
        &'a self,
        _ctx: &'a RunContext,
        input: Value,
        state: &'a mut ExecutionState,
    ) -> BoxFuture<'a, Result<Value, TaskError>> {
        Box::pin(async move {
            match self.decide(state)? {
                Some((case, then)) => {
                    tracing::debug!(task = %self.name, case, then = ?then, "switch matched");
                    state.set_directive(then.clone());
                }
                None => tracing::debug!(task = %self.name, "no switch case matched"),
            }
            // Switch is transparent to the data flow.
            Ok(input)
        })
    }
}
