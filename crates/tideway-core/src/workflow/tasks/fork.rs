//! `fork`: run branches concurrently and join.
//!
//! Every branch runs on its own copy of the state (output cleared) inside a
//! `JoinSet`. Branch data never leaks back; only branch outputs are merged,
//! as `{ <branch>: <output> }` under the fork's name in the data namespace.
//!
//! - wait-for-all (default): with `failFast` the first failure aborts the
//!   remaining branches; without it every branch runs to completion. Either
//!   way the outputs of branches that completed are kept.
//! - `compete`: the first branch to finish wins and the rest are aborted;
//!   the output holds the winner alone.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::{Map, Value};
use tokio::task::JoinSet;

use tideway_types::workflow::{TaskKind, TaskNode};

use crate::workflow::state::ExecutionState;

use super::error::{BuildError, TaskError};
use super::factory::Builder;
use super::sequence::DoTask;
use super::{Executable, ExecutableUnit, RunContext};

struct Branch {
    name: String,
    body: Arc<DoTask>,
}

pub struct ForkTask {
    name: String,
    branches: Vec<Branch>,
    compete: bool,
    fail_fast: bool,
}

pub(crate) fn compile(builder: &Builder<'_>, node: &TaskNode) -> Result<ExecutableUnit, BuildError> {
    let TaskKind::Fork(spec) = &node.kind else {
        return Err(BuildError::InvalidTask {
            task: node.name.clone(),
            reason: "expected a fork task".to_string(),
        });
    };
    if spec.branches.is_empty() {
        return Err(BuildError::InvalidTask {
            task: node.name.clone(),
            reason: "fork needs at least one branch".to_string(),
        });
    }

    let prefix = format!("{}/", node.name);
    let branches = spec
        .branches
        .iter()
        .map(|branch| {
            Ok(Branch {
                name: branch.name.clone(),
                body: Arc::new(DoTask::single(builder, branch, &prefix)?),
            })
        })
        .collect::<Result<Vec<_>, BuildError>>()?;

    Ok(Arc::new(ForkTask {
        name: node.name.clone(),
        branches,
        compete: spec.compete,
        fail_fast: spec.fail_fast,
    }))
}

type BranchResult = (String, Result<Value, TaskError>);

impl ForkTask {
    fn spawn_all(&self, ctx: &RunContext, input: &Value, state: &ExecutionState) -> JoinSet<BranchResult> {
        let mut set = JoinSet::new();
        for branch in &self.branches {
            let name = branch.name.clone();
            let body = Arc::clone(&branch.body);
            let ctx = ctx.clone();
            let input = input.clone();
            let mut branch_state = state.branch();
            set.spawn(async move {
                let result = body.execute(&ctx, input, &mut branch_state).await;
                (name, result)
            });
        }
        set
    }

    async fn run(&self, ctx: &RunContext, input: Value, state: &mut ExecutionState) -> Result<Value, TaskError> {
        let mut set = self.spawn_all(ctx, &input, state);
        tracing::debug!(task = %self.name, branches = self.branches.len(), compete = self.compete, "fork started");

        let mut outputs = Map::new();
        let mut first_error: Option<TaskError> = None;

        while let Some(joined) = set.join_next().await {
            let (branch, result) = match joined {
                Ok(done) => done,
                Err(e) if e.is_cancelled() => continue,
                Err(e) => (
                    "<unknown>".to_string(),
                    Err(TaskError::runtime(&self.name, format!("fork branch panicked: {e}"))),
                ),
            };

            match result {
                Ok(output) if self.compete => {
                    set.abort_all();
                    tracing::debug!(task = %self.name, winner = %branch, "fork competition decided");
                    outputs.insert(branch, output);
                    let won = Value::Object(outputs);
                    state.set_field(self.name.clone(), won.clone());
                    return Ok(won);
                }
                Ok(output) => {
                    outputs.insert(branch, output);
                }
                Err(err) => {
                    tracing::warn!(task = %self.name, branch = %branch, error = %err, "fork branch failed");
                    let stop = self.compete || self.fail_fast || !err.is_catchable();
                    first_error.get_or_insert(err);
                    if stop {
                        set.abort_all();
                        break;
                    }
                }
            }
        }

        // Completed branches stay visible even when the fork fails.
        let merged = Value::Object(outputs);
        state.set_field(self.name.clone(), merged.clone());

        match first_error {
            Some(err) => Err(err),
            None => Ok(merged),
        }
    }
}

impl Executable for ForkTask {
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
