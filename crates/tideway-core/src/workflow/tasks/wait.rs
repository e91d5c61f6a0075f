//! `wait`: durable timer through the substrate.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::Value;

use tideway_types::workflow::{TaskKind, TaskNode};

use crate::workflow::state::ExecutionState;

use super::error::{BuildError, TaskError};
use super::factory::Builder;
use super::{Executable, ExecutableUnit, RunContext};

pub struct WaitTask {
    name: String,
    duration: Duration,
}

pub(crate) fn compile(_builder: &Builder<'_>, node: &TaskNode) -> Result<ExecutableUnit, BuildError> {
    let TaskKind::Wait(spec) = &node.kind else {
        return Err(BuildError::InvalidTask {
            task: node.name.clone(),
            reason: "expected a wait task".to_string(),
        });
    };
    let duration = spec.to_duration().map_err(|e| BuildError::InvalidTask {
        task: node.name.clone(),
        reason: format!("wait: {e}"),
    })?;
    Ok(Arc::new(WaitTask {
        name: node.name.clone(),
        duration,
    }))
}

impl Executable for WaitTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute<'a>(
        &'a self,
        ctx: &'a RunContext,
        input: Value,
        _state: &'a mut ExecutionState,
    ) -> BoxFuture<'a, Result<Value, TaskError>> {
        Box::pin(async move {
            tracing::debug!(task = %self.name, duration_ms = self.duration.as_millis() as u64, "waiting");
            ctx.substrate
                .sleep(&ctx.run, self.duration)
                .await
                .map_err(|e| TaskError::substrate(&self.name, e))?;
            Ok(input)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::tasks::TaskFactory;
    use crate::workflow::tasks::test_support::{EXECUTION_ID, Harness, definition};
    use serde_json::json;

    #[tokio::test]
    async fn test_wait_sleeps_then_continues() {
        let def = definition("\n  - pause:\n      wait: { milliseconds: 20 }\n  - after:\n      set: { done: true }\n");
        let h = Harness::new(def);
        let mut state = h.state(json!({}));
        let started = std::time::Instant::now();
        h.run(&mut state).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(state.field("done"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_cancellation_unblocks_wait() {
        let def = definition("\n  - pause:\n      wait: PT1H\n");
        let h = Harness::new(def);
        let substrate = Arc::clone(&h.substrate);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            substrate.cancel(EXECUTION_ID);
        });
        let mut state = h.state(json!({}));
        let err = h.run(&mut state).await.unwrap_err();
        assert!(matches!(err, TaskError::Cancelled));
    }

    #[test]
    fn test_invalid_duration_is_a_build_error() {
        let def = definition("\n  - pause:\n      wait: soon\n");
        assert!(TaskFactory::new().build_workflow(&def).is_err());
    }
}
