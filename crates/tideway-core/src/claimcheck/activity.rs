//! Offload and retrieval exposed as activities so that blob I/O happens
//! outside the deterministic workflow path.
//!
//! Both take and return a JSON object of state fields.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::substrate::activity::{
    ACTIVITY_CLAIM_CHECK_OFFLOAD, ACTIVITY_CLAIM_CHECK_RETRIEVE, Activity, ActivityContext, ActivityError,
    error_type,
};

use super::ClaimCheckManager;

fn fields(input: Value) -> Result<Map<String, Value>, ActivityError> {
    match input {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(ActivityError::non_retryable(
            error_type::VALIDATION,
            format!("claim-check activity expects an object of fields, got {other}"),
        )),
    }
}

pub struct ClaimCheckOffload {
    manager: Arc<ClaimCheckManager>,
}

impl ClaimCheckOffload {
    pub fn new(manager: Arc<ClaimCheckManager>) -> Self {
        Self { manager }
    }
}

impl Activity for ClaimCheckOffload {
    fn name(&self) -> &str {
        ACTIVITY_CLAIM_CHECK_OFFLOAD
    }

    async fn execute(&self, _ctx: ActivityContext, input: Value) -> Result<Value, ActivityError> {
        let data = fields(input)?;
        Ok(Value::Object(self.manager.maybe_offload_state(data).await))
    }
}

pub struct ClaimCheckRetrieve {
    manager: Arc<ClaimCheckManager>,
}

impl ClaimCheckRetrieve {
    pub fn new(manager: Arc<ClaimCheckManager>) -> Self {
        Self { manager }
    }
}

impl Activity for ClaimCheckRetrieve {
    fn name(&self) -> &str {
        ACTIVITY_CLAIM_CHECK_RETRIEVE
    }

    async fn execute(&self, _ctx: ActivityContext, input: Value) -> Result<Value, ActivityError> {
        let data = fields(input)?;
        Ok(Value::Object(self.manager.maybe_retrieve_state(data).await))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claimcheck::manager::tests::{CountingStore, enabled_config};
    use crate::claimcheck::store::BoxBlobStore;
    use crate::substrate::activity::{ActivityInfo, activity_id};
    use crate::substrate::run::RunMetadata;
    use chrono::Utc;
    use serde_json::json;
    use std::time::Duration;
    use tideway_types::claimcheck::ClaimCheckRef;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> ActivityContext {
        ActivityContext {
            info: ActivityInfo {
                activity_id: activity_id("t", Utc::now()),
                activity_type: ACTIVITY_CLAIM_CHECK_OFFLOAD.to_string(),
                task_queue: "q".to_string(),
                attempt: 1,
                scheduled_at: Utc::now(),
                start_to_close: Duration::from_secs(5),
                run: RunMetadata::new("wf", "ExecuteWorkflow", "q"),
            },
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_offload_then_retrieve_activity() {
        let manager = Arc::new(ClaimCheckManager::new(
            BoxBlobStore::new(CountingStore::default()),
            &enabled_config(16, true),
        ));
        let offload = ClaimCheckOffload::new(manager.clone());
        let retrieve = ClaimCheckRetrieve::new(manager);

        let input = json!({ "big": "b".repeat(64), "tiny": 1 });
        let out = offload.execute(ctx(), input.clone()).await.unwrap();
        assert!(ClaimCheckRef::is_ref(&out["big"]));
        assert_eq!(out["tiny"], json!(1));

        let back = retrieve.execute(ctx(), out).await.unwrap();
        assert_eq!(back, input);
    }

    #[tokio::test]
    async fn test_rejects_non_object_input() {
        let offload = ClaimCheckOffload::new(Arc::new(ClaimCheckManager::disabled()));
        let err = offload.execute(ctx(), json!([1, 2])).await.unwrap_err();
        assert!(err.non_retryable);
    }
}
