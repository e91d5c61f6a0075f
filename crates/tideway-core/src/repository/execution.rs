//! Typed access to execution records on top of a [`BoxResourceStore`].

use tideway_types::error::RepositoryError;
use tideway_types::execution::WorkflowExecution;
use uuid::Uuid;

use super::resource::{BoxResourceStore, ResourceKind};

#[derive(Debug, Clone)]
pub struct ExecutionRepository {
    store: BoxResourceStore,
}

impl ExecutionRepository {
    pub fn new(store: BoxResourceStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &BoxResourceStore {
        &self.store
    }

    pub async fn get(&self, id: &Uuid) -> Result<Option<WorkflowExecution>, RepositoryError> {
        let Some(bytes) = self
            .store
            .get(ResourceKind::WorkflowExecution, &id.to_string())
            .await?
        else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| RepositoryError::Query(format!("corrupt execution record {id}: {e}")))
    }

    pub async fn put(&self, execution: &WorkflowExecution) -> Result<(), RepositoryError> {
        let bytes = serde_json::to_vec(execution).map_err(|e| RepositoryError::Query(e.to_string()))?;
        self.store
            .put(ResourceKind::WorkflowExecution, &execution.id.to_string(), bytes)
            .await
    }

    /// All executions, oldest first. Records that fail to decode are skipped.
    pub async fn list(&self) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        let rows = self.store.list(ResourceKind::WorkflowExecution).await?;
        let mut out: Vec<WorkflowExecution> = rows
            .into_iter()
            .filter_map(|(id, bytes)| match serde_json::from_slice(&bytes) {
                Ok(exec) => Some(exec),
                Err(e) => {
                    tracing::warn!(execution_id = %id, error = %e, "skipping undecodable execution record");
                    None
                }
            })
            .collect();
        out.sort_by_key(|e: &WorkflowExecution| e.created_at);
        Ok(out)
    }

    pub async fn delete(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        self.store
            .delete(ResourceKind::WorkflowExecution, &id.to_string())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryResourceStore;
    use serde_json::json;
    use tideway_types::execution::{ExecutionPhase, ExecutionSpec};

    #[tokio::test]
    async fn test_put_get_list() {
        let repo = ExecutionRepository::new(BoxResourceStore::new(MemoryResourceStore::new()));
        let exec = WorkflowExecution::new(ExecutionSpec {
            workflow: "document: {}".to_string(),
            input: json!({"a": 1}),
            org_id: None,
        });
        repo.put(&exec).await.unwrap();

        let loaded = repo.get(&exec.id).await.unwrap().unwrap();
        assert_eq!(loaded, exec);
        assert_eq!(loaded.status.phase, ExecutionPhase::Pending);
        assert_eq!(repo.list().await.unwrap().len(), 1);
        assert!(repo.get(&Uuid::now_v7()).await.unwrap().is_none());
        assert!(repo.delete(&exec.id).await.unwrap());
    }
}
