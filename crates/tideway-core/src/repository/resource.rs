//! Generic resource store keyed by `<kind>/<id>`.
//!
//! Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
//! `BoxResourceStore` provides dynamic dispatch the same way the other
//! pluggable seams do.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tideway_types::error::RepositoryError;

/// Kinds of stored resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Workflow,
    WorkflowExecution,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 2] = [ResourceKind::Workflow, ResourceKind::WorkflowExecution];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Workflow => "workflow",
            ResourceKind::WorkflowExecution => "workflow_execution",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "workflow" => Ok(ResourceKind::Workflow),
            "workflow_execution" | "execution" => Ok(ResourceKind::WorkflowExecution),
            other => Err(format!("unknown resource kind '{other}'")),
        }
    }
}

/// Storage key for a resource.
pub fn resource_key(kind: ResourceKind, id: &str) -> String {
    format!("{}/{id}", kind.as_str())
}

/// Reject prefixes that would match every key.
pub fn check_prefix(prefix: &str) -> Result<(), RepositoryError> {
    if prefix.trim().is_empty() {
        return Err(RepositoryError::InvalidPrefix(
            "prefix must not be empty; use delete_all to wipe the store".to_string(),
        ));
    }
    Ok(())
}

pub trait ResourceStore: Send + Sync + 'static {
    fn get(
        &self,
        kind: ResourceKind,
        id: &str,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, RepositoryError>> + Send;

    /// Insert or replace.
    fn put(
        &self,
        kind: ResourceKind,
        id: &str,
        bytes: Vec<u8>,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// All `(id, bytes)` pairs of one kind, ordered by id.
    fn list(&self, kind: ResourceKind) -> impl Future<Output = Result<Vec<(String, Vec<u8>)>, RepositoryError>> + Send;

    /// Returns `true` if the resource existed.
    fn delete(&self, kind: ResourceKind, id: &str) -> impl Future<Output = Result<bool, RepositoryError>> + Send;

    fn delete_by_kind(&self, kind: ResourceKind) -> impl Future<Output = Result<u64, RepositoryError>> + Send;

    /// Delete every key starting with `prefix`. Must fail with
    /// `RepositoryError::InvalidPrefix` for an empty prefix.
    fn delete_by_prefix(&self, prefix: &str) -> impl Future<Output = Result<u64, RepositoryError>> + Send;

    /// Explicit full wipe.
    fn delete_all(&self) -> impl Future<Output = Result<u64, RepositoryError>> + Send;
}

// ---------------------------------------------------------------------------
// Dynamic dispatch
// ---------------------------------------------------------------------------

type BoxFut<'a, T> = Pin<Box<dyn Future<Output = Result<T, RepositoryError>> + Send + 'a>>;

pub trait ResourceStoreDyn: Send + Sync {
    fn get_boxed<'a>(&'a self, kind: ResourceKind, id: &'a str) -> BoxFut<'a, Option<Vec<u8>>>;
    fn put_boxed<'a>(&'a self, kind: ResourceKind, id: &'a str, bytes: Vec<u8>) -> BoxFut<'a, ()>;
    fn list_boxed(&self, kind: ResourceKind) -> BoxFut<'_, Vec<(String, Vec<u8>)>>;
    fn delete_boxed<'a>(&'a self, kind: ResourceKind, id: &'a str) -> BoxFut<'a, bool>;
    fn delete_by_kind_boxed(&self, kind: ResourceKind) -> BoxFut<'_, u64>;
    fn delete_by_prefix_boxed<'a>(&'a self, prefix: &'a str) -> BoxFut<'a, u64>;
    fn delete_all_boxed(&self) -> BoxFut<'_, u64>;
}

impl<T: ResourceStore> ResourceStoreDyn for T {
    fn get_boxed<'a>(&'a self, kind: ResourceKind, id: &'a str) -> BoxFut<'a, Option<Vec<u8>>> {
        Box::pin(self.get(kind, id))
    }

    fn put_boxed<'a>(&'a self, kind: ResourceKind, id: &'a str, bytes: Vec<u8>) -> BoxFut<'a, ()> {
        Box::pin(self.put(kind, id, bytes))
    }

    fn list_boxed(&self, kind: ResourceKind) -> BoxFut<'_, Vec<(String, Vec<u8>)>> {
        Box::pin(self.list(kind))
    }

    fn delete_boxed<'a>(&'a self, kind: ResourceKind, id: &'a str) -> BoxFut<'a, bool> {
        Box::pin(self.delete(kind, id))
    }

    fn delete_by_kind_boxed(&self, kind: ResourceKind) -> BoxFut<'_, u64> {
        Box::pin(self.delete_by_kind(kind))
    }

    fn delete_by_prefix_boxed<'a>(&'a self, prefix: &'a str) -> BoxFut<'a, u64> {
        Box::pin(self.delete_by_prefix(prefix))
    }

    fn delete_all_boxed(&self) -> BoxFut<'_, u64> {
        Box::pin(self.delete_all())
    }
}

#[derive(Clone)]
pub struct BoxResourceStore {
    inner: Arc<dyn ResourceStoreDyn>,
}

impl BoxResourceStore {
    pub fn new<T: ResourceStore>(store: T) -> Self {
        Self {
            inner: Arc::new(store),
        }
    }

    pub async fn get(&self, kind: ResourceKind, id: &str) -> Result<Option<Vec<u8>>, RepositoryError> {
        self.inner.get_boxed(kind, id).await
    }

    pub async fn put(&self, kind: ResourceKind, id: &str, bytes: Vec<u8>) -> Result<(), RepositoryError> {
        self.inner.put_boxed(kind, id, bytes).await
    }

    pub async fn list(&self, kind: ResourceKind) -> Result<Vec<(String, Vec<u8>)>, RepositoryError> {
        self.inner.list_boxed(kind).await
    }

    pub async fn delete(&self, kind: ResourceKind, id: &str) -> Result<bool, RepositoryError> {
        self.inner.delete_boxed(kind, id).await
    }

    pub async fn delete_by_kind(&self, kind: ResourceKind) -> Result<u64, RepositoryError> {
        self.inner.delete_by_kind_boxed(kind).await
    }

    pub async fn delete_by_prefix(&self, prefix: &str) -> Result<u64, RepositoryError> {
        self.inner.delete_by_prefix_boxed(prefix).await
    }

    pub async fn delete_all(&self) -> Result<u64, RepositoryError> {
        self.inner.delete_all_boxed().await
    }
}

impl std::fmt::Debug for BoxResourceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxResourceStore").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// Process-local store. Contents are lost on drop.
#[derive(Debug, Default, Clone)]
pub struct MemoryResourceStore {
    entries: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryResourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn remove_where(&self, pred: impl Fn(&str) -> bool) -> u64 {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|k, _| !pred(k));
        (before - entries.len()) as u64
    }
}

impl ResourceStore for MemoryResourceStore {
    async fn get(&self, kind: ResourceKind, id: &str) -> Result<Option<Vec<u8>>, RepositoryError> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(&resource_key(kind, id)).cloned())
    }

    async fn put(&self, kind: ResourceKind, id: &str, bytes: Vec<u8>) -> Result<(), RepositoryError> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(resource_key(kind, id), bytes);
        Ok(())
    }

    async fn list(&self, kind: ResourceKind) -> Result<Vec<(String, Vec<u8>)>, RepositoryError> {
        let prefix = format!("{}/", kind.as_str());
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        Ok(entries
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, v)| (k[prefix.len()..].to_string(), v.clone()))
            .collect())
    }

    async fn delete(&self, kind: ResourceKind, id: &str) -> Result<bool, RepositoryError> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        Ok(entries.remove(&resource_key(kind, id)).is_some())
    }

    async fn delete_by_kind(&self, kind: ResourceKind) -> Result<u64, RepositoryError> {
        let prefix = format!("{}/", kind.as_str());
        Ok(self.remove_where(|k| k.starts_with(&prefix)))
    }

    async fn delete_by_prefix(&self, prefix: &str) -> Result<u64, RepositoryError> {
        check_prefix(prefix)?;
        Ok(self.remove_where(|k| k.starts_with(prefix)))
    }

    async fn delete_all(&self) -> Result<u64, RepositoryError> {
        Ok(self.remove_where(|_| true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded() -> MemoryResourceStore {
        let store = MemoryResourceStore::new();
        store.put(ResourceKind::Workflow, "w1", b"a".to_vec()).await.unwrap();
        store.put(ResourceKind::Workflow, "w2", b"b".to_vec()).await.unwrap();
        store
            .put(ResourceKind::WorkflowExecution, "e1", b"c".to_vec())
            .await
            .unwrap();
        store
    }

    #[test]
    fn test_key_format() {
        assert_eq!(resource_key(ResourceKind::WorkflowExecution, "x"), "workflow_execution/x");
        assert_eq!("execution".parse::<ResourceKind>().unwrap(), ResourceKind::WorkflowExecution);
        assert!("bots".parse::<ResourceKind>().is_err());
    }

    #[tokio::test]
    async fn test_put_get_list_delete() {
        let store = seeded().await;
        assert_eq!(store.get(ResourceKind::Workflow, "w1").await.unwrap(), Some(b"a".to_vec()));
        assert_eq!(store.get(ResourceKind::Workflow, "nope").await.unwrap(), None);

        // "workflow/" must not match "workflow_execution/".
        let listed = store.list(ResourceKind::Workflow).await.unwrap();
        let ids: Vec<&str> = listed.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["w1", "w2"]);

        assert!(store.delete(ResourceKind::Workflow, "w1").await.unwrap());
        assert!(!store.delete(ResourceKind::Workflow, "w1").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_by_kind_counts() {
        let store = seeded().await;
        assert_eq!(store.delete_by_kind(ResourceKind::Workflow).await.unwrap(), 2);
        assert_eq!(store.list(ResourceKind::WorkflowExecution).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_prefix_rejected_and_delete_all_is_explicit() {
        let store = seeded().await;
        let err = store.delete_by_prefix("").await.unwrap_err();
        assert!(matches!(err, RepositoryError::InvalidPrefix(_)));
        assert!(store.delete_by_prefix("   ").await.is_err());
        assert_eq!(store.list(ResourceKind::Workflow).await.unwrap().len(), 2);

        assert_eq!(store.delete_by_prefix("workflow/w").await.unwrap(), 2);
        assert_eq!(store.delete_all().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_box_store_delegates() {
        let boxed = BoxResourceStore::new(seeded().await);
        assert_eq!(boxed.list(ResourceKind::Workflow).await.unwrap().len(), 2);
        assert!(boxed.delete_by_prefix("").await.is_err());
    }
}
