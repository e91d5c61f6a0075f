//! Blob store trait for claim-check payloads.
//!
//! Implementations live in tideway-infra (opendal-backed: s3, fs, memory).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tideway_types::error::BlobStoreError;

/// Key/value blob storage addressed by string keys.
///
/// Uses RPITIT (native async fn in traits, Rust 2024 edition).
pub trait BlobStore: Send + Sync + 'static {
    fn put(&self, key: &str, bytes: Vec<u8>) -> impl Future<Output = Result<(), BlobStoreError>> + Send;

    /// Returns `BlobStoreError::NotFound` if the key does not exist.
    fn get(&self, key: &str) -> impl Future<Output = Result<Vec<u8>, BlobStoreError>> + Send;

    /// No-op if the key does not exist.
    fn delete(&self, key: &str) -> impl Future<Output = Result<(), BlobStoreError>> + Send;

    /// Cheap reachability probe.
    fn health(&self) -> impl Future<Output = Result<(), BlobStoreError>> + Send;

    fn list_keys(&self, prefix: &str) -> impl Future<Output = Result<Vec<String>, BlobStoreError>> + Send;

    /// Delete blobs last modified before `older_than`. Returns how many were
    /// removed. Backends with native lifecycle rules may return 0.
    fn sweep_expired(
        &self,
        prefix: &str,
        older_than: DateTime<Utc>,
    ) -> impl Future<Output = Result<usize, BlobStoreError>> + Send;
}

type BoxFut<'a, T> = Pin<Box<dyn Future<Output = Result<T, BlobStoreError>> + Send + 'a>>;

/// Object-safe version of [`BlobStore`] with boxed futures.
pub trait BlobStoreDyn: Send + Sync {
    fn put_boxed<'a>(&'a self, key: &'a str, bytes: Vec<u8>) -> BoxFut<'a, ()>;
    fn get_boxed<'a>(&'a self, key: &'a str) -> BoxFut<'a, Vec<u8>>;
    fn delete_boxed<'a>(&'a self, key: &'a str) -> BoxFut<'a, ()>;
    fn health_boxed(&self) -> BoxFut<'_, ()>;
    fn list_keys_boxed<'a>(&'a self, prefix: &'a str) -> BoxFut<'a, Vec<String>>;
    fn sweep_expired_boxed<'a>(&'a self, prefix: &'a str, older_than: DateTime<Utc>) -> BoxFut<'a, usize>;
}

impl<T: BlobStore> BlobStoreDyn for T {
    fn put_boxed<'a>(&'a self, key: &'a str, bytes: Vec<u8>) -> BoxFut<'a, ()> {
        Box::pin(self.put(key, bytes))
    }

    fn get_boxed<'a>(&'a self, key: &'a str) -> BoxFut<'a, Vec<u8>> {
        Box::pin(self.get(key))
    }

    fn delete_boxed<'a>(&'a self, key: &'a str) -> BoxFut<'a, ()> {
        Box::pin(self.delete(key))
    }

    fn health_boxed(&self) -> BoxFut<'_, ()> {
        Box::pin(self.health())
    }

    fn list_keys_boxed<'a>(&'a self, prefix: &'a str) -> BoxFut<'a, Vec<String>> {
        Box::pin(self.list_keys(prefix))
    }

    fn sweep_expired_boxed<'a>(&'a self, prefix: &'a str, older_than: DateTime<Utc>) -> BoxFut<'a, usize> {
        Box::pin(self.sweep_expired(prefix, older_than))
    }
}

/// Type-erased blob store for runtime backend selection.
#[derive(Clone)]
pub struct BoxBlobStore {
    inner: Arc<dyn BlobStoreDyn>,
}

impl BoxBlobStore {
    pub fn new<T: BlobStore>(store: T) -> Self {
        Self {
            inner: Arc::new(store),
        }
    }

    pub async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), BlobStoreError> {
        self.inner.put_boxed(key, bytes).await
    }

    pub async fn get(&self, key: &str) -> Result<Vec<u8>, BlobStoreError> {
        self.inner.get_boxed(key).await
    }

    pub async fn delete(&self, key: &str) -> Result<(), BlobStoreError> {
        self.inner.delete_boxed(key).await
    }

    pub async fn health(&self) -> Result<(), BlobStoreError> {
        self.inner.health_boxed().await
    }

    pub async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, BlobStoreError> {
        self.inner.list_keys_boxed(prefix).await
    }

    pub async fn sweep_expired(&self, prefix: &str, older_than: DateTime<Utc>) -> Result<usize, BlobStoreError> {
        self.inner.sweep_expired_boxed(prefix, older_than).await
    }
}

impl std::fmt::Debug for BoxBlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxBlobStore").finish_non_exhaustive()
    }
}
