//! Claim-check blob storage backed by opendal.
//!
//! One `BlobStore` implementation covers every configured backend: an
//! S3-compatible bucket, a local directory or process memory.

use chrono::{DateTime, Utc};
use opendal::{ErrorKind, Operator, services};
use secrecy::ExposeSecret;

use tideway_core::claimcheck::BlobStore;
use tideway_types::config::{BlobBackend, BlobStoreConfig};
use tideway_types::error::BlobStoreError;

pub struct OpendalBlobStore {
    operator: Operator,
    backend: BlobBackend,
}

fn backend_err(e: opendal::Error) -> BlobStoreError {
    BlobStoreError::Backend(e.to_string())
}

fn config_err(e: opendal::Error) -> BlobStoreError {
    BlobStoreError::Config(e.to_string())
}

impl OpendalBlobStore {
    /// Build an operator for the configured backend. `default_root` is used
    /// by the fs backend when the config names no root.
    pub fn from_config(config: &BlobStoreConfig, default_root: &str) -> Result<Self, BlobStoreError> {
        let operator = match config.backend {
            BlobBackend::S3 => {
                let bucket = config
                    .bucket
                    .as_deref()
                    .ok_or_else(|| BlobStoreError::Config("s3 backend requires a bucket".to_string()))?;
                let mut builder = services::S3::default().bucket(bucket).region(&config.region);
                if let Some(endpoint) = &config.endpoint {
                    builder = builder.endpoint(endpoint);
                }
                if let Some(key_id) = &config.access_key_id {
                    builder = builder.access_key_id(key_id);
                }
                if let Some(secret) = &config.secret_access_key {
                    builder = builder.secret_access_key(secret.expose_secret());
                }
                if let Some(root) = &config.root {
                    builder = builder.root(root);
                }
                Operator::new(builder).map_err(config_err)?.finish()
            }
            BlobBackend::Fs => {
                let root = config.root.as_deref().unwrap_or(default_root);
                Operator::new(services::Fs::default().root(root))
                    .map_err(config_err)?
                    .finish()
            }
            BlobBackend::Memory => Operator::new(services::Memory::default())
                .map_err(config_err)?
                .finish(),
        };
        tracing::info!(backend = ?config.backend, "blob store configured");
        Ok(Self {
            operator,
            backend: config.backend,
        })
    }

    pub fn memory() -> Result<Self, BlobStoreError> {
        let config = BlobStoreConfig {
            backend: BlobBackend::Memory,
            ..BlobStoreConfig::default()
        };
        Self::from_config(&config, "/")
    }
}

impl BlobStore for OpendalBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), BlobStoreError> {
        self.operator.write(key, bytes).await.map_err(backend_err)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, BlobStoreError> {
        match self.operator.read(key).await {
            Ok(buffer) => Ok(buffer.to_vec()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(BlobStoreError::NotFound(key.to_string())),
            Err(e) => Err(backend_err(e)),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), BlobStoreError> {
        self.operator.delete(key).await.map_err(backend_err)
    }

    async fn health(&self) -> Result<(), BlobStoreError> {
        self.operator.check().await.map_err(backend_err)
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, BlobStoreError> {
        let entries = match self.operator.list_with(prefix).recursive(true).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(backend_err(e)),
        };
        let mut keys: Vec<String> = entries
            .into_iter()
            .filter(|entry| entry.metadata().is_file())
            .map(|entry| entry.path().to_string())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn sweep_expired(&self, prefix: &str, older_than: DateTime<Utc>) -> Result<usize, BlobStoreError> {
        // S3 buckets expire payloads through lifecycle rules.
        if self.backend == BlobBackend::S3 {
            return Ok(0);
        }

        let mut removed = 0;
        for key in self.list_keys(prefix).await? {
            let meta = match self.operator.stat(&key).await {
                Ok(meta) => meta,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(backend_err(e)),
            };
            let expired = meta.last_modified().is_some_and(|modified| modified < older_than);
            if expired {
                self.operator.delete(&key).await.map_err(backend_err)?;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(prefix, removed, "swept expired claim-check blobs");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tideway_core::claimcheck::{BoxBlobStore, ClaimCheckManager};
    use tideway_types::config::ClaimCheckConfig;

    #[tokio::test]
    async fn test_memory_put_get_delete() {
        let store = OpendalBlobStore::memory().unwrap();
        store.health().await.unwrap();

        store.put("claimcheck/a", b"payload".to_vec()).await.unwrap();
        assert_eq!(store.get("claimcheck/a").await.unwrap(), b"payload");

        store.delete("claimcheck/a").await.unwrap();
        assert!(matches!(
            store.get("claimcheck/a").await,
            Err(BlobStoreError::NotFound(ref key)) if key == "claimcheck/a"
        ));
        // Deleting a missing key is fine.
        store.delete("claimcheck/a").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_keys_under_prefix() {
        let store = OpendalBlobStore::memory().unwrap();
        store.put("claimcheck/b", vec![1]).await.unwrap();
        store.put("claimcheck/a", vec![1]).await.unwrap();
        store.put("other/c", vec![1]).await.unwrap();

        let keys = store.list_keys("claimcheck/").await.unwrap();
        assert_eq!(keys, vec!["claimcheck/a", "claimcheck/b"]);
        assert!(store.list_keys("missing/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fs_sweep_removes_only_old_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let config = BlobStoreConfig {
            backend: BlobBackend::Fs,
            root: Some(dir.path().display().to_string()),
            ..BlobStoreConfig::default()
        };
        let store = OpendalBlobStore::from_config(&config, "/unused").unwrap();
        store.put("claimcheck/old", vec![0; 16]).await.unwrap();

        let past = Utc::now() - Duration::hours(1);
        assert_eq!(store.sweep_expired("claimcheck/", past).await.unwrap(), 0);

        let future = Utc::now() + Duration::hours(1);
        assert_eq!(store.sweep_expired("claimcheck/", future).await.unwrap(), 1);
        assert!(store.list_keys("claimcheck/").await.unwrap().is_empty());
    }

    #[test]
    fn test_s3_without_bucket_is_a_config_error() {
        let config = BlobStoreConfig::default();
        assert!(matches!(
            OpendalBlobStore::from_config(&config, "/"),
            Err(BlobStoreError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_claim_check_round_trip_through_opendal() {
        let config = ClaimCheckConfig {
            enabled: true,
            threshold_bytes: 32,
            ..ClaimCheckConfig::default()
        };
        let store = BoxBlobStore::new(OpendalBlobStore::memory().unwrap());
        let manager = ClaimCheckManager::new(store, &config);

        let big = serde_json::json!({ "rows": vec!["x".repeat(10); 20] });
        let offloaded = manager.maybe_offload(big.clone()).await.unwrap();
        assert_ne!(offloaded, big);
        assert_eq!(manager.retrieve_value(offloaded).await.unwrap(), big);
        assert_eq!(manager.metrics().offloads, 1);
    }
}
