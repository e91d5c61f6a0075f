//! Size-threshold payload offloading.
//!
//! Payloads whose serialized form is strictly larger than the threshold are
//! (optionally gzip-compressed and) uploaded to the blob store, and replaced
//! by a [`ClaimCheckRef`]. Anything at or under the threshold, and anything
//! at all while disabled, passes through untouched without touching the
//! store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::OnceCell;
use uuid::Uuid;

use tideway_types::claimcheck::ClaimCheckRef;
use tideway_types::config::ClaimCheckConfig;

use super::ClaimCheckError;
use super::compress::{gunzip, gzip};
use super::store::BoxBlobStore;

/// Key prefix for every offloaded payload.
pub const CLAIM_CHECK_PREFIX: &str = "claimcheck/";

/// Result of a byte-level offload decision.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Inline(Vec<u8>),
    Offloaded(ClaimCheckRef),
}

/// Point-in-time counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClaimCheckMetrics {
    pub offloads: u64,
    pub retrievals: u64,
    pub bytes_offloaded: u64,
    pub bytes_retrieved: u64,
    pub offload_micros: u64,
    pub retrieve_micros: u64,
    pub failures: u64,
}

#[derive(Default)]
struct Counters {
    offloads: AtomicU64,
    retrievals: AtomicU64,
    bytes_offloaded: AtomicU64,
    bytes_retrieved: AtomicU64,
    offload_micros: AtomicU64,
    retrieve_micros: AtomicU64,
    failures: AtomicU64,
}

pub struct ClaimCheckManager {
    store: Option<BoxBlobStore>,
    threshold_bytes: usize,
    compression: bool,
    ttl: Duration,
    healthy: OnceCell<()>,
    counters: Counters,
}

impl ClaimCheckManager {
    /// Build a manager. If `config.enabled` is false the store is ignored
    /// and the manager is a pass-through.
    pub fn new(store: BoxBlobStore, config: &ClaimCheckConfig) -> Self {
        Self {
            store: config.enabled.then_some(store),
            threshold_bytes: config.threshold_bytes,
            compression: config.compression,
            ttl: Duration::from_secs(u64::from(config.ttl_days) * 86_400),
            healthy: OnceCell::new(),
            counters: Counters::default(),
        }
    }

    /// A pass-through manager with no blob store.
    pub fn disabled() -> Self {
        let config = ClaimCheckConfig::default();
        Self {
            store: None,
            threshold_bytes: config.threshold_bytes,
            compression: config.compression,
            ttl: Duration::from_secs(u64::from(config.ttl_days) * 86_400),
            healthy: OnceCell::new(),
            counters: Counters::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    pub fn threshold_bytes(&self) -> usize {
        self.threshold_bytes
    }

    /// Whether `value` would be offloaded. Never true for an existing ref.
    pub fn exceeds_threshold(&self, value: &Value) -> bool {
        if !self.is_enabled() || ClaimCheckRef::is_ref(value) {
            return false;
        }
        serde_json::to_vec(value)
            .map(|bytes| bytes.len() > self.threshold_bytes)
            .unwrap_or(false)
    }

    // -- bytes ---------------------------------------------------------------

    /// Offload `bytes` if they exceed the threshold.
    pub async fn maybe_offload_bytes(&self, bytes: Vec<u8>) -> Result<Payload, ClaimCheckError> {
        match &self.store {
            Some(store) if bytes.len() > self.threshold_bytes => {
                Ok(Payload::Offloaded(self.upload(store, &bytes).await?))
            }
            _ => Ok(Payload::Inline(bytes)),
        }
    }

    /// Download and (if flagged) decompress the bytes behind a reference.
    pub async fn retrieve(&self, reference: &ClaimCheckRef) -> Result<Vec<u8>, ClaimCheckError> {
        let store = self.store.as_ref().ok_or(ClaimCheckError::Disabled)?;
        let started = Instant::now();

        let stored = store.get(&reference.key).await.inspect_err(|_| self.record_failure())?;
        let bytes = if reference.compressed {
            gunzip(&stored).map_err(|e| {
                self.record_failure();
                ClaimCheckError::Compression(e.to_string())
            })?
        } else {
            stored
        };

        self.counters.retrievals.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_retrieved
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        self.counters
            .retrieve_micros
            .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
        tracing::debug!(key = %reference.key, bytes = bytes.len(), "claim-check payload retrieved");
        Ok(bytes)
    }

    // -- JSON values ---------------------------------------------------------

    /// Replace `value` with a reference if its serialized form exceeds the
    /// threshold.
    pub async fn maybe_offload(&self, value: Value) -> Result<Value, ClaimCheckError> {
        if !self.is_enabled() || ClaimCheckRef::is_ref(&value) {
            return Ok(value);
        }
        let bytes = serde_json::to_vec(&value).map_err(|e| ClaimCheckError::Serialization(e.to_string()))?;
        match self.maybe_offload_bytes(bytes).await? {
            Payload::Inline(_) => Ok(value),
            Payload::Offloaded(reference) => Ok(reference.to_value()),
        }
    }

    /// Resolve `value` if it is a reference; pass anything else through.
    pub async fn retrieve_value(&self, value: Value) -> Result<Value, ClaimCheckError> {
        let Some(reference) = ClaimCheckRef::from_value(&value) else {
            return Ok(value);
        };
        let bytes = self.retrieve(&reference).await?;
        serde_json::from_slice(&bytes).map_err(|e| ClaimCheckError::Serialization(e.to_string()))
    }

    /// Offload each oversized field. A field that fails to upload keeps its
    /// inline value.
    pub async fn maybe_offload_state(&self, data: Map<String, Value>) -> Map<String, Value> {
        let mut out = Map::with_capacity(data.len());
        for (field, value) in data {
            let original = value.clone();
            let processed = match self.maybe_offload(value).await {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(field = %field, error = %e, "claim-check offload failed, keeping value inline");
                    original
                }
            };
            out.insert(field, processed);
        }
        out
    }

    /// Resolve each referenced field. A field that fails to download keeps
    /// its reference.
    pub async fn maybe_retrieve_state(&self, data: Map<String, Value>) -> Map<String, Value> {
        let mut out = Map::with_capacity(data.len());
        for (field, value) in data {
            let original = value.clone();
            let processed = match self.retrieve_value(value).await {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(field = %field, error = %e, "claim-check retrieve failed, keeping reference");
                    original
                }
            };
            out.insert(field, processed);
        }
        out
    }

    // -- lifecycle -----------------------------------------------------------

    /// Probe the blob store. The first success is cached; failures are
    /// retried on the next call. Always succeeds while disabled.
    pub async fn health(&self) -> Result<(), ClaimCheckError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        self.healthy
            .get_or_try_init(|| async {
                store.health().await?;
                tracing::info!("claim-check blob store reachable");
                Ok::<(), ClaimCheckError>(())
            })
            .await
            .map(|_| ())
    }

    /// Delete offloaded payloads older than the configured TTL.
    pub async fn sweep_expired(&self) -> Result<usize, ClaimCheckError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        let Some(cutoff) = Utc::now().checked_sub_signed(ttl) else {
            return Ok(0);
        };
        let removed = store.sweep_expired(CLAIM_CHECK_PREFIX, cutoff).await?;
        if removed > 0 {
            tracing::info!(removed, "expired claim-check payloads swept");
        }
        Ok(removed)
    }

    pub fn metrics(&self) -> ClaimCheckMetrics {
        let c = &self.counters;
        ClaimCheckMetrics {
            offloads: c.offloads.load(Ordering::Relaxed),
            retrievals: c.retrievals.load(Ordering::Relaxed),
            bytes_offloaded: c.bytes_offloaded.load(Ordering::Relaxed),
            bytes_retrieved: c.bytes_retrieved.load(Ordering::Relaxed),
            offload_micros: c.offload_micros.load(Ordering::Relaxed),
            retrieve_micros: c.retrieve_micros.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
        }
    }

    async fn upload(&self, store: &BoxBlobStore, bytes: &[u8]) -> Result<ClaimCheckRef, ClaimCheckError> {
        let started = Instant::now();
        let stored = if self.compression {
            gzip(bytes).map_err(|e| ClaimCheckError::Compression(e.to_string()))?
        } else {
            bytes.to_vec()
        };
        let key = format!("{CLAIM_CHECK_PREFIX}{}", Uuid::now_v7());
        let size = stored.len() as u64;

        store.put(&key, stored).await.inspect_err(|_| self.record_failure())?;

        self.counters.offloads.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_offloaded
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        self.counters
            .offload_micros
            .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
        tracing::debug!(
            key = %key,
            original_bytes = bytes.len(),
            stored_bytes = size,
            compressed = self.compression,
            "claim-check payload offloaded"
        );
        Ok(ClaimCheckRef::new(key, size, self.compression))
    }

    fn record_failure(&self) {
        self.counters.failures.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::claimcheck::store::BlobStore;
    use chrono::DateTime;
    use dashmap::DashMap;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use tideway_types::error::BlobStoreError;

    /// In-memory blob store that counts calls.
    #[derive(Clone, Default)]
    pub(crate) struct CountingStore {
        pub blobs: Arc<DashMap<String, (Vec<u8>, DateTime<Utc>)>>,
        pub puts: Arc<AtomicUsize>,
        pub gets: Arc<AtomicUsize>,
    }

    impl BlobStore for CountingStore {
        async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), BlobStoreError> {
            self.puts.fetch_add(1, Ordering::SeqCst);
            self.blobs.insert(key.to_string(), (bytes, Utc::now()));
            Ok(())
        }

        async fn get(&self, key: &str) -> Result<Vec<u8>, BlobStoreError> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            self.blobs
                .get(key)
                .map(|b| b.0.clone())
                .ok_or_else(|| BlobStoreError::NotFound(key.to_string()))
        }

        async fn delete(&self, key: &str) -> Result<(), BlobStoreError> {
            self.blobs.remove(key);
            Ok(())
        }

        async fn health(&self) -> Result<(), BlobStoreError> {
            Ok(())
        }

        async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, BlobStoreError> {
            Ok(self
                .blobs
                .iter()
                .filter(|e| e.key().starts_with(prefix))
                .map(|e| e.key().clone())
                .collect())
        }

        async fn sweep_expired(&self, prefix: &str, older_than: DateTime<Utc>) -> Result<usize, BlobStoreError> {
            let before = self.blobs.len();
            self.blobs
                .retain(|k, (_, at)| !(k.starts_with(prefix) && *at < older_than));
            Ok(before - self.blobs.len())
        }
    }

    pub(crate) fn enabled_config(threshold: usize, compression: bool) -> ClaimCheckConfig {
        ClaimCheckConfig {
            enabled: true,
            threshold_bytes: threshold,
            compression,
            ..Default::default()
        }
    }

    fn manager(threshold: usize, compression: bool) -> (ClaimCheckManager, CountingStore) {
        let store = CountingStore::default();
        let mgr = ClaimCheckManager::new(BoxBlobStore::new(store.clone()), &enabled_config(threshold, compression));
        (mgr, store)
    }

    #[tokio::test]
    async fn test_threshold_boundary() {
        let (mgr, store) = manager(64, true);

        let at_threshold = vec![b'a'; 64];
        match mgr.maybe_offload_bytes(at_threshold.clone()).await.unwrap() {
            Payload::Inline(bytes) => assert_eq!(bytes, at_threshold),
            other => panic!("exactly threshold must stay inline, got {other:?}"),
        }
        assert_eq!(store.puts.load(Ordering::SeqCst), 0);

        let over = vec![b'a'; 65];
        assert!(matches!(
            mgr.maybe_offload_bytes(over).await.unwrap(),
            Payload::Offloaded(_)
        ));
        assert_eq!(store.puts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_byte_roundtrip_with_and_without_compression() {
        for compression in [true, false] {
            let (mgr, _store) = manager(16, compression);
            let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
            let Payload::Offloaded(reference) = mgr.maybe_offload_bytes(payload.clone()).await.unwrap() else {
                panic!("payload should be offloaded");
            };
            assert_eq!(reference.compressed, compression);
            assert!(reference.key.starts_with(CLAIM_CHECK_PREFIX));
            assert_eq!(mgr.retrieve(&reference).await.unwrap(), payload);
        }
    }

    #[tokio::test]
    async fn test_value_roundtrip_and_passthrough() {
        let (mgr, store) = manager(32, true);
        let big = json!({ "rows": vec!["x".repeat(10); 20] });
        let offloaded = mgr.maybe_offload(big.clone()).await.unwrap();
        assert!(ClaimCheckRef::is_ref(&offloaded));
        assert_eq!(mgr.retrieve_value(offloaded).await.unwrap(), big);

        let small = json!({"n": 1});
        assert_eq!(mgr.retrieve_value(small.clone()).await.unwrap(), small);
        assert_eq!(store.gets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disabled_is_passthrough() {
        let store = CountingStore::default();
        let mgr = ClaimCheckManager::new(BoxBlobStore::new(store.clone()), &ClaimCheckConfig::default());
        assert!(!mgr.is_enabled());

        let big = json!("y".repeat(100_000));
        assert_eq!(mgr.maybe_offload(big.clone()).await.unwrap(), big);
        assert!(!mgr.exceeds_threshold(&big));
        assert_eq!(store.puts.load(Ordering::SeqCst), 0);
        assert!(mgr.health().await.is_ok());
    }

    #[tokio::test]
    async fn test_state_offload_only_touches_large_fields() {
        let (mgr, _store) = manager(40, false);
        let mut data = Map::new();
        data.insert("small".to_string(), json!(1));
        data.insert("large".to_string(), json!("z".repeat(200)));

        let processed = mgr.maybe_offload_state(data.clone()).await;
        assert_eq!(processed["small"], json!(1));
        assert!(ClaimCheckRef::is_ref(&processed["large"]));

        let restored = mgr.maybe_retrieve_state(processed).await;
        assert_eq!(restored, data);
    }

    #[tokio::test]
    async fn test_missing_blob_keeps_reference_in_state() {
        let (mgr, _store) = manager(8, false);
        let dangling = ClaimCheckRef::new("claimcheck/missing".to_string(), 10, false).to_value();
        let mut data = Map::new();
        data.insert("gone".to_string(), dangling.clone());

        let restored = mgr.maybe_retrieve_state(data).await;
        assert_eq!(restored["gone"], dangling);
        assert_eq!(mgr.metrics().failures, 1);
    }

    #[tokio::test]
    async fn test_metrics_track_activity() {
        let (mgr, _store) = manager(4, true);
        let v = mgr.maybe_offload(json!("0123456789")).await.unwrap();
        mgr.retrieve_value(v).await.unwrap();
        let m = mgr.metrics();
        assert_eq!(m.offloads, 1);
        assert_eq!(m.retrievals, 1);
        assert_eq!(m.bytes_offloaded, 12);
        assert_eq!(m.bytes_retrieved, 12);
    }

    #[tokio::test]
    async fn test_sweep_uses_ttl() {
        let (mgr, store) = manager(4, false);
        let stale = Utc::now() - chrono::Duration::days(45);
        store
            .blobs
            .insert(format!("{CLAIM_CHECK_PREFIX}old"), (vec![1], stale));
        store
            .blobs
            .insert(format!("{CLAIM_CHECK_PREFIX}fresh"), (vec![2], Utc::now()));

        assert_eq!(mgr.sweep_expired().await.unwrap(), 1);
        assert_eq!(store.blobs.len(), 1);
    }
}
