//! Engine configuration types for Tideway.
//!
//! `EngineConfig` represents the top-level `config.toml` that controls task
//! queue lanes, worker concurrency, and claim-check offloading.

use secrecy::SecretString;
use serde::Deserialize;

/// Top-level configuration for the Tideway engine.
///
/// Loaded from `~/.tideway/config.toml`. All fields have sensible defaults.
/// Not `Serialize`: blob store credentials are secrets.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub task_queues: TaskQueues,

    /// Maximum concurrent activities per task queue lane.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// History length at which a run continues as new, unless the document
    /// sets `canMaxHistoryLength`.
    #[serde(default = "default_max_history_length")]
    pub max_history_length: u64,

    #[serde(default)]
    pub claim_check: ClaimCheckConfig,
}

fn default_max_concurrency() -> usize {
    10
}

fn default_max_history_length() -> u64 {
    10_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            task_queues: TaskQueues::default(),
            max_concurrency: default_max_concurrency(),
            max_history_length: default_max_history_length(),
            claim_check: ClaimCheckConfig::default(),
        }
    }
}

/// Names of the three logically distinct task queue lanes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TaskQueues {
    /// Engine-internal activities (status updates, claim-check IO).
    #[serde(default = "default_orchestration_queue")]
    pub orchestration: String,
    /// User workflow activities (HTTP, gRPC, functions).
    #[serde(default = "default_execution_queue")]
    pub execution: String,
    /// Validation-only activities.
    #[serde(default = "default_validation_queue")]
    pub validation: String,
}

fn default_orchestration_queue() -> String {
    "workflow_execution_runner".to_string()
}

fn default_execution_queue() -> String {
    "workflow_execution".to_string()
}

fn default_validation_queue() -> String {
    "workflow_validation_runner".to_string()
}

impl Default for TaskQueues {
    fn default() -> Self {
        Self {
            orchestration: default_orchestration_queue(),
            execution: default_execution_queue(),
            validation: default_validation_queue(),
        }
    }
}

/// Claim-check offloading settings. Disabled unless explicitly enabled.
#[derive(Debug, Clone, Deserialize)]
pub struct ClaimCheckConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Payloads strictly larger than this many serialized bytes are offloaded.
    #[serde(default = "default_threshold_bytes")]
    pub threshold_bytes: usize,

    #[serde(default = "default_compression")]
    pub compression: bool,

    /// Retention window for offloaded blobs.
    #[serde(default = "default_ttl_days")]
    pub ttl_days: u32,

    #[serde(default)]
    pub blob_store: BlobStoreConfig,
}

fn default_threshold_bytes() -> usize {
    50 * 1024
}

fn default_compression() -> bool {
    true
}

fn default_ttl_days() -> u32 {
    30
}

impl Default for ClaimCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold_bytes: default_threshold_bytes(),
            compression: default_compression(),
            ttl_days: default_ttl_days(),
            blob_store: BlobStoreConfig::default(),
        }
    }
}

/// Which blob store service backs claim-check payloads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlobBackend {
    /// S3-compatible object storage (AWS S3, R2, MinIO).
    #[default]
    S3,
    /// Local directory, rooted at `root`.
    Fs,
    /// Process memory. Useful for tests and single-shot CLI runs.
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlobStoreConfig {
    #[serde(default)]
    pub backend: BlobBackend,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<SecretString>,
    /// Root directory (fs) or key prefix (s3).
    #[serde(default)]
    pub root: Option<String>,
}

fn default_region() -> String {
    "auto".to_string()
}

impl Default for BlobStoreConfig {
    fn default() -> Self {
        Self {
            backend: BlobBackend::default(),
            bucket: None,
            endpoint: None,
            region: default_region(),
            access_key_id: None,
            secret_access_key: None,
            root: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrency, 10);
        assert_eq!(config.task_queues.orchestration, "workflow_execution_runner");
        assert_eq!(config.task_queues.execution, "workflow_execution");
        assert_eq!(config.task_queues.validation, "workflow_validation_runner");
        assert!(!config.claim_check.enabled);
        assert_eq!(config.claim_check.threshold_bytes, 51_200);
        assert!(config.claim_check.compression);
        assert_eq!(config.claim_check.ttl_days, 30);
        assert_eq!(config.claim_check.blob_store.region, "auto");
    }

    #[test]
    fn test_engine_config_partial_toml() {
        let toml_str = r#"
max_concurrency = 4

[claim_check]
enabled = true
threshold_bytes = 1024

[claim_check.blob_store]
bucket = "payloads"
endpoint = "https://r2.example.com"
access_key_id = "AKIA"
secret_access_key = "shh"
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.max_concurrency, 4);
        assert!(config.claim_check.enabled);
        assert_eq!(config.claim_check.threshold_bytes, 1024);
        assert!(config.claim_check.compression);
        let store = &config.claim_check.blob_store;
        assert_eq!(store.backend, BlobBackend::S3);
        assert_eq!(store.bucket.as_deref(), Some("payloads"));
        assert_eq!(
            store.secret_access_key.as_ref().map(|s| s.expose_secret()),
            Some("shh")
        );
        assert_eq!(config.task_queues, TaskQueues::default());
    }

    #[test]
    fn test_secret_not_in_debug_output() {
        let store = BlobStoreConfig {
            secret_access_key: Some(SecretString::from("hunter2".to_string())),
            ..Default::default()
        };
        assert!(!format!("{store:?}").contains("hunter2"));
    }
}
