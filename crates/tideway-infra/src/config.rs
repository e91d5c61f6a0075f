//! Engine configuration loader.
//!
//! Reads `config.toml` from the data directory (`~/.tideway/` unless
//! `TIDEWAY_DATA_DIR` says otherwise), applies `TIDEWAY_*` environment
//! overrides and validates the result. A missing file means defaults.

use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

use tideway_types::config::{BlobBackend, EngineConfig};

pub const CONFIG_FILE: &str = "config.toml";
pub const DATA_DIR_ENV: &str = "TIDEWAY_DATA_DIR";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value for {var}: {reason}")]
    Env { var: String, reason: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Data directory: `TIDEWAY_DATA_DIR`, else `~/.tideway`.
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tideway")
}

/// Load `{data_dir}/config.toml`, apply process env overrides, validate.
pub async fn load_engine_config(data_dir: &Path) -> Result<EngineConfig, ConfigError> {
    let mut config = read_config_file(data_dir).await?;
    apply_env_overrides(&mut config, |var| std::env::var(var).ok())?;
    validate(&config)?;
    Ok(config)
}

async fn read_config_file(data_dir: &Path) -> Result<EngineConfig, ConfigError> {
    let path = data_dir.join(CONFIG_FILE);
    let content = match tokio::fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(EngineConfig::default());
        }
        Err(source) => return Err(ConfigError::Read { path, source }),
    };
    toml::from_str(&content).map_err(|source| ConfigError::Parse { path, source })
}

fn parse_env<T: std::str::FromStr>(var: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Env {
        var: var.to_string(),
        reason: e.to_string(),
    })
}

fn parse_backend(var: &str, raw: &str) -> Result<BlobBackend, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "s3" => Ok(BlobBackend::S3),
        "fs" => Ok(BlobBackend::Fs),
        "memory" => Ok(BlobBackend::Memory),
        other => Err(ConfigError::Env {
            var: var.to_string(),
            reason: format!("unknown blob backend '{other}' (expected s3, fs or memory)"),
        }),
    }
}

/// Apply `TIDEWAY_*` overrides looked up through `lookup`.
pub fn apply_env_overrides(
    config: &mut EngineConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

    let queues = &mut config.task_queues;
    if let Some(v) = get("TIDEWAY_ORCHESTRATION_QUEUE") {
        queues.orchestration = v;
    }
    if let Some(v) = get("TIDEWAY_EXECUTION_QUEUE") {
        queues.execution = v;
    }
    if let Some(v) = get("TIDEWAY_VALIDATION_QUEUE") {
        queues.validation = v;
    }
    if let Some(v) = get("TIDEWAY_MAX_CONCURRENCY") {
        config.max_concurrency = parse_env("TIDEWAY_MAX_CONCURRENCY", &v)?;
    }
    if let Some(v) = get("TIDEWAY_MAX_HISTORY_LENGTH") {
        config.max_history_length = parse_env("TIDEWAY_MAX_HISTORY_LENGTH", &v)?;
    }

    let claim = &mut config.claim_check;
    if let Some(v) = get("TIDEWAY_CLAIM_CHECK_ENABLED") {
        claim.enabled = parse_env("TIDEWAY_CLAIM_CHECK_ENABLED", &v)?;
    }
    if let Some(v) = get("TIDEWAY_CLAIM_CHECK_THRESHOLD_BYTES") {
        claim.threshold_bytes = parse_env("TIDEWAY_CLAIM_CHECK_THRESHOLD_BYTES", &v)?;
    }
    if let Some(v) = get("TIDEWAY_CLAIM_CHECK_COMPRESSION") {
        claim.compression = parse_env("TIDEWAY_CLAIM_CHECK_COMPRESSION", &v)?;
    }
    if let Some(v) = get("TIDEWAY_CLAIM_CHECK_TTL_DAYS") {
        claim.ttl_days = parse_env("TIDEWAY_CLAIM_CHECK_TTL_DAYS", &v)?;
    }

    let blob = &mut claim.blob_store;
    if let Some(v) = get("TIDEWAY_BLOB_BACKEND") {
        blob.backend = parse_backend("TIDEWAY_BLOB_BACKEND", &v)?;
    }
    if let Some(v) = get("TIDEWAY_BLOB_BUCKET") {
        blob.bucket = Some(v);
    }
    if let Some(v) = get("TIDEWAY_BLOB_ENDPOINT") {
        blob.endpoint = Some(v);
    }
    if let Some(v) = get("TIDEWAY_BLOB_REGION") {
        blob.region = v;
    }
    if let Some(v) = get("TIDEWAY_BLOB_ACCESS_KEY_ID") {
        blob.access_key_id = Some(v);
    }
    if let Some(v) = get("TIDEWAY_BLOB_SECRET_ACCESS_KEY") {
        blob.secret_access_key = Some(SecretString::from(v));
    }
    if let Some(v) = get("TIDEWAY_BLOB_ROOT") {
        blob.root = Some(v);
    }
    Ok(())
}

fn blank(value: Option<&str>) -> bool {
    value.is_none_or(|v| v.trim().is_empty())
}

pub fn validate(config: &EngineConfig) -> Result<(), ConfigError> {
    let queues = &config.task_queues;
    for (lane, name) in [
        ("orchestration", &queues.orchestration),
        ("execution", &queues.execution),
        ("validation", &queues.validation),
    ] {
        if name.trim().is_empty() {
            return Err(ConfigError::Invalid(format!("task_queues.{lane} must not be empty")));
        }
    }
    if config.max_concurrency == 0 {
        return Err(ConfigError::Invalid("max_concurrency must be at least 1".to_string()));
    }

    let claim = &config.claim_check;
    if !claim.enabled {
        return Ok(());
    }
    if claim.threshold_bytes == 0 {
        return Err(ConfigError::Invalid("claim_check.threshold_bytes must be positive".to_string()));
    }
    let blob = &claim.blob_store;
    if blob.backend == BlobBackend::S3 {
        let mut missing = Vec::new();
        if blank(blob.bucket.as_deref()) {
            missing.push("bucket");
        }
        if blank(blob.endpoint.as_deref()) {
            missing.push("endpoint");
        }
        if blank(blob.access_key_id.as_deref()) {
            missing.push("access_key_id");
        }
        if blank(blob.secret_access_key.as_ref().map(|s| s.expose_secret())) {
            missing.push("secret_access_key");
        }
        if !missing.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "s3 blob store requires {}",
                missing.join(", ")
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |var| map.get(var).cloned()
    }

    #[tokio::test]
    async fn test_missing_file_returns_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = read_config_file(tmp.path()).await.unwrap();
        assert_eq!(config.max_concurrency, 10);
        assert!(!config.claim_check.enabled);
    }

    #[tokio::test]
    async fn test_file_values_are_parsed() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join(CONFIG_FILE),
            r#"
max_concurrency = 4

[task_queues]
execution = "custom_exec"

[claim_check]
enabled = true
threshold_bytes = 1024

[claim_check.blob_store]
backend = "fs"
root = "/var/lib/tideway/blobs"
"#,
        )
        .await
        .unwrap();

        let config = read_config_file(tmp.path()).await.unwrap();
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.task_queues.execution, "custom_exec");
        assert_eq!(config.task_queues.orchestration, "workflow_execution_runner");
        assert_eq!(config.claim_check.blob_store.backend, BlobBackend::Fs);
        validate(&config).unwrap();
    }

    #[tokio::test]
    async fn test_malformed_file_is_an_error() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join(CONFIG_FILE), "max_concurrency = {").await.unwrap();
        let err = read_config_file(tmp.path()).await.unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_env_overrides_win() {
        let mut config = EngineConfig::default();
        apply_env_overrides(
            &mut config,
            env(&[
                ("TIDEWAY_EXECUTION_QUEUE", "lane_b"),
                ("TIDEWAY_MAX_CONCURRENCY", "3"),
                ("TIDEWAY_CLAIM_CHECK_ENABLED", "true"),
                ("TIDEWAY_BLOB_BACKEND", "Memory"),
                ("TIDEWAY_BLOB_SECRET_ACCESS_KEY", "s3cr3t"),
                ("TIDEWAY_VALIDATION_QUEUE", "  "),
            ]),
        )
        .unwrap();

        assert_eq!(config.task_queues.execution, "lane_b");
        assert_eq!(config.task_queues.validation, "workflow_validation_runner");
        assert_eq!(config.max_concurrency, 3);
        assert!(config.claim_check.enabled);
        assert_eq!(config.claim_check.blob_store.backend, BlobBackend::Memory);
        assert_eq!(
            config.claim_check.blob_store.secret_access_key.as_ref().unwrap().expose_secret(),
            "s3cr3t"
        );
    }

    #[test]
    fn test_bad_env_values_are_rejected() {
        let mut config = EngineConfig::default();
        let err = apply_env_overrides(&mut config, env(&[("TIDEWAY_MAX_CONCURRENCY", "many")])).unwrap_err();
        assert!(matches!(err, ConfigError::Env { ref var, .. } if var == "TIDEWAY_MAX_CONCURRENCY"));

        let err = apply_env_overrides(&mut config, env(&[("TIDEWAY_BLOB_BACKEND", "gcs")])).unwrap_err();
        assert!(err.to_string().contains("gcs"));
    }

    #[test]
    fn test_validation() {
        let mut config = EngineConfig::default();
        validate(&config).unwrap();

        config.task_queues.orchestration = String::new();
        assert!(validate(&config).unwrap_err().to_string().contains("orchestration"));
        config.task_queues.orchestration = "o".to_string();

        // s3 requirements only apply when claim-check is on.
        config.claim_check.enabled = true;
        config.claim_check.blob_store.bucket = Some("payloads".to_string());
        let err = validate(&config).unwrap_err().to_string();
        assert!(err.contains("endpoint"));
        assert!(err.contains("secret_access_key"));
        assert!(!err.contains("bucket"));

        config.claim_check.blob_store.backend = BlobBackend::Memory;
        validate(&config).unwrap();
    }
}
