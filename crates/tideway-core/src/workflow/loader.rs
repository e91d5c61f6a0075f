//! Workflow document loading and DSL version gating.
//!
//! Converts raw YAML or JSON bytes into the typed `WorkflowDefinition`. The
//! only check performed here is DSL compatibility; task-level correctness is
//! the factory's job.

use semver::{Version, VersionReq};
use thiserror::Error;
use tideway_types::workflow::WorkflowDefinition;

/// DSL versions this engine can interpret.
pub const SUPPORTED_DSL: &str = ">=1.0.0, <2.0.0";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum LoaderError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    Parse(String),

    /// `document.dsl` is outside the supported range.
    #[error("unsupported DSL version '{version}' (supported: {SUPPORTED_DSL})")]
    UnsupportedDsl { version: String },
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Parse a workflow document and check its DSL version.
///
/// Accepts YAML or JSON. JSON is tried first when the document starts with
/// `{`, since YAML parsing of JSON produces less useful error messages.
pub fn load_definition(raw: &[u8]) -> Result<WorkflowDefinition, LoaderError> {
    let text = std::str::from_utf8(raw).map_err(|e| LoaderError::Parse(e.to_string()))?;

    let def: WorkflowDefinition = if text.trim_start().starts_with('{') {
        serde_json::from_str(text).map_err(|e| LoaderError::Parse(e.to_string()))?
    } else {
        serde_yaml_ng::from_str(text).map_err(|e| LoaderError::Parse(e.to_string()))?
    };

    check_dsl_version(&def.document.dsl)?;
    Ok(def)
}

/// Reject DSL versions outside [`SUPPORTED_DSL`].
///
/// Unparseable version strings are treated as unsupported, carrying the
/// offending string.
pub fn check_dsl_version(version: &str) -> Result<(), LoaderError> {
    let unsupported = || LoaderError::UnsupportedDsl {
        version: version.to_string(),
    };
    let parsed = Version::parse(version.trim()).map_err(|_| unsupported())?;
    let req = VersionReq::parse(SUPPORTED_DSL).map_err(|_| unsupported())?;
    // Pre-releases never match: `1.0.0-alpha` sorts below `1.0.0`.
    if req.matches(&parsed) {
        Ok(())
    } else {
        Err(unsupported())
    }
}

/// Render a definition as canonical YAML (used for audit on validation).
pub fn to_canonical_yaml(def: &WorkflowDefinition) -> Result<String, LoaderError> {
    serde_yaml_ng::to_string(def).map_err(|e| LoaderError::Parse(e.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(dsl: &str) -> String {
        format!(
            r#"
document:
  dsl: "{dsl}"
  namespace: test
  name: gate
  version: "1.0.0"
do:
  - hello:
      set:
        greeting: hi
"#
        )
    }

    #[test]
    fn test_supported_versions_load() {
        for v in ["1.0.0", "1.0.1", "1.5.0", "1.99.99"] {
            let def = load_definition(doc(v).as_bytes())
                .unwrap_or_else(|e| panic!("{v} should load: {e}"));
            assert_eq!(def.document.dsl, v);
        }
    }

    #[test]
    fn test_out_of_range_versions_rejected() {
        for v in ["0.9.0", "2.0.0", "0.0.1", "3.1.0", "1.0.0-alpha", "1.2.0-rc.1", "2.0.0-beta"] {
            match load_definition(doc(v).as_bytes()) {
                Err(LoaderError::UnsupportedDsl { version }) => assert_eq!(version, v),
                other => panic!("{v}: expected UnsupportedDsl, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_garbage_version_rejected_with_string() {
        let err = load_definition(doc("latest").as_bytes()).unwrap_err();
        assert!(err.to_string().contains("'latest'"));
    }

    #[test]
    fn test_json_documents_load() {
        let json = r#"{
            "document": {"dsl": "1.0.0", "namespace": "n", "name": "j", "version": "1"},
            "do": [{"only": {"set": {"x": 1}}}]
        }"#;
        let def = load_definition(json.as_bytes()).unwrap();
        assert_eq!(def.document.name, "j");
        assert_eq!(def.tasks.len(), 1);
    }

    #[test]
    fn test_malformed_document_is_parse_error() {
        let err = load_definition(b"document: [unclosed").unwrap_err();
        assert!(matches!(err, LoaderError::Parse(_)));
    }

    #[test]
    fn test_unknown_metadata_keys_ignored() {
        let yaml = r#"
document:
  dsl: "1.0.0"
  namespace: n
  name: meta
  version: "1"
  metadata:
    somethingNew: { nested: true }
do:
  - a:
      set: { x: 1 }
"#;
        let def = load_definition(yaml.as_bytes()).unwrap();
        assert!(def.metadata("somethingNew").is_some());
    }

    #[test]
    fn test_canonical_yaml_reloads() {
        let def = load_definition(doc("1.0.0").as_bytes()).unwrap();
        let canonical = to_canonical_yaml(&def).unwrap();
        let again = load_definition(canonical.as_bytes()).unwrap();
        assert_eq!(again.document.name, def.document.name);
    }
}
