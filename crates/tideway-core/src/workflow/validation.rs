//! Validation-only runs.
//!
//! Validation never executes a task. It checks the document shape and DSL
//! range, then compiles the whole task tree with a factory, so every error
//! the engine would hit at build time is reported up front.
//!
//! The outcome is three-state: `INVALID` means the document is wrong,
//! `FAILED` means the validator itself broke.

use serde::Deserialize;
use serde_json::Value;

use tideway_types::execution::{ValidationResult, ValidationState};
use tideway_types::workflow::{TaskKind, TaskList, WorkflowDefinition};

use crate::substrate::activity::{ACTIVITY_VALIDATE_WORKFLOW, Activity, ActivityContext, ActivityError, error_type};

use super::loader::{load_definition, to_canonical_yaml};
use super::tasks::TaskFactory;

const REQUIRED_DOCUMENT_FIELDS: [&str; 4] = ["dsl", "namespace", "name", "version"];

fn valid(warnings: Vec<String>, canonical: Option<String>) -> ValidationResult {
    ValidationResult {
        state: ValidationState::Valid,
        errors: Vec::new(),
        warnings,
        canonical_document: canonical,
    }
}

fn invalid(errors: Vec<String>, warnings: Vec<String>, canonical: Option<String>) -> ValidationResult {
    ValidationResult {
        state: ValidationState::Invalid,
        errors,
        warnings,
        canonical_document: canonical,
    }
}

/// Result for a validator that could not run to completion.
pub fn validation_failed(message: impl Into<String>) -> ValidationResult {
    ValidationResult {
        state: ValidationState::Failed,
        errors: vec![message.into()],
        warnings: Vec::new(),
        canonical_document: None,
    }
}

fn parse_raw(raw: &[u8]) -> Result<Value, String> {
    let text = std::str::from_utf8(raw).map_err(|e| format!("document is not UTF-8: {e}"))?;
    if text.trim_start().starts_with('{') {
        serde_json::from_str(text).map_err(|e| format!("malformed JSON document: {e}"))
    } else {
        serde_yaml_ng::from_str(text).map_err(|e| format!("malformed YAML document: {e}"))
    }
}

/// Structural checks on the raw document, before typed parsing.
fn shape_errors(doc: &Value) -> Vec<String> {
    let mut errors = Vec::new();
    match doc.get("document") {
        Some(Value::Object(meta)) => {
            for field in REQUIRED_DOCUMENT_FIELDS {
                let present = meta
                    .get(field)
                    .and_then(Value::as_str)
                    .is_some_and(|s| !s.trim().is_empty());
                if !present {
                    errors.push(format!("document.{field} is required"));
                }
            }
        }
        _ => errors.push("document section is required".to_string()),
    }
    match doc.get("do") {
        Some(Value::Array(tasks)) if !tasks.is_empty() => {}
        _ => errors.push("workflow must declare at least one task under 'do'".to_string()),
    }
    errors
}

fn listen_warnings(tasks: &TaskList, warnings: &mut Vec<String>) {
    for node in tasks.iter() {
        match &node.kind {
            TaskKind::Listen(_) if node.base.timeout.is_none() && !node.base.metadata.contains_key("timeout") => {
                warnings.push(format!(
                    "listen task '{}' has no timeout and will give up after one minute",
                    node.name
                ));
            }
            TaskKind::Do(inner) => listen_warnings(inner, warnings),
            TaskKind::For(spec) => listen_warnings(&spec.do_, warnings),
            TaskKind::Fork(spec) => listen_warnings(&spec.branches, warnings),
            TaskKind::Try(spec) => {
                listen_warnings(&spec.try_, warnings);
                if let Some(handler) = spec.catch.as_ref().and_then(|c| c.do_.as_ref()) {
                    listen_warnings(handler, warnings);
                }
                if let Some(finally) = &spec.finally {
                    listen_warnings(finally, warnings);
                }
            }
            _ => {}
        }
    }
}

fn warnings_for(def: &WorkflowDefinition) -> Vec<String> {
    let mut warnings = Vec::new();
    if def.timeout.is_none() {
        warnings.push("workflow declares no timeout; activities default to five minutes".to_string());
    }
    listen_warnings(&def.tasks, &mut warnings);
    warnings
}

/// Validate a raw document synchronously.
pub fn validate_document(raw: &[u8], factory: &TaskFactory) -> ValidationResult {
    let doc = match parse_raw(raw) {
        Ok(doc) => doc,
        Err(message) => return invalid(vec![message], Vec::new(), None),
    };

    let errors = shape_errors(&doc);
    if !errors.is_empty() {
        return invalid(errors, Vec::new(), None);
    }

    let def = match load_definition(raw) {
        Ok(def) => def,
        Err(e) => return invalid(vec![e.to_string()], Vec::new(), None),
    };
    let warnings = warnings_for(&def);
    let canonical = match to_canonical_yaml(&def) {
        Ok(yaml) => Some(yaml),
        Err(e) => {
            tracing::warn!(error = %e, "could not render canonical document");
            None
        }
    };

    match factory.build_workflow(&def) {
        Ok(_) => valid(warnings, canonical),
        Err(e) => invalid(vec![e.to_string()], warnings, canonical),
    }
}

/// Validate on the blocking pool. A panicking validator yields `FAILED`.
pub async fn validate(raw: Vec<u8>) -> ValidationResult {
    match tokio::task::spawn_blocking(move || validate_document(&raw, &TaskFactory::new())).await {
        Ok(result) => result,
        Err(e) => {
            tracing::error!(error = %e, "validator crashed");
            validation_failed(format!("validator crashed: {e}"))
        }
    }
}

#[derive(Debug, Deserialize)]
struct ValidateInput {
    document: String,
}

/// `ValidateWorkflow`: served on the validation lane.
pub struct ValidateWorkflowActivity;

impl Activity for ValidateWorkflowActivity {
    fn name(&self) -> &str {
        ACTIVITY_VALIDATE_WORKFLOW
    }

    async fn execute(&self, _ctx: ActivityContext, input: Value) -> Result<Value, ActivityError> {
        let req: ValidateInput = serde_json::from_value(input)
            .map_err(|e| ActivityError::non_retryable(error_type::VALIDATION, e.to_string()))?;
        let result = validate(req.document.into_bytes()).await;
        tracing::info!(state = ?result.state, errors = result.errors.len(), warnings = result.warnings.len(), "workflow validated");
        serde_json::to_value(&result).map_err(|e| ActivityError::non_retryable(error_type::RUNTIME, e.to_string()))
    }
}
