//! Runtime expression evaluation for workflow documents.
//!
//! Workflow documents embed expressions as `${ ... }` strings. The inner text
//! is JEXL, evaluated against the execution state's expression context
//! (`input`, `data`, `env`, `context`, `output`) by `jexl_eval::Evaluator`
//! with a set of standard transforms registered.
//!
//! Payloads are always passed as context objects, NEVER interpolated into
//! expression strings.

use serde_json::{Map, Value, json};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during expression evaluation.
#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression '{expression}' failed: {reason}")]
    EvalFailed { expression: String, reason: String },

    #[error("invalid context: {0}")]
    InvalidContext(String),
}

// ---------------------------------------------------------------------------
// Runtime expression syntax
// ---------------------------------------------------------------------------

/// Return the inner JEXL text if `raw` is a `${ ... }` runtime expression.
pub fn strip_runtime_expression(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();
    trimmed
        .strip_prefix("${")
        .and_then(|s| s.strip_suffix('}'))
        .map(str::trim)
}

pub fn is_runtime_expression(raw: &str) -> bool {
    strip_runtime_expression(raw).is_some()
}

// ---------------------------------------------------------------------------
// WorkflowEvaluator
// ---------------------------------------------------------------------------

/// JEXL expression evaluator with standard transforms pre-registered.
///
/// Used for:
/// - task `if` guards and switch `when` predicates
/// - `set` values, call arguments, `output.as` / `export.as`
/// - `for.in` collections and `while` predicates
/// - catch `when` / `exceptWhen` filters
pub struct WorkflowEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl WorkflowEvaluator {
    /// Create a new evaluator with all standard transforms registered.
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            // String transforms
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .with_transform("trim", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.trim()))
            })
            .with_transform("split", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let delimiter = args.get(1).and_then(|v| v.as_str()).unwrap_or(",");
                let parts: Vec<&str> = s.split(delimiter).collect();
                Ok(json!(parts))
            })
            .with_transform("not", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(!value_to_bool(&val)))
            })
            .with_transform("contains", |args: &[Value]| {
                let found = match (args.first(), args.get(1)) {
                    (Some(Value::Array(items)), Some(needle)) => items.iter().any(|item| json_eq(item, needle)),
                    (Some(Value::Object(map)), Some(Value::String(key))) => map.contains_key(key),
                    (Some(Value::String(s)), Some(Value::String(needle))) => s.contains(needle.as_str()),
                    _ => false,
                };
                Ok(json!(found))
            })
            .with_transform("startsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let prefix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.starts_with(prefix)))
            })
            .with_transform("endsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let suffix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.ends_with(suffix)))
            })
            // Length transform (works on strings, arrays, and objects)
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len))
            })
            // Object transforms
            .with_transform("keys", |args: &[Value]| {
                let keys: Vec<String> = match args.first() {
                    Some(Value::Object(o)) => o.keys().cloned().collect(),
                    _ => Vec::new(),
                };
                Ok(json!(keys))
            })
            .with_transform("values", |args: &[Value]| {
                let values: Vec<Value> = match args.first() {
                    Some(Value::Object(o)) => o.values().cloned().collect(),
                    _ => Vec::new(),
                };
                Ok(Value::Array(values))
            })
            .with_transform("toJson", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(val.to_string()))
            })
            .with_transform("fromJson", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("null");
                Ok(serde_json::from_str(s).unwrap_or(Value::Null))
            });

        Self { evaluator }
    }

    /// Evaluate a bare JEXL expression and return the raw JSON value.
    pub fn evaluate_value(&self, expression: &str, context: &Value) -> Result<Value, ExpressionError> {
        if !context.is_object() {
            return Err(ExpressionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }

        self.evaluator
            .eval_in_context(expression, context)
            .map(normalize_numbers)
            .map_err(|e| ExpressionError::EvalFailed {
                expression: expression.to_string(),
                reason: e.to_string(),
            })
    }

    /// Evaluate a bare JEXL expression to a boolean using JavaScript-like
    /// truthiness.
    pub fn evaluate_bool(&self, expression: &str, context: &Value) -> Result<bool, ExpressionError> {
        let result = self.evaluate_value(expression, context)?;
        Ok(value_to_bool(&result))
    }

    /// Evaluate a predicate written either as `${ expr }` or as bare JEXL.
    pub fn evaluate_predicate(&self, raw: &str, context: &Value) -> Result<bool, ExpressionError> {
        let expression = strip_runtime_expression(raw).unwrap_or(raw);
        self.evaluate_bool(expression, context)
    }

    /// Evaluate a string that may be a runtime expression. Plain strings are
    /// returned as-is.
    pub fn evaluate_string(&self, raw: &str, context: &Value) -> Result<Value, ExpressionError> {
        match strip_runtime_expression(raw) {
            Some(expression) => self.evaluate_value(expression, context),
            None => Ok(Value::String(raw.to_string())),
        }
    }

    /// Walk `value` and evaluate every runtime-expression string found in it.
    /// Object keys are left untouched.
    pub fn traverse(&self, value: &Value, context: &Value) -> Result<Value, ExpressionError> {
        match value {
            Value::String(s) => self.evaluate_string(s, context),
            Value::Array(items) => items
                .iter()
                .map(|item| self.traverse(item, context))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (key, item) in map {
                    out.insert(key.clone(), self.traverse(item, context)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }
}

thread_local! {
    static EVALUATOR: WorkflowEvaluator = WorkflowEvaluator::new();
}

/// Run `f` with this thread's evaluator.
///
/// `jexl_eval::Evaluator` holds boxed transform closures that are not
/// `Send`, so task units never keep one across an `.await`; they borrow the
/// thread-local instance for the synchronous evaluation only.
pub fn with_evaluator<R>(f: impl FnOnce(&WorkflowEvaluator) -> R) -> R {
    EVALUATOR.with(f)
}

impl Default for WorkflowEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

/// Largest magnitude an f64 holds without losing integer precision (2^53).
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

/// JEXL arithmetic yields f64 for every number. Whole values come back as
/// integers so `1 + 1` stores `2`, not `2.0`.
pub fn normalize_numbers(value: Value) -> Value {
    match value {
        Value::Number(n) if n.is_f64() => match n.as_f64() {
            Some(f) if f.is_finite() && f.fract() == 0.0 && f.abs() <= MAX_SAFE_INTEGER => {
                if f < 0.0 {
                    Value::from(f as i64)
                } else {
                    Value::from(f as u64)
                }
            }
            _ => Value::Number(n),
        },
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_numbers).collect()),
        Value::Object(map) => Value::Object(map.into_iter().map(|(k, v)| (k, normalize_numbers(v))).collect()),
        other => other,
    }
}

/// Structural equality where numbers compare by value (`2 == 2.0`).
pub fn json_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(x), Value::Array(y)) => x.len() == y.len() && x.iter().zip(y).all(|(x, y)| json_eq(x, y)),
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len() && x.iter().all(|(k, v)| y.get(k).is_some_and(|w| json_eq(v, w)))
        }
        _ => a == b,
    }
}

/// Coerce a JSON value to boolean using JavaScript-like truthiness.
pub fn value_to_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn evaluator() -> WorkflowEvaluator {
        WorkflowEvaluator::new()
    }

    fn state_ctx() -> Value {
        json!({
            "input": { "status": "pending", "items": [1, 2, 3] },
            "data": { "fetch": { "user": { "name": "Alice" } } },
            "env": { "__execution_id": "exec-1" },
            "context": {},
            "output": null
        })
    }

    #[test]
    fn test_strip_runtime_expression() {
        assert_eq!(strip_runtime_expression("${ input.a }"), Some("input.a"));
        assert_eq!(strip_runtime_expression("  ${input.a}  "), Some("input.a"));
        assert_eq!(strip_runtime_expression("input.a"), None);
        assert_eq!(strip_runtime_expression("$input"), None);
        assert!(is_runtime_expression("${ 1 + 1 }"));
    }

    #[test]
    fn test_dot_notation_nested() {
        let eval = evaluator();
        let result = eval
            .evaluate_value("data.fetch.user.name", &state_ctx())
            .unwrap();
        assert_eq!(result, json!("Alice"));
    }

    #[test]
    fn test_predicate_with_and_without_wrapper() {
        let eval = evaluator();
        let ctx = state_ctx();
        assert!(eval.evaluate_predicate("${ input.status == 'pending' }", &ctx).unwrap());
        assert!(eval.evaluate_predicate("input.status == 'pending'", &ctx).unwrap());
        assert!(!eval.evaluate_predicate("${ input.status == 'approved' }", &ctx).unwrap());
    }

    #[test]
    fn test_evaluate_string_passes_plain_text() {
        let eval = evaluator();
        assert_eq!(
            eval.evaluate_string("hello", &state_ctx()).unwrap(),
            json!("hello")
        );
        assert_eq!(
            eval.evaluate_string("${ env.__execution_id }", &state_ctx()).unwrap(),
            json!("exec-1")
        );
    }

    #[test]
    fn test_traverse_nested_structures() {
        let eval = evaluator();
        let template = json!({
            "name": "${ data.fetch.user.name|upper }",
            "count": "${ input.items|length }",
            "static": 42,
            "list": ["${ input.status }", "literal"]
        });
        let out = eval.traverse(&template, &state_ctx()).unwrap();
        assert_eq!(out["name"], json!("ALICE"));
        assert_eq!(out["count"], json!(3));
        assert_eq!(out["static"], json!(42));
        assert_eq!(out["list"], json!(["pending", "literal"]));
    }

    #[test]
    fn test_contains_on_arrays_and_strings() {
        let eval = evaluator();
        let ctx = state_ctx();
        assert!(eval.evaluate_bool("input.items|contains(2)", &ctx).unwrap());
        assert!(eval.evaluate_bool("input.status|contains('end')", &ctx).unwrap());
        assert!(!eval.evaluate_bool("input.items|contains(9)", &ctx).unwrap());
    }

    #[test]
    fn test_whole_numbers_stay_integers() {
        let eval = evaluator();
        let ctx = json!({ "data": { "total": 4, "n": 6, "ratio": 0.5 } });
        let sum = eval.evaluate_value("data.total + data.n", &ctx).unwrap();
        assert_eq!(sum, json!(10));
        assert!(sum.is_u64());
        assert_eq!(eval.evaluate_value("[1, 2]", &ctx).unwrap(), json!([1, 2]));
        assert_eq!(eval.evaluate_value("data.total - 7", &ctx).unwrap(), json!(-3));
        assert_eq!(eval.evaluate_value("data.ratio * 3", &ctx).unwrap(), json!(1.5));
        assert_eq!(eval.evaluate_value("{ a: 2 * 2 }", &ctx).unwrap(), json!({ "a": 4 }));
    }

    #[test]
    fn test_json_eq_compares_numbers_by_value() {
        assert!(json_eq(&json!(2), &json!(2.0)));
        assert!(json_eq(&json!({ "a": [1, 2.0] }), &json!({ "a": [1.0, 2] })));
        assert!(!json_eq(&json!(2), &json!("2")));
        assert!(!json_eq(&json!([1]), &json!([1, 2])));
    }

    #[test]
    fn test_missing_property_is_null() {
        let eval = evaluator();
        let result = eval.evaluate_value("data.nonexistent", &state_ctx()).unwrap();
        assert_eq!(result, json!(null));
    }

    #[test]
    fn test_invalid_context_not_object() {
        let eval = evaluator();
        let result = eval.evaluate_bool("true", &json!("not an object"));
        assert!(matches!(result, Err(ExpressionError::InvalidContext(_))));
    }

    #[test]
    fn test_eval_failure_names_expression() {
        let eval = evaluator();
        let err = eval.evaluate_value("input.(", &state_ctx()).unwrap_err();
        assert!(err.to_string().contains("input.("));
    }

    #[test]
    fn test_truthiness() {
        assert!(!value_to_bool(&json!(0)));
        assert!(!value_to_bool(&json!("")));
        assert!(!value_to_bool(&json!(null)));
        assert!(value_to_bool(&json!([])));
        assert!(value_to_bool(&json!("x")));
    }
}
