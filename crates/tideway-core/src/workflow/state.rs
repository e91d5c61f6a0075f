//! Per-run mutable execution state.
//!
//! Owned by exactly one run (or one fork branch). Holds the run input, the
//! data namespace where task outputs land, the read-only environment, the
//! exported `context` namespace and the most recent task output.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use tideway_types::workflow::FlowDirective;

/// Reserved environment key carrying the execution id.
pub const ENV_EXECUTION_ID: &str = "__execution_id";
/// Reserved environment key carrying the tenant / organization id.
pub const ENV_ORG_ID: &str = "__org_id";

/// Build the run environment: reserved ids plus caller-provided variables.
/// Reserved keys always win over user values.
pub fn seed_env(execution_id: &str, org_id: Option<&str>, vars: &Map<String, Value>) -> Map<String, Value> {
    let mut env = vars.clone();
    env.insert(ENV_EXECUTION_ID.to_string(), json!(execution_id));
    env.insert(ENV_ORG_ID.to_string(), json!(org_id.unwrap_or_default()));
    env
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionState {
    input: Value,
    data: Map<String, Value>,
    env: Map<String, Value>,
    context: Map<String, Value>,
    output: Value,
    /// Directive set by a switch for the enclosing sequence to act on.
    pending_directive: Option<FlowDirective>,
    /// Task id to resume from after a continue-as-new.
    resume_from: Option<String>,
}

/// Serializable state carried across a continue-as-new boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub data: Map<String, Value>,
    #[serde(default)]
    pub context: Map<String, Value>,
    /// Id (`<name>-<index>`) of the first task the next run must execute.
    pub resume_from: String,
}

impl ExecutionState {
    pub fn new(input: Value, env: Map<String, Value>) -> Self {
        Self {
            input,
            env,
            ..Default::default()
        }
    }

    /// Rebuild state for a continued run from its snapshot.
    pub fn restore(input: Value, env: Map<String, Value>, snapshot: StateSnapshot) -> Self {
        Self {
            input,
            env,
            data: snapshot.data,
            context: snapshot.context,
            resume_from: Some(snapshot.resume_from),
            ..Default::default()
        }
    }

    pub fn snapshot(&self, resume_from: String) -> StateSnapshot {
        StateSnapshot {
            data: self.data.clone(),
            context: self.context.clone(),
            resume_from,
        }
    }

    // -- accessors ---------------------------------------------------------

    pub fn input(&self) -> &Value {
        &self.input
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.data
    }

    pub fn env(&self) -> &Map<String, Value> {
        &self.env
    }

    pub fn context(&self) -> &Map<String, Value> {
        &self.context
    }

    pub fn output(&self) -> &Value {
        &self.output
    }

    pub fn execution_id(&self) -> Option<&str> {
        self.env.get(ENV_EXECUTION_ID).and_then(Value::as_str)
    }

    // -- mutation ----------------------------------------------------------

    /// Merge `values` into the data namespace; later writes replace earlier.
    pub fn add_data(&mut self, values: Map<String, Value>) {
        self.data.extend(values);
    }

    pub fn set_field(&mut self, name: impl Into<String>, value: Value) {
        self.data.insert(name.into(), value);
    }

    pub fn remove_field(&mut self, name: &str) -> Option<Value> {
        self.data.remove(name)
    }

    pub fn set_output(&mut self, output: Value) {
        self.output = output;
    }

    pub fn export(&mut self, name: impl Into<String>, value: Value) {
        self.context.insert(name.into(), value);
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.data.get(name)
    }

    /// Resolve a dotted path (`fork.a.result`) inside the data namespace.
    /// Numeric segments index into arrays.
    pub fn field_path(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let mut current = self.data.get(segments.next()?)?;
        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    // -- flow control ------------------------------------------------------

    pub fn set_directive(&mut self, directive: FlowDirective) {
        self.pending_directive = Some(directive);
    }

    pub fn take_directive(&mut self) -> Option<FlowDirective> {
        self.pending_directive.take()
    }

    pub fn resume_from(&self) -> Option<&str> {
        self.resume_from.as_deref()
    }

    pub fn clear_resume(&mut self) {
        self.resume_from = None;
    }

    // -- branching ---------------------------------------------------------

    /// Isolated copy for a fork branch or loop iteration. Output and any
    /// pending directive are cleared; writes never reach the parent.
    pub fn branch(&self) -> Self {
        Self {
            input: self.input.clone(),
            data: self.data.clone(),
            env: self.env.clone(),
            context: self.context.clone(),
            output: Value::Null,
            pending_directive: None,
            resume_from: None,
        }
    }

    /// The object expressions evaluate against.
    pub fn expression_context(&self) -> Value {
        json!({
            "input": self.input,
            "data": self.data,
            "env": self.env,
            "context": self.context,
            "output": self.output,
        })
    }
}
