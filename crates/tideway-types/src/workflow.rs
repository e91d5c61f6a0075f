//! Workflow document model for Tideway.
//!
//! Mirrors the Serverless Workflow task model: a `document` header, optional
//! workflow-level timeout, and an ordered `do` list of named tasks. Each task
//! entry is a single-key mapping (`- fetch: { call: http, ... }`) whose kind
//! is decided by which discriminating key it carries.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A parsed workflow document. Immutable once loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Document header (DSL version, identity, engine hints).
    pub document: DocumentMeta,
    /// Optional input schema or defaults, carried through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    /// Workflow-level timeout, used as the default activity start-to-close.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<TimeoutSpec>,
    /// Top-level task sequence.
    #[serde(rename = "do", default)]
    pub tasks: TaskList,
}

impl WorkflowDefinition {
    /// Look up a document metadata entry (`activityOptions`, `searchAttributes`, ...).
    pub fn metadata(&self, key: &str) -> Option<&Value> {
        self.document.metadata.get(key)
    }
}

/// The `document` header of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMeta {
    /// DSL version the document targets (e.g. "1.0.0").
    pub dsl: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Free-form engine hints. Unknown keys are ignored.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

/// `timeout: { after: <duration> }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSpec {
    pub after: DurationSpec,
}

// ---------------------------------------------------------------------------
// Durations
// ---------------------------------------------------------------------------

/// Errors produced when converting a [`DurationSpec`] to a `Duration`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DurationError {
    #[error("invalid ISO 8601 duration '{0}'")]
    InvalidIso(String),

    #[error("duration component overflow")]
    Overflow,
}

/// A duration written either as ISO 8601 (`PT5S`, `P1DT2H`) or inline
/// (`{ seconds: 5 }`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DurationSpec {
    Iso(String),
    Inline(InlineDuration),
}

/// Inline duration object. All fields are additive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InlineDuration {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub days: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub hours: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub minutes: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub seconds: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub milliseconds: u64,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

impl DurationSpec {
    pub fn from_duration(duration: Duration) -> Self {
        DurationSpec::Inline(InlineDuration {
            milliseconds: duration.as_millis() as u64,
            ..Default::default()
        })
    }

    /// Convert to a `std::time::Duration`.
    pub fn to_duration(&self) -> Result<Duration, DurationError> {
        match self {
            DurationSpec::Inline(d) => {
                let secs = d
                    .days
                    .checked_mul(86_400)
                    .and_then(|s| s.checked_add(d.hours.checked_mul(3_600)?))
                    .and_then(|s| s.checked_add(d.minutes.checked_mul(60)?))
                    .and_then(|s| s.checked_add(d.seconds))
                    .ok_or(DurationError::Overflow)?;
                Ok(Duration::from_secs(secs) + Duration::from_millis(d.milliseconds))
            }
            DurationSpec::Iso(s) => parse_iso8601_duration(s),
        }
    }
}

/// Parse the subset of ISO 8601 durations used by workflow documents:
/// `P[nW][nD][T[nH][nM][n[.f]S]]`. Years and months are rejected because
/// they have no fixed length.
pub fn parse_iso8601_duration(input: &str) -> Result<Duration, DurationError> {
    let invalid = || DurationError::InvalidIso(input.to_string());
    let rest = input.trim().strip_prefix('P').ok_or_else(invalid)?;
    if rest.is_empty() {
        return Err(invalid());
    }

    let mut total = Duration::ZERO;
    let mut in_time = false;
    let mut number = String::new();
    let mut saw_component = false;

    for c in rest.chars() {
        match c {
            'T' if !in_time && number.is_empty() => in_time = true,
            '0'..='9' | '.' => number.push(c),
            unit => {
                if number.is_empty() {
                    return Err(invalid());
                }
                let value: f64 = number.parse().map_err(|_| invalid())?;
                let secs = match (unit, in_time) {
                    ('W', false) => value * 604_800.0,
                    ('D', false) => value * 86_400.0,
                    ('H', true) => value * 3_600.0,
                    ('M', true) => value * 60.0,
                    ('S', true) => value,
                    _ => return Err(invalid()),
                };
                if !secs.is_finite() || secs < 0.0 {
                    return Err(DurationError::Overflow);
                }
                total += Duration::from_secs_f64(secs);
                number.clear();
                saw_component = true;
            }
        }
    }

    if !number.is_empty() || !saw_component {
        return Err(invalid());
    }
    Ok(total)
}

// ---------------------------------------------------------------------------
// Task list and task node
// ---------------------------------------------------------------------------

/// Ordered list of named tasks, serialized as a list of single-key maps.
#[derive(Debug, Clone, Default)]
pub struct TaskList(pub Vec<TaskNode>);

impl TaskList {
    pub fn iter(&self) -> std::slice::Iter<'_, TaskNode> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Position of the task with the given name, if any.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.0.iter().position(|t| t.name == name)
    }
}

impl<'de> Deserialize<'de> for TaskList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let entries = Vec::<Map<String, Value>>::deserialize(deserializer)?;
        let mut tasks = Vec::with_capacity(entries.len());
        for (name, value) in single_key_entries(entries).map_err(D::Error::custom)? {
            tasks.push(TaskNode::from_entry(name, value).map_err(D::Error::custom)?);
        }
        Ok(TaskList(tasks))
    }
}

impl Serialize for TaskList {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeSeq;
        let mut seq = serializer.serialize_seq(Some(self.0.len()))?;
        for task in &self.0 {
            let mut entry = Map::new();
            let body = task
                .body_value()
                .map_err(<S::Error as serde::ser::Error>::custom)?;
            entry.insert(task.name.clone(), body);
            seq.serialize_element(&entry)?;
        }
        seq.end()
    }
}

/// Split `[{a: ..}, {b: ..}]` into `(name, value)` pairs, rejecting entries
/// that do not hold exactly one key.
fn single_key_entries(entries: Vec<Map<String, Value>>) -> Result<Vec<(String, Value)>, String> {
    entries
        .into_iter()
        .enumerate()
        .map(|(idx, entry)| {
            if entry.len() != 1 {
                return Err(format!(
                    "entry {idx} must contain exactly one named item, found {}",
                    entry.len()
                ));
            }
            entry
                .into_iter()
                .next()
                .ok_or_else(|| format!("entry {idx} is empty"))
        })
        .collect()
}

/// A single named task.
#[derive(Debug, Clone)]
pub struct TaskNode {
    /// Unique within the enclosing scope.
    pub name: String,
    /// Fields shared by every task kind.
    pub base: TaskBase,
    /// Kind-specific configuration.
    pub kind: TaskKind,
}

/// Fields common to all task kinds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskBase {
    /// Guard expression; the task is skipped when it evaluates falsy.
    #[serde(rename = "if", default, skip_serializing_if = "Option::is_none")]
    pub if_: Option<String>,
    /// Flow directive applied after the task completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub then: Option<FlowDirective>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export: Option<Transform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Transform>,
    /// Task-level timeout. Bounds Listen waits and overrides the
    /// start-to-close timeout of call tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<TimeoutSpec>,
    /// Per-task engine hints (`activityOptions`, `timeout`, ...).
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

/// `output: { as: ... }` / `export: { as: ... }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transform {
    #[serde(rename = "as")]
    pub as_: Value,
}

/// What to do after a task completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FlowDirective {
    Continue,
    Exit,
    End,
    Goto(String),
}

impl FlowDirective {
    /// True for directives that stop the enclosing sequence.
    pub fn terminates(&self) -> bool {
        matches!(self, FlowDirective::Exit | FlowDirective::End)
    }
}

impl From<String> for FlowDirective {
    fn from(s: String) -> Self {
        match s.as_str() {
            "continue" => FlowDirective::Continue,
            "exit" => FlowDirective::Exit,
            "end" => FlowDirective::End,
            _ => FlowDirective::Goto(s),
        }
    }
}

impl From<FlowDirective> for String {
    fn from(d: FlowDirective) -> Self {
        match d {
            FlowDirective::Continue => "continue".to_string(),
            FlowDirective::Exit => "exit".to_string(),
            FlowDirective::End => "end".to_string(),
            FlowDirective::Goto(target) => target,
        }
    }
}

// ---------------------------------------------------------------------------
// Task kinds
// ---------------------------------------------------------------------------

/// Discriminator for [`TaskKind`], used as the factory registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskKindTag {
    Set,
    CallHttp,
    CallGrpc,
    CallFunction,
    Switch,
    For,
    Fork,
    Try,
    Wait,
    Raise,
    Listen,
    Do,
    Unrecognized,
}

impl TaskKindTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKindTag::Set => "set",
            TaskKindTag::CallHttp => "call_http",
            TaskKindTag::CallGrpc => "call_grpc",
            TaskKindTag::CallFunction => "call_function",
            TaskKindTag::Switch => "switch",
            TaskKindTag::For => "for",
            TaskKindTag::Fork => "fork",
            TaskKindTag::Try => "try",
            TaskKindTag::Wait => "wait",
            TaskKindTag::Raise => "raise",
            TaskKindTag::Listen => "listen",
            TaskKindTag::Do => "do",
            TaskKindTag::Unrecognized => "unrecognized",
        }
    }
}

impl std::fmt::Display for TaskKindTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-specific task configuration.
#[derive(Debug, Clone)]
pub enum TaskKind {
    /// `set: { key: value | "${ expr }" }` or `set: "${ expr }"`.
    Set(Value),
    CallHttp(HttpCallArgs),
    CallGrpc(GrpcCallArgs),
    /// `call: <function>` with free-form `with` arguments.
    CallFunction { function: String, with: Value },
    Switch(Vec<SwitchCase>),
    For(ForTask),
    Fork(ForkSpec),
    Try(TryTask),
    Wait(DurationSpec),
    Raise(RaiseSpec),
    Listen(ListenSpec),
    Do(TaskList),
    /// The entry carried none of the known discriminating keys.
    Unrecognized { keys: Vec<String> },
}

impl TaskKind {
    pub fn tag(&self) -> TaskKindTag {
        match self {
            TaskKind::Set(_) => TaskKindTag::Set,
            TaskKind::CallHttp(_) => TaskKindTag::CallHttp,
            TaskKind::CallGrpc(_) => TaskKindTag::CallGrpc,
            TaskKind::CallFunction { .. } => TaskKindTag::CallFunction,
            TaskKind::Switch(_) => TaskKindTag::Switch,
            TaskKind::For(_) => TaskKindTag::For,
            TaskKind::Fork(_) => TaskKindTag::Fork,
            TaskKind::Try(_) => TaskKindTag::Try,
            TaskKind::Wait(_) => TaskKindTag::Wait,
            TaskKind::Raise(_) => TaskKindTag::Raise,
            TaskKind::Listen(_) => TaskKindTag::Listen,
            TaskKind::Do(_) => TaskKindTag::Do,
            TaskKind::Unrecognized { .. } => TaskKindTag::Unrecognized,
        }
    }
}

/// HTTP call arguments (`call: http`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpCallArgs {
    pub method: String,
    pub endpoint: Endpoint,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub query: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default)]
    pub output: HttpOutputFormat,
    /// Follow redirects instead of failing on 3xx.
    #[serde(default)]
    pub redirect: bool,
}

/// `endpoint: "https://..."` or `endpoint: { uri: "https://..." }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Endpoint {
    Uri(String),
    Config { uri: String },
}

impl Endpoint {
    pub fn uri(&self) -> &str {
        match self {
            Endpoint::Uri(u) | Endpoint::Config { uri: u } => u,
        }
    }
}

/// Shape of the value an HTTP call produces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpOutputFormat {
    /// Parsed body only (JSON when possible, otherwise text).
    #[default]
    Content,
    /// `{ request, statusCode, headers, content }`.
    Response,
    /// Base64-encoded body.
    Raw,
}

/// gRPC call arguments (`call: grpc`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrpcCallArgs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proto: Option<ProtoRef>,
    pub service: GrpcService,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtoRef {
    pub endpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrpcService {
    /// Fully-qualified service name (`package.Service`).
    pub name: String,
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// One named switch case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchCase {
    #[serde(skip)]
    pub name: String,
    /// Predicate; a case without one is the default case.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    pub then: FlowDirective,
}

/// `for` loop task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForTask {
    #[serde(rename = "for")]
    pub for_: ForSpec,
    #[serde(rename = "while", default, skip_serializing_if = "Option::is_none")]
    pub while_: Option<String>,
    #[serde(rename = "do")]
    pub do_: TaskList,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForSpec {
    /// Variable bound to the current element (default `item`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub each: Option<String>,
    /// Collection expression (array, object or integer count).
    #[serde(rename = "in")]
    pub in_: Value,
    /// Variable bound to the current index or key (default `index`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<String>,
}

/// `fork` configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForkSpec {
    pub branches: TaskList,
    /// Race mode: first branch to finish wins.
    #[serde(default)]
    pub compete: bool,
    /// In wait-for-all mode, cancel siblings on the first failure.
    #[serde(default = "default_true")]
    pub fail_fast: bool,
}

fn default_true() -> bool {
    true
}

/// `try` / `catch` / `finally` task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TryTask {
    #[serde(rename = "try")]
    pub try_: TaskList,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catch: Option<CatchSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finally: Option<TaskList>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatchSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<CatchErrors>,
    /// Name the caught error is bound to (default `error`).
    #[serde(rename = "as", default, skip_serializing_if = "Option::is_none")]
    pub as_: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub except_when: Option<String>,
    #[serde(rename = "do", default, skip_serializing_if = "Option::is_none")]
    pub do_: Option<TaskList>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatchErrors {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with: Option<ErrorFilter>,
}

/// Matches a caught error by type and/or status.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorFilter {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

/// `raise: { error: ... }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaiseSpec {
    pub error: ErrorSpec,
}

/// Structured error definition. `title` and `detail` may be expressions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorSpec {
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// `listen: { to: ... }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenSpec {
    pub to: ListenTo,
}

/// Event consumption strategy. Exactly one of `all`, `any`, `one` is used.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListenTo {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub all: Vec<EventFilter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub any: Vec<EventFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub one: Option<EventFilter>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFilter {
    pub with: EventProperties,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventProperties {
    /// Signal name.
    pub id: String,
    #[serde(rename = "type")]
    pub type_: String,
    /// Expression deciding whether a received payload completes the listener.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accept_if: Option<Value>,
    /// Template for the value the listener yields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

// ---------------------------------------------------------------------------
// Entry parsing and serialization
// ---------------------------------------------------------------------------

impl TaskNode {
    /// Classify a `(name, body)` entry into a typed task.
    ///
    /// Kind detection checks the composite kinds (`for`, `fork`, `try`,
    /// `switch`) before `do`, since `for` bodies also carry a `do` key.
    pub fn from_entry(name: String, value: Value) -> Result<Self, String> {
        let Value::Object(obj) = value else {
            return Err(format!("task '{name}' must be a mapping"));
        };

        let base: TaskBase = serde_json::from_value(Value::Object(obj.clone()))
            .map_err(|e| format!("task '{name}': {e}"))?;

        let parse = |v: Value| -> Result<TaskKind, String> {
            let err = |e: serde_json::Error| format!("task '{name}': {e}");
            if let Some(call) = obj.get("call") {
                let call = call
                    .as_str()
                    .ok_or_else(|| format!("task '{name}': call must be a string"))?;
                let with = obj.get("with").cloned().unwrap_or(Value::Object(Map::new()));
                return Ok(match call {
                    "http" => TaskKind::CallHttp(serde_json::from_value(with).map_err(err)?),
                    "grpc" => TaskKind::CallGrpc(serde_json::from_value(with).map_err(err)?),
                    function => TaskKind::CallFunction {
                        function: function.to_string(),
                        with,
                    },
                });
            }
            if obj.contains_key("for") {
                return Ok(TaskKind::For(serde_json::from_value(v).map_err(err)?));
            }
            if let Some(fork) = obj.get("fork") {
                return Ok(TaskKind::Fork(serde_json::from_value(fork.clone()).map_err(err)?));
            }
            if obj.contains_key("try") {
                return Ok(TaskKind::Try(serde_json::from_value(v).map_err(err)?));
            }
            if let Some(switch) = obj.get("switch") {
                let entries: Vec<Map<String, Value>> =
                    serde_json::from_value(switch.clone()).map_err(err)?;
                let mut cases = Vec::with_capacity(entries.len());
                for (case_name, case) in single_key_entries(entries)
                    .map_err(|e| format!("task '{name}': switch {e}"))?
                {
                    let mut case: SwitchCase = serde_json::from_value(case).map_err(err)?;
                    case.name = case_name;
                    cases.push(case);
                }
                return Ok(TaskKind::Switch(cases));
            }
            if let Some(set) = obj.get("set") {
                return Ok(TaskKind::Set(set.clone()));
            }
            if let Some(wait) = obj.get("wait") {
                return Ok(TaskKind::Wait(serde_json::from_value(wait.clone()).map_err(err)?));
            }
            if let Some(raise) = obj.get("raise") {
                return Ok(TaskKind::Raise(serde_json::from_value(raise.clone()).map_err(err)?));
            }
            if let Some(listen) = obj.get("listen") {
                return Ok(TaskKind::Listen(serde_json::from_value(listen.clone()).map_err(err)?));
            }
            if let Some(body) = obj.get("do") {
                return Ok(TaskKind::Do(serde_json::from_value(body.clone()).map_err(err)?));
            }
            Ok(TaskKind::Unrecognized {
                keys: obj.keys().cloned().collect(),
            })
        };

        let kind = parse(Value::Object(obj.clone()))?;
        Ok(TaskNode { name, base, kind })
    }

    /// Serialize the task body (everything under the task's name).
    pub fn body_value(&self) -> Result<Value, serde_json::Error> {
        let mut body = match serde_json::to_value(&self.base)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };

        let kind_fields: Value = match &self.kind {
            TaskKind::Set(set) => serde_json::json!({ "set": set }),
            TaskKind::CallHttp(args) => serde_json::json!({ "call": "http", "with": args }),
            TaskKind::CallGrpc(args) => serde_json::json!({ "call": "grpc", "with": args }),
            TaskKind::CallFunction { function, with } => {
                serde_json::json!({ "call": function, "with": with })
            }
            TaskKind::Switch(cases) => {
                let mut list = Vec::with_capacity(cases.len());
                for case in cases {
                    let mut entry = Map::new();
                    entry.insert(case.name.clone(), serde_json::to_value(case)?);
                    list.push(Value::Object(entry));
                }
                serde_json::json!({ "switch": list })
            }
            TaskKind::For(task) => serde_json::to_value(task)?,
            TaskKind::Fork(spec) => serde_json::json!({ "fork": spec }),
            TaskKind::Try(task) => serde_json::to_value(task)?,
            TaskKind::Wait(d) => serde_json::json!({ "wait": d }),
            TaskKind::Raise(spec) => serde_json::json!({ "raise": spec }),
            TaskKind::Listen(spec) => serde_json::json!({ "listen": spec }),
            TaskKind::Do(list) => serde_json::json!({ "do": list }),
            TaskKind::Unrecognized { .. } => Value::Object(Map::new()),
        };

        if let Value::Object(fields) = kind_fields {
            body.extend(fields);
        }
        Ok(Value::Object(body))
    }
}

// ---------------------------------------------------------------------------
// Activity options (document / task metadata `activityOptions`)
// ---------------------------------------------------------------------------

/// Metadata key carrying activity option overrides.
pub const METADATA_ACTIVITY_OPTIONS: &str = "activityOptions";
/// Metadata key carrying search attributes to upsert on the run.
pub const METADATA_SEARCH_ATTRIBUTES: &str = "searchAttributes";
/// Metadata key capping history length before continue-as-new.
pub const METADATA_CAN_MAX_HISTORY_LENGTH: &str = "canMaxHistoryLength";

/// Partial activity options. Every field is an override; `None` keeps the
/// value inherited from the enclosing level.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityOptionsSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_to_close_timeout: Option<DurationSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_to_start_timeout: Option<DurationSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_to_close_timeout: Option<DurationSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicySpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<PrioritySpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_queue: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_interval: Option<DurationSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_coefficient: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum_interval: Option<DurationSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub non_retryable_error_types: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrioritySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_key: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fairness_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fairness_weight: Option<f32>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SAMPLE: &str = r#"
document:
  dsl: "1.0.0"
  namespace: examples
  name: order-pipeline
  version: "0.1.0"
  metadata:
    canMaxHistoryLength: 500
timeout:
  after: PT10M
do:
  - init:
      set:
        status: "${ input.status }"
  - route:
      switch:
        - approved:
            when: "${ data.status == 'approved' }"
            then: ship
        - fallback:
            then: end
  - ship:
      call: http
      with:
        method: post
        endpoint:
          uri: https://example.com/ship
        body:
          id: 42
  - fanout:
      fork:
        compete: false
        branches:
          - left:
              set:
                side: left
          - right:
              set:
                side: right
  - guarded:
      try:
        - boom:
            raise:
              error:
                type: https://example.com/errors/boom
                status: 500
      catch:
        as: failure
        do:
          - recover:
              set:
                recovered: true
  - pause:
      wait:
        seconds: 2
  - each:
      for:
        in: "${ input.items }"
      do:
        - touch:
            call: audit
            with:
              item: "${ data.item }"
"#;

    fn sample() -> WorkflowDefinition {
        serde_yaml_ng::from_str(SAMPLE).expect("sample parses")
    }

    #[test]
    fn parses_all_task_kinds() {
        let def = sample();
        assert_eq!(def.document.name, "order-pipeline");
        let tags: Vec<TaskKindTag> = def.tasks.iter().map(|t| t.kind.tag()).collect();
        assert_eq!(
            tags,
            vec![
                TaskKindTag::Set,
                TaskKindTag::Switch,
                TaskKindTag::CallHttp,
                TaskKindTag::Fork,
                TaskKindTag::Try,
                TaskKindTag::Wait,
                TaskKindTag::For,
            ]
        );
    }

    #[test]
    fn switch_cases_keep_order_and_names() {
        let def = sample();
        let TaskKind::Switch(cases) = &def.tasks.0[1].kind else {
            panic!("expected switch");
        };
        assert_eq!(cases[0].name, "approved");
        assert_eq!(cases[0].then, FlowDirective::Goto("ship".into()));
        assert!(cases[1].when.is_none());
        assert_eq!(cases[1].then, FlowDirective::End);
    }

    #[test]
    fn fork_defaults_to_fail_fast() {
        let def = sample();
        let TaskKind::Fork(spec) = &def.tasks.0[3].kind else {
            panic!("expected fork");
        };
        assert!(spec.fail_fast);
        assert!(!spec.compete);
        assert_eq!(spec.branches.len(), 2);
    }

    #[test]
    fn call_with_unknown_name_is_function() {
        let def = sample();
        let TaskKind::For(each) = &def.tasks.0[6].kind else {
            panic!("expected for");
        };
        match &each.do_.0[0].kind {
            TaskKind::CallFunction { function, with } => {
                assert_eq!(function, "audit");
                assert_eq!(with["item"], json!("${ data.item }"));
            }
            other => panic!("expected call function, got {:?}", other.tag()),
        }
    }

    #[test]
    fn unknown_task_shape_is_kept_as_unrecognized() {
        let list: TaskList = serde_json::from_value(json!([
            { "mystery": { "emit": { "event": "x" } } }
        ]))
        .unwrap();
        match &list.0[0].kind {
            TaskKind::Unrecognized { keys } => assert_eq!(keys, &vec!["emit".to_string()]),
            other => panic!("unexpected kind {:?}", other.tag()),
        }
    }

    #[test]
    fn multi_key_entry_is_rejected() {
        let err = serde_json::from_value::<TaskList>(json!([
            { "a": { "set": {} }, "b": { "set": {} } }
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("exactly one"), "got: {err}");
    }

    #[test]
    fn serialize_roundtrip_preserves_structure() {
        let def = sample();
        let yaml = serde_yaml_ng::to_string(&def).unwrap();
        let again: WorkflowDefinition = serde_yaml_ng::from_str(&yaml).unwrap();
        assert_eq!(again.tasks.len(), def.tasks.len());
        assert!(yaml.contains("call: http"));
        assert!(yaml.contains("failFast: true"));
    }

    #[test]
    fn iso_durations_parse() {
        assert_eq!(parse_iso8601_duration("PT5S").unwrap(), Duration::from_secs(5));
        assert_eq!(
            parse_iso8601_duration("P1DT2H30M").unwrap(),
            Duration::from_secs(86_400 + 2 * 3_600 + 30 * 60)
        );
        assert_eq!(
            parse_iso8601_duration("PT0.5S").unwrap(),
            Duration::from_millis(500)
        );
        assert!(parse_iso8601_duration("P1M").is_err());
        assert!(parse_iso8601_duration("5S").is_err());
        assert!(parse_iso8601_duration("PT").is_err());
    }

    #[test]
    fn inline_duration_sums_fields() {
        let spec = DurationSpec::Inline(InlineDuration {
            minutes: 1,
            seconds: 30,
            milliseconds: 250,
            ..Default::default()
        });
        assert_eq!(spec.to_duration().unwrap(), Duration::from_millis(90_250));
    }

    #[test]
    fn flow_directive_from_string() {
        assert_eq!(FlowDirective::from("exit".to_string()), FlowDirective::Exit);
        assert!(FlowDirective::End.terminates());
        assert!(!FlowDirective::Goto("x".into()).terminates());
    }
}
