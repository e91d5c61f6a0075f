//! Execution handlers for the REST API.
//!
//! Submitting an execution persists it as `PENDING` and starts the run in
//! the background. Progress can be polled or followed over SSE.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::Stream;
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use tideway_core::execution::StreamBroker;
use tideway_core::workflow::validation;
use tideway_types::execution::{ExecutionPhase, ValidationResult, WorkflowExecution};

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

const KEEP_ALIVE: Duration = Duration::from_secs(15);

// ---------------------------------------------------------------------------
// Request bodies and query parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateExecutionRequest {
    /// Workflow document, YAML or JSON.
    pub workflow: String,
    #[serde(default = "empty_object")]
    pub input: Value,
    pub org_id: Option<String>,
}

fn empty_object() -> Value {
    json!({})
}

#[derive(Debug, Deserialize, Default)]
pub struct ListExecutionsQuery {
    pub phase: Option<ExecutionPhase>,
    /// Maximum number of executions to return, newest first.
    pub limit: Option<usize>,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn execution_routes() -> Router<AppState> {
    Router::new()
        .route("/executions", post(create_execution).get(list_executions))
        .route("/executions/{id}", get(get_execution).delete(delete_execution))
        .route("/executions/{id}/stream", get(stream_execution))
        .route("/executions/{id}/cancel", post(cancel_execution))
        .route("/executions/{id}/signals/{name}", post(signal_execution))
        .route("/validate", post(validate_workflow))
}

async fn load(state: &AppState, id: &Uuid) -> Result<WorkflowExecution, AppError> {
    state
        .executions
        .get(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("execution '{id}' not found")))
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// POST /api/v1/executions
pub async fn create_execution(
    State(state): State<AppState>,
    Json(body): Json<CreateExecutionRequest>,
) -> Result<(StatusCode, Json<ApiResponse<WorkflowExecution>>), AppError> {
    let start = Instant::now();

    // Reject broken documents before anything is persisted.
    let result = validation::validate(body.workflow.clone().into_bytes()).await;
    if !result.is_valid() {
        return Err(AppError::Validation(result.errors.join("; ")));
    }

    let execution = state.submit(body.workflow, body.input, body.org_id).await?;
    state.start(execution.clone());

    let id = execution.id;
    let resp = ApiResponse::success(execution, start)
        .with_link("self", &format!("/api/v1/executions/{id}"))
        .with_link("stream", &format!("/api/v1/executions/{id}/stream"));
    Ok((StatusCode::ACCEPTED, Json(resp)))
}

/// GET /api/v1/executions
pub async fn list_executions(
    State(state): State<AppState>,
    Query(query): Query<ListExecutionsQuery>,
) -> Result<Json<ApiResponse<Vec<WorkflowExecution>>>, AppError> {
    let start = Instant::now();

    let mut executions = state.executions.list().await?;
    if let Some(phase) = query.phase {
        executions.retain(|e| e.status.phase == phase);
    }
    executions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    if let Some(limit) = query.limit {
        executions.truncate(limit);
    }

    Ok(Json(ApiResponse::success(executions, start).with_link("self", "/api/v1/executions")))
}

/// GET /api/v1/executions/{id}
pub async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<WorkflowExecution>>, AppError> {
    let start = Instant::now();
    let execution = load(&state, &id).await?;
    Ok(Json(
        ApiResponse::success(execution, start).with_link("self", &format!("/api/v1/executions/{id}")),
    ))
}

/// DELETE /api/v1/executions/{id}. Only finished executions can be deleted.
pub async fn delete_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let start = Instant::now();
    let execution = load(&state, &id).await?;
    if !execution.status.phase.is_terminal() {
        return Err(AppError::Conflict(format!(
            "execution '{id}' is {}; cancel it first",
            execution.status.phase
        )));
    }
    let deleted = state.executions.delete(&id).await?;
    tracing::info!(execution_id = %id, "execution deleted");
    Ok(Json(ApiResponse::success(json!({ "deleted": deleted }), start)))
}

/// POST /api/v1/executions/{id}/cancel
pub async fn cancel_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let start = Instant::now();
    let execution = load(&state, &id).await?;
    if execution.status.phase.is_terminal() {
        return Err(AppError::Conflict(format!(
            "execution '{id}' already finished as {}",
            execution.status.phase
        )));
    }
    if !state.substrate.cancel(&id.to_string()) {
        return Err(AppError::Conflict(format!("execution '{id}' has no active run")));
    }
    Ok(Json(ApiResponse::success(json!({ "cancelled": true }), start)))
}

/// POST /api/v1/executions/{id}/signals/{name}. The body is the payload.
pub async fn signal_execution(
    State(state): State<AppState>,
    Path((id, name)): Path<(Uuid, String)>,
    body: Bytes,
) -> Result<(StatusCode, Json<ApiResponse<Value>>), AppError> {
    let start = Instant::now();
    let payload = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).map_err(|e| AppError::Validation(format!("signal payload is not JSON: {e}")))?
    };
    state.substrate.signal(&id.to_string(), &name, payload)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ApiResponse::success(json!({ "signal": name }), start)),
    ))
}

/// POST /api/v1/validate. The body is the raw document.
pub async fn validate_workflow(
    State(state): State<AppState>,
    document: String,
) -> Json<ApiResponse<ValidationResult>> {
    let start = Instant::now();
    let result = state.runner.validate(&document).await;
    Json(ApiResponse::success(result, start))
}

/// Unsubscribes when the SSE stream is dropped, including on disconnect.
struct SubscriptionGuard {
    broker: Arc<StreamBroker>,
    execution_id: String,
    id: u64,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.broker.unsubscribe(&self.execution_id, self.id);
    }
}

fn status_event(execution: &WorkflowExecution) -> Event {
    let data = serde_json::to_string(execution).unwrap_or_else(|_| "{}".to_string());
    Event::default().event("status").data(data)
}

/// GET /api/v1/executions/{id}/stream
///
/// Emits the current snapshot, then every update, and closes after the
/// execution reaches a terminal phase.
pub async fn stream_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    // Subscribe before reading so no update falls between the two.
    let mut subscription = state.broker.subscribe(&id.to_string());
    let guard = SubscriptionGuard {
        broker: Arc::clone(&state.broker),
        execution_id: subscription.execution_id.clone(),
        id: subscription.id,
    };
    let current = load(&state, &id).await?;

    let sse_stream = async_stream::stream! {
        let _guard = guard;
        let finished = current.status.phase.is_terminal();
        yield Ok::<_, Infallible>(status_event(&current));
        if !finished {
            while let Some(update) = subscription.receiver.recv().await {
                yield Ok(status_event(&update));
                if update.status.phase.is_terminal() {
                    break;
                }
            }
        }
        yield Ok(Event::default().event("done").data("{}"));
    };

    Ok(Sse::new(sse_stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE)))
}
