//! Axum router configuration with middleware.
//!
//! All routes are under `/api/v1/`.
//! Middleware: CORS, tracing.

use axum::Router;
use axum::extract::State;
use axum::routing::get;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::http::handlers;
use crate::state::AppState;

/// Build the complete API router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .nest("/api/v1", handlers::execution::execution_routes())
        .route("/health", get(health_check))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /health. Reports claim-check storage reachability and counters.
async fn health_check(State(state): State<AppState>) -> axum::Json<serde_json::Value> {
    let claim_check = if !state.claim_check.is_enabled() {
        json!({ "status": "disabled" })
    } else {
        let status = match state.claim_check.health().await {
            Ok(()) => "ok".to_string(),
            Err(e) => {
                tracing::warn!(error = %e, "claim-check store unhealthy");
                e.to_string()
            }
        };
        json!({ "status": status, "metrics": state.claim_check.metrics() })
    };
    let degraded = claim_check["status"] != "ok" && claim_check["status"] != "disabled";

    axum::Json(json!({
        "status": if degraded { "degraded" } else { "ok" },
        "version": env!("CARGO_PKG_VERSION"),
        "claimCheck": claim_check,
    }))
}
