use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};

use crate::AppState;

pub fn health_router() -> Router<AppState> {
    Router::new().route("/healthz", get(healthz))
}

/// Health check endpoint. No auth required.
async fn healthz(State(state): State<AppState>) -> Json<Value> {
    let status = state.evaluator.status().await;
    Json(json!({
        "status": "ok",
        "evaluator": {
            "cycles": status.cycles,
            "last_cycle_at": status.last_cycle_at,
            "last_report": status.last_report,
        },
    }))
}
