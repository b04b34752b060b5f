use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use common::{Error, Fingerprint};
use registry::RawCondition;

use crate::{ApiError, AppState};

/// Trigger history entries shown on the status endpoint.
const RECENT_TRIGGERS: i64 = 10;

/// Public, tenant-free endpoints.
pub fn condition_router() -> Router<AppState> {
    Router::new()
        .route("/api/conditions", post(register_condition))
        .route("/api/conditions/:id", get(condition_status))
        .route("/api/stats", get(stats))
}

// ─── Register ─────────────────────────────────────────────────────────────────

async fn register_condition(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let raw: RawCondition = serde_json::from_value(body)
        .map_err(|e| Error::Validation(format!("malformed condition: {e}")))?;
    let reg = state.registry.register(&raw).await?;

    let (code, status) = if reg.created {
        (StatusCode::CREATED, "registered")
    } else {
        (StatusCode::OK, "existing")
    };
    Ok((
        code,
        Json(json!({
            "condition_id": reg.fingerprint,
            "status": status,
        })),
    ))
}

// ─── Status ───────────────────────────────────────────────────────────────────

async fn condition_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let fp = Fingerprint::new(id);
    let status = state.registry.get_status(&fp).await?;
    let recent = state.trigger_log.recent(&fp, RECENT_TRIGGERS).await?;

    Ok(Json(json!({
        "condition": status.condition,
        "subscriber_count": status.subscriber_count,
        "status": if status.subscriber_count > 0 { "active" } else { "idle" },
        "recent_triggers": recent,
    })))
}

// ─── Stats ────────────────────────────────────────────────────────────────────

async fn stats(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let stats = state.registry.stats().await?;
    Ok(Json(json!(stats)))
}
