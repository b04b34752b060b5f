use axum::{
    extract::{Path, State},
    routing::{delete, get},
    Extension, Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use common::{BotKind, Error, Fingerprint, Principal};

use crate::{ApiError, AppState};

/// Owner-scoped endpoints; mounted behind `require_auth`.
pub fn subscription_router() -> Router<AppState> {
    Router::new()
        .route("/api/subscriptions", get(list_subscriptions).post(subscribe))
        .route("/api/subscriptions/:id", delete(unsubscribe))
}

#[derive(Deserialize)]
struct SubscribeBody {
    bot_id: String,
    condition_id: String,
    bot_type: String,
    #[serde(default)]
    bot_config: Value,
}

async fn subscribe(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let body: SubscribeBody = serde_json::from_value(body)
        .map_err(|e| Error::Validation(format!("malformed subscription: {e}")))?;
    if body.bot_id.trim().is_empty() {
        return Err(Error::Validation("bot_id must not be empty".into()).into());
    }
    let kind: BotKind = body.bot_type.parse()?;
    let config = match body.bot_config {
        Value::Null => json!({}),
        Value::Object(map) => Value::Object(map),
        _ => return Err(Error::Validation("bot_config must be an object".into()).into()),
    };

    let id = state
        .subs
        .subscribe(
            &principal.owner_id,
            body.bot_id.trim(),
            &Fingerprint::new(body.condition_id),
            kind,
            &config,
        )
        .await?;

    Ok(Json(json!({
        "subscription_id": id,
        "status": "active",
    })))
}

async fn list_subscriptions(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<Value>, ApiError> {
    let subs = state.subs.list_for_user(&principal.owner_id).await?;
    Ok(Json(json!({
        "total": subs.len(),
        "subscriptions": subs,
    })))
}

async fn unsubscribe(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    // Foreign subscriptions look the same as missing ones.
    let sub = state.subs.get(&id).await?;
    if sub.owner_id != principal.owner_id {
        return Err(Error::NotFound(format!("subscription {id}")).into());
    }

    let changed = state.subs.unsubscribe(&id).await?;
    Ok(Json(json!({
        "subscription_id": id,
        "status": if changed { "unsubscribed" } else { "already_inactive" },
    })))
}
