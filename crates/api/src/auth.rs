use axum::{
    extract::{Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::Response,
};

use common::Error;

use crate::{ApiError, AppState};

/// Resolve `Authorization: Bearer <token>` to a `Principal` and attach it to
/// the request. Everything behind this layer is tenant-scoped.
pub async fn require_auth(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| Error::Unauthorized("missing bearer token".into()))?;

    let principal = state.authorizer.authorize(token).await?;
    request.extensions_mut().insert(principal);
    Ok(next.run(request).await)
}
