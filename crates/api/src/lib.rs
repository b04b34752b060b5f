mod auth;
mod error;
pub mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{middleware, Router};
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use common::{Authorizer, Error, Result};
use evaluator::EvaluatorHandle;
use registry::{ConditionRegistry, SubscriptionStore, TriggerLog};

pub use error::ApiError;

/// Shared application state injected into every route handler.
#[derive(Clone)]
pub struct AppState {
    pub registry: ConditionRegistry,
    pub subs: SubscriptionStore,
    pub trigger_log: TriggerLog,
    pub authorizer: Arc<dyn Authorizer>,
    pub evaluator: EvaluatorHandle,
}

/// Public routes plus the bearer-protected subscription routes.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_headers(Any)
        .allow_methods(Any);

    let protected = routes::subscription_router().route_layer(middleware::from_fn_with_state(
        state.clone(),
        auth::require_auth,
    ));

    Router::new()
        .merge(routes::condition_router())
        .merge(protected)
        .merge(routes::health_router())
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// Build and run the API server until `shutdown` flips to true.
pub async fn serve(state: AppState, port: u16, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Condition API listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .map_err(|e| Error::Other(format!("API server error: {e}")))
}
