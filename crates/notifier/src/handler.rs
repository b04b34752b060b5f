use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use common::{BotKind, Error, Fingerprint, Result, Subscription, Timeframe, TriggerEvent};

/// The trigger as seen by an action handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerInfo {
    pub fingerprint: Fingerprint,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub value: f64,
    pub triggered_at: DateTime<Utc>,
}

/// One dispatch: a subscribed bot plus the trigger that woke it.
///
/// The bus is at-least-once, so handlers may see the same request twice
/// and must treat it idempotently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub bot_id: String,
    pub bot_type: BotKind,
    pub bot_config: serde_json::Value,
    pub trigger: TriggerInfo,
}

impl ActionRequest {
    pub fn new(sub: &Subscription, event: &TriggerEvent) -> Self {
        Self {
            bot_id: sub.bot_id.clone(),
            bot_type: sub.bot_kind,
            bot_config: sub.bot_config.clone(),
            trigger: TriggerInfo {
                fingerprint: event.fingerprint.clone(),
                symbol: event.symbol.clone(),
                timeframe: event.timeframe,
                value: event.payload.value,
                triggered_at: event.triggered_at,
            },
        }
    }
}

/// Turns a trigger into a bot-specific trading action.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, request: &ActionRequest) -> Result<()>;
}

/// Bot kind → handler routing.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<BotKind, Arc<dyn ActionHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any handler already registered for `kind`.
    pub fn register(&mut self, kind: BotKind, handler: Arc<dyn ActionHandler>) -> &mut Self {
        self.handlers.insert(kind, handler);
        self
    }

    pub fn get(&self, kind: BotKind) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<BotKind> {
        let mut kinds: Vec<_> = self.handlers.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// POSTs the action request as JSON to a bot service endpoint.
pub struct HttpActionHandler {
    url: String,
    http: Client,
}

impl HttpActionHandler {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .use_rustls_tls()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            url: url.into(),
            http,
        })
    }
}

#[async_trait]
impl ActionHandler for HttpActionHandler {
    async fn handle(&self, request: &ActionRequest) -> Result<()> {
        let resp = self
            .http
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| Error::Http(format!("action handler request failed: {e}")))?;

        let status = resp.status();
        if status.is_success() {
            debug!(bot = %request.bot_id, url = %self.url, %status, "Action accepted");
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        if status.is_server_error() {
            Err(Error::ServiceUnavailable(format!("action handler HTTP {status}: {body}")))
        } else {
            Err(Error::Other(format!("action handler HTTP {status}: {body}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
    use common::{Operator, TriggerPayload};
    use serde_json::json;

    fn request() -> ActionRequest {
        let event = TriggerEvent {
            fingerprint: Fingerprint::new("abc"),
            symbol: "BTCUSDT".into(),
            timeframe: Timeframe::H4,
            triggered_at: Utc::now(),
            payload: TriggerPayload {
                indicator: "rsi(14)".into(),
                operator: Operator::LessThan,
                value: 27.5,
                sequence: 9,
            },
            subscriber_count: 1,
        };
        let sub = Subscription {
            id: "s1".into(),
            bot_id: "bot-7".into(),
            owner_id: "alice".into(),
            condition_fingerprint: Fingerprint::new("abc"),
            bot_kind: BotKind::Grid,
            bot_config: json!({"levels": 10}),
            active: true,
            last_triggered_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        ActionRequest::new(&sub, &event)
    }

    async fn serve(status: StatusCode) -> (String, Arc<Mutex<Vec<serde_json::Value>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route(
                "/act",
                post(
                    move |State(seen): State<Arc<Mutex<Vec<serde_json::Value>>>>,
                          Json(body): Json<serde_json::Value>| async move {
                        seen.lock().unwrap().push(body);
                        status
                    },
                ),
            )
            .with_state(seen.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/act"), seen)
    }

    #[test]
    fn request_carries_bot_and_trigger() {
        let req = request();
        assert_eq!(req.bot_id, "bot-7");
        assert_eq!(req.bot_type, BotKind::Grid);
        assert_eq!(req.trigger.value, 27.5);

        let wire = serde_json::to_value(&req).unwrap();
        assert_eq!(wire["bot_type"], "grid");
        assert_eq!(wire["trigger"]["timeframe"], "4h");
    }

    #[tokio::test]
    async fn http_handler_posts_json() {
        let (url, seen) = serve(StatusCode::OK).await;
        let handler = HttpActionHandler::new(url, Duration::from_secs(2)).unwrap();
        handler.handle(&request()).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["bot_id"], "bot-7");
        assert_eq!(seen[0]["bot_config"]["levels"], 10);
    }

    #[tokio::test]
    async fn http_handler_maps_server_errors_to_retryable() {
        let (url, _) = serve(StatusCode::BAD_GATEWAY).await;
        let handler = HttpActionHandler::new(url, Duration::from_secs(2)).unwrap();
        let err = handler.handle(&request()).await.unwrap_err();
        assert!(err.is_retryable());

        let (url, _) = serve(StatusCode::UNPROCESSABLE_ENTITY).await;
        let handler = HttpActionHandler::new(url, Duration::from_secs(2)).unwrap();
        let err = handler.handle(&request()).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn registry_routes_by_kind() {
        struct Noop;
        #[async_trait]
        impl ActionHandler for Noop {
            async fn handle(&self, _: &ActionRequest) -> Result<()> {
                Ok(())
            }
        }

        let mut registry = HandlerRegistry::new();
        registry
            .register(BotKind::Trend, Arc::new(Noop))
            .register(BotKind::Dca, Arc::new(Noop));
        assert_eq!(registry.kinds(), vec![BotKind::Dca, BotKind::Trend]);
        assert!(registry.get(BotKind::Grid).is_none());
    }
}
