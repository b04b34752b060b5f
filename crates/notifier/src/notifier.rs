use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use bus::{subscribe_with_backoff, Backoff, BusMessage, EventBus};
use common::{Error, Fingerprint, Result, Subscription, TriggerEvent};
use registry::SubscriptionStore;

use crate::handler::{ActionRequest, HandlerRegistry};

/// Every condition channel.
pub const TRIGGER_PATTERN: &str = "condition:*";

/// Triggers fanned out at once before the consumer stops reading the bus.
const MAX_INFLIGHT_TRIGGERS: usize = 256;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchSummary {
    pub dispatched: usize,
    pub failed: usize,
}

/// Fans each trigger out to every active subscriber of its condition.
///
/// Each trigger and each of its dispatches runs as its own task with its
/// own timeout, so one slow handler never holds up the rest.
#[derive(Clone)]
pub struct Notifier {
    subs: SubscriptionStore,
    handlers: Arc<HandlerRegistry>,
    bus: Arc<dyn EventBus>,
    dispatch_timeout: Duration,
}

impl Notifier {
    pub fn new(
        subs: SubscriptionStore,
        handlers: HandlerRegistry,
        bus: Arc<dyn EventBus>,
        dispatch_timeout: Duration,
    ) -> Self {
        Self {
            subs,
            handlers: Arc::new(handlers),
            bus,
            dispatch_timeout,
        }
    }

    /// Consume trigger events until `shutdown` flips to true. A dropped bus
    /// connection is re-established with exponential backoff; triggers
    /// published while disconnected are not replayed. Fan-outs still in
    /// flight at shutdown are awaited.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(handlers = ?self.handlers.kinds(), "Notifier running");
        let mut backoff = Backoff::default();
        let slots = Arc::new(Semaphore::new(MAX_INFLIGHT_TRIGGERS));
        let mut inflight = JoinSet::new();

        'connect: loop {
            let Some(mut sub) =
                subscribe_with_backoff(self.bus.as_ref(), TRIGGER_PATTERN, &mut backoff, &mut shutdown)
                    .await
            else {
                break;
            };

            loop {
                tokio::select! {
                    msg = sub.recv() => match msg {
                        Ok(msg) => {
                            let Ok(permit) = slots.clone().acquire_owned().await else {
                                break 'connect;
                            };
                            let this = self.clone();
                            inflight.spawn(async move {
                                this.on_message(msg).await;
                                drop(permit);
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "Bus connection lost — resubscribing");
                            tokio::time::sleep(backoff.next_delay()).await;
                            continue 'connect;
                        }
                    },
                    Some(joined) = inflight.join_next(), if !inflight.is_empty() => {
                        if let Err(e) = joined {
                            error!(error = %e, "Trigger fan-out task panicked");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break 'connect;
                        }
                    }
                }
            }
        }

        if !inflight.is_empty() {
            info!(pending = inflight.len(), "Waiting for in-flight triggers");
        }
        while let Some(joined) = inflight.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Trigger fan-out task panicked");
            }
        }
        info!("Notifier stopped");
    }

    async fn on_message(&self, msg: BusMessage) {
        let event: TriggerEvent = match serde_json::from_str(&msg.payload) {
            Ok(e) => e,
            Err(e) => {
                warn!(channel = %msg.channel, error = %e, "Dropping malformed trigger event");
                return;
            }
        };
        if Fingerprint::from_channel(&msg.channel).as_ref() != Some(&event.fingerprint) {
            warn!(channel = %msg.channel, fingerprint = %event.fingerprint, "Trigger channel does not match its fingerprint");
        }

        match self.handle_trigger(&event).await {
            Ok(summary) => {
                debug!(fingerprint = %event.fingerprint, ?summary, "Trigger fanned out");
            }
            Err(e) => {
                error!(fingerprint = %event.fingerprint, error = %e, "Failed to resolve subscribers for trigger");
            }
        }
    }

    /// Dispatch one trigger to every active subscriber of its condition.
    ///
    /// Fails only when the subscriber set cannot be read. Individual
    /// dispatch failures are logged and counted in the summary.
    pub async fn handle_trigger(&self, event: &TriggerEvent) -> Result<DispatchSummary> {
        let subscriptions = self.subs.list_for_condition(&event.fingerprint).await?;
        if subscriptions.is_empty() {
            debug!(fingerprint = %event.fingerprint, "Trigger has no active subscribers");
            return Ok(DispatchSummary::default());
        }

        let mut tasks = JoinSet::new();
        for sub in subscriptions {
            let handlers = self.handlers.clone();
            let store = self.subs.clone();
            let request = ActionRequest::new(&sub, event);
            let timeout = self.dispatch_timeout;
            tasks.spawn(async move { dispatch_one(&handlers, &store, &sub, &request, timeout).await });
        }

        let mut summary = DispatchSummary::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(true) => summary.dispatched += 1,
                Ok(false) => summary.failed += 1,
                Err(e) => {
                    error!(error = %e, "Dispatch task panicked");
                    summary.failed += 1;
                }
            }
        }

        info!(
            fingerprint = %event.fingerprint,
            symbol = %event.symbol,
            dispatched = summary.dispatched,
            failed = summary.failed,
            "Trigger dispatched"
        );
        Ok(summary)
    }
}

/// Returns whether the handler accepted the request.
async fn dispatch_one(
    handlers: &HandlerRegistry,
    store: &SubscriptionStore,
    sub: &Subscription,
    request: &ActionRequest,
    timeout: Duration,
) -> bool {
    let Some(handler) = handlers.get(sub.bot_kind) else {
        error!(bot = %sub.bot_id, kind = %sub.bot_kind, "No action handler registered for bot kind");
        return false;
    };

    let result = tokio::time::timeout(timeout, handler.handle(request))
        .await
        .unwrap_or_else(|_| Err(Error::ServiceUnavailable(format!("dispatch timed out after {timeout:?}"))));

    match result {
        Ok(()) => {
            if let Err(e) = store.touch_last_triggered(&sub.id, Utc::now()).await {
                warn!(subscription = %sub.id, error = %e, "Failed to update last_triggered_at");
            }
            true
        }
        Err(e) => {
            error!(
                bot = %sub.bot_id,
                kind = %sub.bot_kind,
                subscription = %sub.id,
                retryable = e.is_retryable(),
                error = %e,
                "Action dispatch failed"
            );
            false
        }
    }
}
