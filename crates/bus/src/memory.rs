use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

use common::{Error, Result};

use crate::{BusMessage, BusSubscription, EventBus, Pattern};

/// Process-local bus on a `tokio::sync::broadcast` channel.
pub struct InMemoryBus {
    tx: RwLock<Option<broadcast::Sender<BusMessage>>>,
    capacity: usize,
}

impl InMemoryBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx: RwLock::new(Some(tx)),
            capacity,
        }
    }

    /// Drop every current subscriber while staying open for new ones.
    /// Existing receivers observe a closed connection.
    pub async fn drop_connections(&self) {
        let mut guard = self.tx.write().await;
        if guard.is_some() {
            let (tx, _) = broadcast::channel(self.capacity);
            *guard = Some(tx);
            info!("Bus connections reset");
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.tx
            .read()
            .await
            .as_ref()
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn publish(&self, channel: &str, payload: String) -> Result<usize> {
        let guard = self.tx.read().await;
        let tx = guard
            .as_ref()
            .ok_or_else(|| Error::ServiceUnavailable("bus is closed".into()))?;
        let msg = BusMessage {
            channel: channel.to_string(),
            payload,
        };
        // A send error only means nobody is listening right now.
        let receivers = tx.send(msg).unwrap_or(0);
        debug!(%channel, receivers, "Published");
        Ok(receivers)
    }

    async fn subscribe(&self, pattern: &str) -> Result<BusSubscription> {
        let guard = self.tx.read().await;
        let tx = guard
            .as_ref()
            .ok_or_else(|| Error::ServiceUnavailable("bus is closed".into()))?;
        debug!(%pattern, "Subscribed");
        Ok(BusSubscription::new(Pattern::new(pattern), tx.subscribe()))
    }

    async fn close(&self) {
        if self.tx.write().await.take().is_some() {
            info!("Bus closed");
        }
    }
}
