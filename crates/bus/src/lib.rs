//! Pub/sub channel for trigger events, keyed by condition channel and
//! subscribable by glob pattern.
//!
//! Delivery is fire-and-forget: a message reaches whoever is connected at
//! publish time, with no durable replay. Consumers must tolerate duplicates.

pub mod backoff;
pub mod memory;
pub mod pattern;

pub use backoff::{subscribe_with_backoff, Backoff};
pub use memory::InMemoryBus;
pub use pattern::Pattern;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::warn;

use common::{Error, Result};

/// One message as it travels over the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    pub channel: String,
    /// Serialized event (JSON).
    pub payload: String,
}

#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish to a channel. Returns the number of connected receivers;
    /// zero is not an error.
    async fn publish(&self, channel: &str, payload: String) -> Result<usize>;

    /// Subscribe to every channel matching `pattern` (`*` and `?` globs).
    async fn subscribe(&self, pattern: &str) -> Result<BusSubscription>;

    /// Disconnect all subscribers and refuse further traffic.
    async fn close(&self);
}

/// A live pattern subscription.
pub struct BusSubscription {
    pattern: Pattern,
    rx: broadcast::Receiver<BusMessage>,
}

impl BusSubscription {
    pub fn new(pattern: Pattern, rx: broadcast::Receiver<BusMessage>) -> Self {
        Self { pattern, rx }
    }

    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    /// Next message whose channel matches the pattern.
    ///
    /// Returns `ServiceUnavailable` once the connection is gone; the caller
    /// is expected to resubscribe with backoff. Messages published while
    /// disconnected are lost.
    pub async fn recv(&mut self) -> Result<BusMessage> {
        loop {
            match self.rx.recv().await {
                Ok(msg) if self.pattern.matches(&msg.channel) => return Ok(msg),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(dropped = n, pattern = %self.pattern, "Bus subscriber lagged — messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(Error::ServiceUnavailable("bus connection closed".into()));
                }
            }
        }
    }
}
