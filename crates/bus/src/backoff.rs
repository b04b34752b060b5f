use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::{BusSubscription, EventBus};

/// Exponential reconnect delay, doubling up to a ceiling.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait now; the following call returns double, capped at max.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

/// Subscribe to `pattern`, retrying with backoff until it succeeds or
/// shutdown is signalled. Returns `None` on shutdown.
pub async fn subscribe_with_backoff(
    bus: &dyn EventBus,
    pattern: &str,
    backoff: &mut Backoff,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<BusSubscription> {
    loop {
        if *shutdown.borrow() {
            return None;
        }
        match bus.subscribe(pattern).await {
            Ok(sub) => {
                info!(%pattern, "Bus subscription established");
                backoff.reset();
                return Some(sub);
            }
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(%pattern, error = %e, backoff = ?delay, "Bus subscribe failed, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            return None;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryBus;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(b.next_delay(), Duration::from_millis(100));
        assert_eq!(b.next_delay(), Duration::from_millis(200));
        assert_eq!(b.next_delay(), Duration::from_millis(350));
        assert_eq!(b.next_delay(), Duration::from_millis(350));
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn returns_none_when_shutdown_while_bus_is_down() {
        let bus = InMemoryBus::new(4);
        bus.close().await;
        let (tx, mut rx) = watch::channel(false);
        let mut backoff = Backoff::new(Duration::from_millis(5), Duration::from_millis(10));

        let handle = tokio::spawn(async move {
            subscribe_with_backoff(&bus, "condition:*", &mut backoff, &mut rx).await.is_none()
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        assert!(handle.await.unwrap());
    }
}
