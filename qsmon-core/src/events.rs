//! In-process fan-out of cache notifications.

use std::fmt;

use async_trait::async_trait;
use qsmon_model::CacheNotification;
use tokio::sync::broadcast;

/// Seam for components that emit notifications, so observers and tests can
/// substitute their own sink.
#[async_trait]
pub trait NotificationPublisher: Send + Sync {
    async fn publish(&self, notification: CacheNotification);
}

/// Lightweight in-process event bus that fans cache notifications out to
/// observers (the tool layer, the audit logger). Lagging receivers drop
/// the oldest notifications rather than backpressuring the cache.
pub struct CacheEventBus {
    sender: broadcast::Sender<CacheNotification>,
    channel_capacity: usize,
}

impl fmt::Debug for CacheEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEventBus")
            .field("channel_capacity", &self.channel_capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl CacheEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            channel_capacity: capacity,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheNotification> {
        self.sender.subscribe()
    }

    /// Send without awaiting; a send with no subscribers is not an error.
    pub fn send(&self, notification: CacheNotification) {
        let _ = self.sender.send(notification);
    }
}

impl Default for CacheEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl NotificationPublisher for CacheEventBus {
    async fn publish(&self, notification: CacheNotification) {
        self.send(notification);
    }
}
