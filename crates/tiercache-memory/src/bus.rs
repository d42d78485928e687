//! In-memory message bus built on tokio broadcast channels.
//!
//! Each named channel maps to one `broadcast::Sender`. Every subscription owns
//! a receiver and a delivery task that hands payloads to its handler, which is
//! the same fan-out the Redis bus gives across processes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tiercache_core::{CacheError, MessageBus, MessageHandler, Result, Subscription};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

/// Default buffer size for each channel.
/// Messages beyond this limit are dropped for slow subscribers.
const DEFAULT_BUFFER_SIZE: usize = 1024;

type Payload = Arc<Vec<u8>>;

/// Process-local publish/subscribe bus.
#[derive(Debug)]
pub struct InMemoryMessageBus {
    channels: DashMap<String, broadcast::Sender<Payload>>,
    capacity: usize,
    unavailable: AtomicBool,
}

impl InMemoryMessageBus {
    /// Create a bus with the default per-channel buffer size.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_SIZE)
    }

    /// Create a bus with a custom per-channel buffer size.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Create a new bus wrapped in an Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Toggle simulated availability. While unavailable, publishing fails
    /// with `ChannelPublish`.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Number of live subscriptions on a channel.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|sender| sender.receiver_count())
            .unwrap_or_default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Payload> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for InMemoryMessageBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for InMemoryMessageBus {
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CacheError::channel_publish(
                "in-memory bus marked unavailable",
            ));
        }

        // A send error only means nobody is listening yet.
        let delivered = self
            .sender(channel)
            .send(Arc::new(payload.to_vec()))
            .unwrap_or_default();
        tracing::trace!(channel = %channel, delivered, "published message");
        Ok(())
    }

    async fn subscribe(&self, channel: &str, handler: MessageHandler) -> Result<Subscription> {
        let mut receiver = self.sender(channel).subscribe();
        let token = CancellationToken::new();
        let task_token = token.clone();
        let channel_name = channel.to_string();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = task_token.cancelled() => break,
                    received = receiver.recv() => match received {
                        Ok(payload) => handler(&payload),
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(
                                channel = %channel_name,
                                skipped,
                                "subscriber lagged, messages dropped"
                            );
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            tracing::debug!(channel = %channel_name, "in-memory subscription stopped");
        });

        Ok(Subscription::new(channel, token, task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    fn collecting_handler() -> (MessageHandler, Arc<Mutex<Vec<Vec<u8>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: MessageHandler = Arc::new(move |payload: &[u8]| {
            sink.lock().unwrap().push(payload.to_vec());
        });
        (handler, seen)
    }

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let bus = InMemoryMessageBus::new();
        let (first, first_seen) = collecting_handler();
        let (second, second_seen) = collecting_handler();

        let _a = bus.subscribe("ch", first).await.unwrap();
        let _b = bus.subscribe("ch", second).await.unwrap();
        assert_eq!(bus.subscriber_count("ch"), 2);

        bus.publish("ch", b"hello").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(first_seen.lock().unwrap().as_slice(), &[b"hello".to_vec()]);
        assert_eq!(second_seen.lock().unwrap().as_slice(), &[b"hello".to_vec()]);
    }

    #[tokio::test]
    async fn test_channels_are_isolated() {
        let bus = InMemoryMessageBus::new();
        let (handler, seen) = collecting_handler();
        let _sub = bus.subscribe("a", handler).await.unwrap();

        bus.publish("b", b"other").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus = InMemoryMessageBus::new();
        let (handler, seen) = collecting_handler();
        let sub = bus.subscribe("ch", handler).await.unwrap();
        sub.unsubscribe().await;

        bus.publish("ch", b"late").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(bus.subscriber_count("ch"), 0);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = InMemoryMessageBus::new();
        assert!(bus.publish("nobody", b"x").await.is_ok());
    }

    #[tokio::test]
    async fn test_unavailable_bus_fails_publish() {
        let bus = InMemoryMessageBus::new();
        bus.set_available(false);
        let err = bus.publish("ch", b"x").await.unwrap_err();
        assert!(matches!(err, CacheError::ChannelPublish { .. }));
    }
}
