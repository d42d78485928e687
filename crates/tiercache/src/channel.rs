//! Invalidation channel: typed wrapper over a [`MessageBus`].
//!
//! Publishing is fire-and-forget. A failed publish is logged, counted and
//! reported as `false`; it never fails the cache operation that triggered it,
//! because the distributed write already succeeded. Received payloads that do
//! not decode are logged and dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tiercache_core::{DynMessageBus, MessageHandler, Result, Subscription};

use crate::message::InvalidationMessage;
use crate::metrics;

pub struct InvalidationChannel {
    bus: DynMessageBus,
    name: String,
    publish_failures: AtomicU64,
    malformed: Arc<AtomicU64>,
}

impl InvalidationChannel {
    pub fn new(bus: DynMessageBus, name: impl Into<String>) -> Self {
        Self {
            bus,
            name: name.into(),
            publish_failures: AtomicU64::new(0),
            malformed: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Serialize and broadcast a message.
    ///
    /// Returns `true` if the bus accepted it.
    pub async fn publish(&self, message: &InvalidationMessage) -> bool {
        let payload = match message.to_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize invalidation message");
                self.record_failure();
                return false;
            }
        };

        match self.bus.publish(&self.name, &payload).await {
            Ok(()) => {
                tracing::debug!(
                    channel = %self.name,
                    kind = message.kind(),
                    keys = message.keys.len(),
                    "published cache invalidation"
                );
                true
            }
            Err(e) => {
                tracing::warn!(
                    channel = %self.name,
                    kind = message.kind(),
                    error = %e,
                    "failed to publish cache invalidation"
                );
                self.record_failure();
                false
            }
        }
    }

    /// Deliver every decodable message on this channel to `handler`.
    pub async fn subscribe<F>(&self, handler: F) -> Result<Subscription>
    where
        F: Fn(InvalidationMessage) + Send + Sync + 'static,
    {
        let malformed = Arc::clone(&self.malformed);
        let channel = self.name.clone();

        let on_payload: MessageHandler = Arc::new(move |payload: &[u8]| {
            match InvalidationMessage::from_bytes(payload) {
                Ok(message) => handler(message),
                Err(e) => {
                    malformed.fetch_add(1, Ordering::Relaxed);
                    metrics::record_invalidation_malformed();
                    tracing::warn!(
                        channel = %channel,
                        error = %e,
                        "failed to parse invalidation message payload"
                    );
                }
            }
        });

        let subscription = self.bus.subscribe(&self.name, on_payload).await?;
        tracing::info!(channel = %self.name, "subscribed to invalidation channel");
        Ok(subscription)
    }

    /// Number of publishes that failed and were swallowed.
    pub fn publish_failures(&self) -> u64 {
        self.publish_failures.load(Ordering::Relaxed)
    }

    /// Number of received payloads that could not be decoded.
    pub fn malformed_messages(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    fn record_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
        metrics::record_publish_failure();
    }
}

impl std::fmt::Debug for InvalidationChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvalidationChannel")
            .field("name", &self.name)
            .field("publish_failures", &self.publish_failures())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;
    use tiercache_core::MessageBus;
    use tiercache_memory::InMemoryMessageBus;

    #[tokio::test]
    async fn test_publish_and_receive() {
        let bus = InMemoryMessageBus::new_shared();
        let channel = InvalidationChannel::new(bus.clone(), "test-channel");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = channel
            .subscribe(move |msg| sink.lock().unwrap().push(msg))
            .await
            .unwrap();

        let msg = InvalidationMessage::for_keys("origin", ["a", "b"]);
        assert!(channel.publish(&msg).await);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(seen.lock().unwrap().as_slice(), &[msg]);
    }

    #[tokio::test]
    async fn test_publish_failure_is_swallowed_and_counted() {
        let bus = InMemoryMessageBus::new_shared();
        bus.set_available(false);
        let channel = InvalidationChannel::new(bus, "test-channel");

        assert!(!channel.publish(&InvalidationMessage::flush("origin")).await);
        assert_eq!(channel.publish_failures(), 1);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_dropped() {
        let bus = InMemoryMessageBus::new_shared();
        let channel = InvalidationChannel::new(bus.clone(), "test-channel");

        let seen = Arc::new(Mutex::new(0usize));
        let sink = Arc::clone(&seen);
        let _sub = channel
            .subscribe(move |_| *sink.lock().unwrap() += 1)
            .await
            .unwrap();

        bus.publish("test-channel", b"{garbage").await.unwrap();
        assert!(channel.publish(&InvalidationMessage::flush("origin")).await);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(*seen.lock().unwrap(), 1);
        assert_eq!(channel.malformed_messages(), 1);
    }
}
