//! Contracts consumed by the hybrid cache.
//!
//! The hybrid cache never talks to Redis (or any other backend) directly. It
//! goes through [`DistributedCache`] for the authoritative key-value tier and
//! through [`MessageBus`] for invalidation broadcasts, so both can be replaced
//! by in-process substitutes in tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// The authoritative, network-shared key-value tier.
///
/// Values are opaque bytes. Every method returns
/// [`CacheError::BackendUnavailable`](crate::CacheError::BackendUnavailable)
/// when the backend cannot be reached; a missing key is a normal result.
#[async_trait]
pub trait DistributedCache: Send + Sync {
    /// Reads a value. Returns `None` if the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Returns the remaining time-to-live of a key.
    ///
    /// Returns `None` if the key does not exist or never expires.
    async fn get_expiration(&self, key: &str) -> Result<Option<Duration>>;

    /// Reads a value together with its remaining time-to-live.
    ///
    /// Backends that can fetch both in one round trip should override this.
    async fn get_with_expiration(
        &self,
        key: &str,
    ) -> Result<Option<(Vec<u8>, Option<Duration>)>> {
        match self.get(key).await? {
            Some(value) => {
                let ttl = self.get_expiration(key).await?;
                Ok(Some((value, ttl)))
            }
            None => Ok(None),
        }
    }

    /// Writes a value unconditionally, replacing any previous value and ttl.
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<bool>;

    /// Writes a value only if the key does not exist yet.
    ///
    /// Returns `false` if the key was already present.
    async fn add(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<bool>;

    /// Writes a value only if the key already exists.
    ///
    /// Returns `false` if the key was absent.
    async fn replace(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<bool>;

    /// Removes a key. Returns `false` if it did not exist.
    async fn remove(&self, key: &str) -> Result<bool>;

    /// Removes the given keys, or every key when `keys` is `None`.
    ///
    /// Returns the number of keys removed.
    async fn remove_all(&self, keys: Option<&[String]>) -> Result<u64>;

    /// Removes every key starting with `prefix`. Returns the number removed.
    async fn remove_by_prefix(&self, prefix: &str) -> Result<u64>;

    /// Checks whether a key exists.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Adds `amount` to a numeric value, creating it at zero first if absent.
    ///
    /// When `ttl` is given the key's expiration is reset to it.
    async fn increment(&self, key: &str, amount: i64, ttl: Option<Duration>) -> Result<i64>;

    /// Resets the time-to-live of an existing key.
    ///
    /// Returns `false` if the key does not exist.
    async fn set_expiration(&self, key: &str, ttl: Duration) -> Result<bool>;
}

/// Callback invoked for every payload delivered on a subscribed channel.
///
/// Handlers run on the bus's delivery task and must return quickly.
pub type MessageHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Publish/subscribe transport used for invalidation broadcasts.
///
/// Delivery is assumed at-least-once and unordered across processes.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Broadcasts a payload to every subscriber of `channel`.
    ///
    /// Does not wait for subscribers to process the message.
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()>;

    /// Registers a handler for every payload published on `channel`.
    ///
    /// The handler stays registered until the returned [`Subscription`] is
    /// cancelled or dropped.
    async fn subscribe(&self, channel: &str, handler: MessageHandler) -> Result<Subscription>;
}

/// Handle to an active bus subscription.
///
/// Cancelling (or dropping) the handle stops the delivery task.
#[derive(Debug)]
pub struct Subscription {
    channel: String,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Wraps a delivery task that stops when `token` is cancelled.
    pub fn new(channel: impl Into<String>, token: CancellationToken, task: JoinHandle<()>) -> Self {
        Self {
            channel: channel.into(),
            token,
            task: Some(task),
        }
    }

    /// Channel this subscription listens on.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Returns `true` once the subscription was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Stops delivery without waiting for the task to finish.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Stops delivery and waits for the delivery task to exit.
    pub async fn unsubscribe(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(channel = %self.channel, error = %e, "subscription task ended abnormally");
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
