//! Redis pub/sub transport for invalidation messages.
//!
//! Publishing goes through the shared connection pool. Each subscription owns
//! a dedicated pub/sub connection (pooled connections cannot `SUBSCRIBE`) and
//! a background task that reconnects with exponential backoff when the
//! connection drops.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::Pool;
use futures_util::StreamExt;
use redis::{AsyncCommands, Client};
use tiercache_core::{CacheError, MessageBus, MessageHandler, Result, Subscription};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Errors of the subscription loop. Surfaced only through logs and, for the
/// first connection attempt, through `subscribe`.
#[derive(Debug, thiserror::Error)]
enum ListenerError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis subscribe error: {0}")]
    Subscribe(String),

    #[error("Redis pub/sub stream ended")]
    StreamEnded,
}

/// Message bus over Redis pub/sub.
#[derive(Clone)]
pub struct RedisMessageBus {
    pool: Pool,
    client: Client,
}

impl RedisMessageBus {
    /// Create a bus publishing through `pool` and subscribing with a
    /// dedicated connection to `redis_url`.
    pub fn new(pool: Pool, redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)
            .map_err(|e| CacheError::configuration(format!("invalid Redis URL: {e}")))?;
        Ok(Self { pool, client })
    }
}

impl std::fmt::Debug for RedisMessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisMessageBus")
            .field("pool_size", &self.pool.status().size)
            .finish()
    }
}

#[async_trait]
impl MessageBus for RedisMessageBus {
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        let mut conn = self.pool.get().await.map_err(|e| {
            CacheError::channel_publish(format!("failed to get Redis connection: {e}"))
        })?;

        let receivers: u64 = conn
            .publish(channel, payload)
            .await
            .map_err(|e| CacheError::channel_publish(format!("Redis PUBLISH failed: {e}")))?;

        debug!(channel = %channel, receivers, "published to Redis channel");
        Ok(())
    }

    /// Subscribe and wait until the first `SUBSCRIBE` is acknowledged, so
    /// that messages published after this returns are delivered.
    async fn subscribe(&self, channel: &str, handler: MessageHandler) -> Result<Subscription> {
        let token = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();

        let listener = Listener {
            client: self.client.clone(),
            channel: channel.to_string(),
            handler,
            token: token.clone(),
        };
        let task = tokio::spawn(listener.run(ready_tx));

        match ready_rx.await {
            Ok(Ok(())) => Ok(Subscription::new(channel, token, task)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(CacheError::backend_unavailable(
                "Redis subscription task exited before subscribing",
            )),
        }
    }
}

struct Listener {
    client: Client,
    channel: String,
    handler: MessageHandler,
    token: CancellationToken,
}

impl Listener {
    async fn run(self, ready: oneshot::Sender<Result<()>>) {
        let mut ready = Some(ready);
        let mut backoff = INITIAL_BACKOFF;

        loop {
            let mut subscribed = false;
            let outcome = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                outcome = self.listen(&mut ready, &mut subscribed) => outcome,
            };

            match outcome {
                Ok(()) => break,
                Err(e) => {
                    // The first attempt reports to the caller instead of retrying.
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(Err(CacheError::backend_unavailable(e.to_string())));
                        return;
                    }
                    if subscribed {
                        backoff = INITIAL_BACKOFF;
                    }

                    error!(
                        channel = %self.channel,
                        error = %e,
                        backoff_secs = backoff.as_secs(),
                        "Redis subscription error, reconnecting..."
                    );
                    tokio::select! {
                        _ = self.token.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }

        debug!(channel = %self.channel, "Redis subscription stopped");
    }

    /// One connection lifetime. Returns `Ok` only when cancelled.
    async fn listen(
        &self,
        ready: &mut Option<oneshot::Sender<Result<()>>>,
        subscribed: &mut bool,
    ) -> std::result::Result<(), ListenerError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| ListenerError::Connection(e.to_string()))?;

        pubsub
            .subscribe(&self.channel)
            .await
            .map_err(|e| ListenerError::Subscribe(e.to_string()))?;

        info!(channel = %self.channel, "Subscribed to Redis channel");
        *subscribed = true;
        if let Some(ready) = ready.take() {
            let _ = ready.send(Ok(()));
        }

        let mut stream = pubsub.on_message();
        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => return Ok(()),
                msg = stream.next() => match msg {
                    Some(msg) => (self.handler)(msg.get_payload_bytes()),
                    None => {
                        warn!(channel = %self.channel, "Redis pub/sub stream ended");
                        return Err(ListenerError::StreamEnded);
                    }
                },
            }
        }
    }
}
