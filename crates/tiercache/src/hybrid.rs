//! Hybrid cache: local tier in front of the distributed tier, kept coherent
//! through the invalidation channel.
//!
//! ## Routing
//!
//! ```text
//! get   → local hit? ─yes→ value
//!              │no
//!              ▼
//!         distributed get (+ remaining ttl) → populate local → value
//!
//! set   → distributed set ─ok→ local set → publish {keys:[key]}
//!              │err
//!              ▼
//!         error, local untouched
//! ```
//!
//! Removals follow the same order: distributed tier first, then the local
//! tier, then an invalidation so every other instance evicts its copy.
//! Messages carry the publisher's `cache_id`; an instance ignores its own.
//!
//! ## Cancellation
//!
//! Every mutating operation arms a guard before awaiting the distributed tier.
//! If the future is dropped mid-flight the guard evicts the affected local
//! keys, so the local tier can fall behind (and refetch) but never run ahead
//! of the distributed tier.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tiercache_core::{DynDistributedCache, DynMessageBus, KeyScope, Result, Subscription};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::channel::InvalidationChannel;
use crate::client::CacheClient;
use crate::config::HybridCacheSettings;
use crate::local::{CacheValue, LocalCache, LocalCacheStats, spawn_expiration_sweep};
use crate::message::InvalidationMessage;
use crate::metrics::{self, TIER_LOCAL, TIER_REMOTE};
use crate::scoped::ScopedCache;

/// Diagnostics for one hybrid cache instance.
#[derive(Debug, Clone)]
pub struct HybridCacheStats {
    pub cache_id: String,
    pub local: LocalCacheStats,
    /// Invalidations from other instances that were applied.
    pub invalidations_received: u64,
    /// Self-originated invalidations that were skipped.
    pub invalidations_ignored: u64,
    pub publish_failures: u64,
    pub malformed_messages: u64,
}

#[derive(Debug, Default)]
struct InvalidationCounters {
    received: AtomicU64,
    ignored: AtomicU64,
}

/// Two-tier cache client.
///
/// Cheap to clone; clones share the same local tier, subscription and
/// `cache_id`. The subscription and the expiration sweep stop when the last
/// clone is dropped or [`shutdown`](Self::shutdown) is called.
#[derive(Clone)]
pub struct HybridCacheClient {
    inner: Arc<HybridInner>,
}

struct HybridInner {
    cache_id: String,
    distributed: DynDistributedCache,
    local: Arc<LocalCache>,
    channel: InvalidationChannel,
    counters: Arc<InvalidationCounters>,
    default_ttl: Option<Duration>,
    scope_separator: String,
    shutdown: CancellationToken,
    subscription: Mutex<Option<Subscription>>,
}

impl Drop for HybridInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl HybridCacheClient {
    /// Create a hybrid cache over the given tiers.
    ///
    /// Subscribes to the invalidation channel and starts the expiration
    /// sweep before returning. Must be called inside a tokio runtime.
    pub async fn new(
        distributed: DynDistributedCache,
        bus: DynMessageBus,
        settings: HybridCacheSettings,
    ) -> Result<Self> {
        settings.validate()?;

        let cache_id = Uuid::new_v4().simple().to_string();
        let local = Arc::new(LocalCache::new());
        let counters = Arc::new(InvalidationCounters::default());
        let channel = InvalidationChannel::new(bus, settings.channel_name.clone());
        let shutdown = CancellationToken::new();

        let subscription = {
            let cache_id = cache_id.clone();
            let local = Arc::clone(&local);
            let counters = Arc::clone(&counters);
            channel
                .subscribe(move |message| apply_invalidation(&cache_id, &local, &counters, message))
                .await?
        };

        spawn_expiration_sweep(&local, settings.sweep_interval(), shutdown.child_token());

        tracing::info!(
            cache_id = %cache_id,
            channel = %settings.channel_name,
            sweep_interval_ms = settings.sweep_interval_ms,
            "hybrid cache started"
        );

        Ok(Self {
            inner: Arc::new(HybridInner {
                cache_id,
                distributed,
                local,
                channel,
                counters,
                default_ttl: settings.default_ttl(),
                scope_separator: settings.scope_separator.clone(),
                shutdown,
                subscription: Mutex::new(Some(subscription)),
            }),
        })
    }

    /// Create a hybrid cache with default settings.
    pub async fn with_defaults(distributed: DynDistributedCache, bus: DynMessageBus) -> Result<Self> {
        Self::new(distributed, bus, HybridCacheSettings::default()).await
    }

    /// Identifier stamped on every invalidation this instance publishes.
    pub fn cache_id(&self) -> &str {
        &self.inner.cache_id
    }

    /// The local tier (for diagnostics and tests).
    pub fn local_cache(&self) -> &LocalCache {
        &self.inner.local
    }

    /// Number of reads served by the local tier.
    pub fn local_cache_hits(&self) -> u64 {
        self.inner.local.hit_count()
    }

    pub fn stats(&self) -> HybridCacheStats {
        HybridCacheStats {
            cache_id: self.inner.cache_id.clone(),
            local: self.inner.local.stats(),
            invalidations_received: self.inner.counters.received.load(Ordering::Relaxed),
            invalidations_ignored: self.inner.counters.ignored.load(Ordering::Relaxed),
            publish_failures: self.inner.channel.publish_failures(),
            malformed_messages: self.inner.channel.malformed_messages(),
        }
    }

    /// A key-prefix view over this cache.
    pub fn scoped(&self, scope: &str) -> ScopedCache {
        ScopedCache::new(
            self.clone(),
            KeyScope::with_separator(scope, &self.inner.scope_separator),
        )
    }

    pub(crate) fn scope_separator(&self) -> &str {
        &self.inner.scope_separator
    }

    /// Stop listening for invalidations and stop the expiration sweep.
    ///
    /// The local tier keeps serving reads afterwards but no longer hears about
    /// remote changes, so callers should drop the client after this.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let subscription = self.inner.subscription.lock().await.take();
        if let Some(subscription) = subscription {
            subscription.unsubscribe().await;
            tracing::info!(cache_id = %self.inner.cache_id, "hybrid cache stopped");
        }
    }

    async fn publish(&self, message: InvalidationMessage) {
        self.inner.channel.publish(&message).await;
    }

    fn guard<'a>(&'a self, target: LocalTarget<'a>) -> PendingLocalWrite<'a> {
        PendingLocalWrite {
            local: &self.inner.local,
            target,
            armed: true,
        }
    }

    fn effective_ttl(&self, ttl: Option<Duration>) -> Option<Duration> {
        ttl.or(self.inner.default_ttl)
    }
}

#[async_trait]
impl CacheClient for HybridCacheClient {
    async fn get(&self, key: &str) -> Result<Option<CacheValue>> {
        let inner = &self.inner;

        if let Some(value) = inner.local.get(key) {
            tracing::debug!(key = %key, "cache hit (local)");
            metrics::record_cache_hit(TIER_LOCAL);
            return Ok(Some(value));
        }
        metrics::record_cache_miss(TIER_LOCAL);

        let observed = inner.local.observe(key);
        match inner.distributed.get_with_expiration(key).await? {
            Some((data, ttl)) => {
                tracing::debug!(key = %key, ttl_ms = ?ttl.map(|t| t.as_millis()), "cache hit (remote)");
                metrics::record_cache_hit(TIER_REMOTE);

                let value = Arc::new(data);
                if !ttl.is_some_and(|t| t.is_zero()) {
                    inner.local.populate(observed, Arc::clone(&value), ttl);
                }
                Ok(Some(value))
            }
            None => {
                tracing::debug!(key = %key, "cache miss");
                metrics::record_cache_miss(TIER_REMOTE);
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<bool> {
        let ttl = self.effective_ttl(ttl);
        if ttl.is_some_and(|t| t.is_zero()) {
            self.remove(key).await?;
            return Ok(false);
        }

        let observed = self.inner.local.observe(key);
        let guard = self.guard(LocalTarget::Key(key));
        let stored = match self.inner.distributed.set(key, &value, ttl).await {
            Ok(stored) => stored,
            Err(e) => {
                guard.disarm();
                return Err(e);
            }
        };

        self.inner
            .local
            .write_through(observed, Arc::new(value), ttl);
        guard.disarm();

        self.publish(InvalidationMessage::for_keys(&self.inner.cache_id, [key]).with_ttl(ttl))
            .await;
        Ok(stored)
    }

    async fn set_many(
        &self,
        entries: Vec<(String, Vec<u8>)>,
        ttl: Option<Duration>,
    ) -> Result<usize> {
        let ttl = self.effective_ttl(ttl);
        if ttl.is_some_and(|t| t.is_zero()) {
            let keys: Vec<String> = entries.into_iter().map(|(key, _)| key).collect();
            self.remove_all(Some(&keys)).await?;
            return Ok(0);
        }

        let mut written = Vec::with_capacity(entries.len());
        let mut failure = None;

        for (key, value) in entries {
            let observed = self.inner.local.observe(&key);
            let guard = self.guard(LocalTarget::Key(&key));
            match self.inner.distributed.set(&key, &value, ttl).await {
                Ok(_) => {
                    self.inner
                        .local
                        .write_through(observed, Arc::new(value), ttl);
                    guard.disarm();
                    written.push(key);
                }
                Err(e) => {
                    guard.disarm();
                    failure = Some(e);
                    break;
                }
            }
        }

        let count = written.len();
        if count > 0 {
            self.publish(InvalidationMessage::for_keys(&self.inner.cache_id, written).with_ttl(ttl))
                .await;
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(count),
        }
    }

    async fn add(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<bool> {
        let ttl = self.effective_ttl(ttl);
        let observed = self.inner.local.observe(key);
        let guard = self.guard(LocalTarget::Key(key));
        let added = match self.inner.distributed.add(key, &value, ttl).await {
            Ok(added) => added,
            Err(e) => {
                guard.disarm();
                return Err(e);
            }
        };

        if added {
            self.inner
                .local
                .write_through(observed, Arc::new(value), ttl);
        }
        guard.disarm();

        if added {
            self.publish(InvalidationMessage::for_keys(&self.inner.cache_id, [key]).with_ttl(ttl))
                .await;
        }
        Ok(added)
    }

    async fn replace(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<bool> {
        let ttl = self.effective_ttl(ttl);
        let observed = self.inner.local.observe(key);
        let guard = self.guard(LocalTarget::Key(key));
        let replaced = match self.inner.distributed.replace(key, &value, ttl).await {
            Ok(replaced) => replaced,
            Err(e) => {
                guard.disarm();
                return Err(e);
            }
        };

        if replaced {
            self.inner
                .local
                .write_through(observed, Arc::new(value), ttl);
        } else {
            // Absent remotely, so any local copy is stale.
            self.inner.local.remove(key);
        }
        guard.disarm();

        if replaced {
            self.publish(InvalidationMessage::for_keys(&self.inner.cache_id, [key]).with_ttl(ttl))
                .await;
        }
        Ok(replaced)
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let guard = self.guard(LocalTarget::Key(key));
        let removed = match self.inner.distributed.remove(key).await {
            Ok(removed) => removed,
            Err(e) => {
                guard.disarm();
                return Err(e);
            }
        };

        self.inner.local.remove(key);
        guard.disarm();

        self.publish(InvalidationMessage::for_keys(&self.inner.cache_id, [key]))
            .await;
        Ok(removed)
    }

    async fn remove_all(&self, keys: Option<&[String]>) -> Result<u64> {
        let Some(keys) = keys else {
            let guard = self.guard(LocalTarget::All);
            let removed = match self.inner.distributed.remove_all(None).await {
                Ok(removed) => removed,
                Err(e) => {
                    guard.disarm();
                    return Err(e);
                }
            };

            self.inner.local.clear();
            guard.disarm();

            self.publish(InvalidationMessage::flush(&self.inner.cache_id))
                .await;
            return Ok(removed);
        };

        // An empty key list must not turn into a flush on the peers.
        if keys.is_empty() {
            return Ok(0);
        }

        let guard = self.guard(LocalTarget::Keys(keys));
        let removed = match self.inner.distributed.remove_all(Some(keys)).await {
            Ok(removed) => removed,
            Err(e) => {
                guard.disarm();
                return Err(e);
            }
        };

        self.inner.local.remove_all(Some(keys));
        guard.disarm();

        self.publish(InvalidationMessage::for_keys(
            &self.inner.cache_id,
            keys.iter().cloned(),
        ))
        .await;
        Ok(removed)
    }

    async fn remove_by_prefix(&self, prefix: &str) -> Result<u64> {
        if prefix.is_empty() {
            return self.remove_all(None).await;
        }

        let guard = self.guard(LocalTarget::Prefix(prefix));
        let removed = match self.inner.distributed.remove_by_prefix(prefix).await {
            Ok(removed) => removed,
            Err(e) => {
                guard.disarm();
                return Err(e);
            }
        };

        self.inner.local.remove_by_prefix(prefix);
        guard.disarm();

        self.publish(InvalidationMessage::for_prefix(&self.inner.cache_id, prefix))
            .await;
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.inner.distributed.exists(key).await
    }

    async fn increment(&self, key: &str, amount: i64, ttl: Option<Duration>) -> Result<i64> {
        let ttl = self.effective_ttl(ttl);
        let guard = self.guard(LocalTarget::Key(key));
        let value = match self.inner.distributed.increment(key, amount, ttl).await {
            Ok(value) => value,
            Err(e) => {
                guard.disarm();
                return Err(e);
            }
        };

        // The next read repopulates from the distributed tier.
        self.inner.local.remove(key);
        guard.disarm();

        self.publish(InvalidationMessage::for_keys(&self.inner.cache_id, [key]))
            .await;
        Ok(value)
    }

    async fn get_expiration(&self, key: &str) -> Result<Option<Duration>> {
        self.inner.distributed.get_expiration(key).await
    }

    async fn set_expiration(&self, key: &str, ttl: Duration) -> Result<bool> {
        if ttl.is_zero() {
            return self.remove(key).await.map(|_| false);
        }

        let guard = self.guard(LocalTarget::Key(key));
        let renewed = match self.inner.distributed.set_expiration(key, ttl).await {
            Ok(renewed) => renewed,
            Err(e) => {
                guard.disarm();
                return Err(e);
            }
        };

        let message = if renewed {
            self.inner
                .local
                .set_expiration(key, Instant::now().checked_add(ttl));
            InvalidationMessage::renewal(&self.inner.cache_id, key, ttl)
        } else {
            self.inner.local.remove(key);
            InvalidationMessage::for_keys(&self.inner.cache_id, [key])
        };
        guard.disarm();

        self.publish(message).await;
        Ok(renewed)
    }
}

impl fmt::Debug for HybridCacheClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HybridCacheClient")
            .field("cache_id", &self.inner.cache_id)
            .field("channel", &self.inner.channel.name())
            .field("local_entries", &self.inner.local.count())
            .finish()
    }
}

/// Apply a received invalidation to the local tier.
///
/// Idempotent: evicting an absent key is a no-op and renewals set an
/// absolute deadline.
fn apply_invalidation(
    cache_id: &str,
    local: &LocalCache,
    counters: &InvalidationCounters,
    message: InvalidationMessage,
) {
    if message.cache_id == cache_id {
        counters.ignored.fetch_add(1, Ordering::Relaxed);
        metrics::record_invalidation_ignored();
        return;
    }

    let kind = message.kind();
    if message.is_flush() {
        local.evict_all();
    } else {
        for prefix in &message.prefixes {
            local.remove_by_prefix(prefix);
        }

        if message.renew {
            let deadline = message.local_deadline();
            for key in &message.keys {
                local.set_expiration(key, deadline);
            }
        } else {
            for key in &message.keys {
                local.remove(key);
            }
        }
    }

    counters.received.fetch_add(1, Ordering::Relaxed);
    metrics::record_invalidation_received(kind);
    tracing::debug!(
        origin = %message.cache_id,
        kind,
        keys = message.keys.len(),
        "applied remote cache invalidation"
    );
}

/// Local keys affected by an in-flight mutation.
#[derive(Debug, Clone, Copy)]
enum LocalTarget<'a> {
    Key(&'a str),
    Keys(&'a [String]),
    Prefix(&'a str),
    All,
}

/// Evicts the target from the local tier if dropped while still armed.
struct PendingLocalWrite<'a> {
    local: &'a LocalCache,
    target: LocalTarget<'a>,
    armed: bool,
}

impl PendingLocalWrite<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingLocalWrite<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        match self.target {
            LocalTarget::Key(key) => {
                self.local.remove(key);
            }
            LocalTarget::Keys(keys) => {
                self.local.remove_all(Some(keys));
            }
            LocalTarget::Prefix(prefix) => {
                self.local.remove_by_prefix(prefix);
            }
            LocalTarget::All => {
                self.local.evict_all();
            }
        }
        tracing::debug!(pending = ?self.target, "evicted local entries after abandoned write");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiercache_memory::{InMemoryDistributedCache, InMemoryMessageBus};

    async fn client() -> HybridCacheClient {
        HybridCacheClient::with_defaults(
            InMemoryDistributedCache::new_shared(),
            InMemoryMessageBus::new_shared(),
        )
        .await
        .unwrap()
    }

    fn value(s: &str) -> CacheValue {
        Arc::new(s.as_bytes().to_vec())
    }

    #[test]
    fn test_own_messages_are_ignored() {
        let local = LocalCache::new();
        let counters = InvalidationCounters::default();
        local.set("k", value("v"), None);

        apply_invalidation("me", &local, &counters, InvalidationMessage::for_keys("me", ["k"]));

        assert!(local.contains("k"));
        assert_eq!(counters.ignored.load(Ordering::Relaxed), 1);
        assert_eq!(counters.received.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_key_invalidation_is_idempotent() {
        let local = LocalCache::new();
        let counters = InvalidationCounters::default();
        local.set("a", value("1"), None);
        local.set("b", value("2"), None);

        let message = InvalidationMessage::for_keys("peer", ["a"]);
        apply_invalidation("me", &local, &counters, message.clone());
        let after_once = local.keys();
        apply_invalidation("me", &local, &counters, message);

        assert_eq!(local.keys(), after_once);
        assert_eq!(after_once, vec!["b".to_string()]);
    }

    #[test]
    fn test_flush_and_prefix_invalidation() {
        let local = LocalCache::new();
        let counters = InvalidationCounters::default();
        local.set("x:1", value("1"), None);
        local.set("y:1", value("2"), None);

        apply_invalidation("me", &local, &counters, InvalidationMessage::for_prefix("peer", "x:"));
        assert_eq!(local.keys(), vec!["y:1".to_string()]);

        apply_invalidation("me", &local, &counters, InvalidationMessage::flush("peer"));
        assert!(local.is_empty());
    }

    #[test]
    fn test_renewal_keeps_value_and_moves_deadline() {
        let local = LocalCache::new();
        let counters = InvalidationCounters::default();
        local.set("k", value("v"), Some(Duration::from_millis(50)));

        let message = InvalidationMessage::renewal("peer", "k", Duration::from_secs(60));
        apply_invalidation("me", &local, &counters, message);

        let deadline = local.expires_at("k").unwrap();
        assert!(deadline > Instant::now() + Duration::from_secs(50));
        assert_eq!(local.get("k"), Some(value("v")));
    }

    #[tokio::test]
    async fn test_abandoned_set_leaves_local_tier_behind() {
        let cache = client().await;
        cache.set("k", b"old".to_vec(), None).await.unwrap();
        assert!(cache.local_cache().contains("k"));

        // An armed guard going out of scope stands in for a cancelled write.
        {
            let guard = cache.guard(LocalTarget::Key("k"));
            drop(guard);
        }
        assert!(!cache.local_cache().contains("k"));
        assert_eq!(cache.get("k").await.unwrap(), Some(value("old")));
    }

    #[tokio::test]
    async fn test_zero_ttl_removes() {
        let cache = client().await;
        cache.set("k", b"v".to_vec(), None).await.unwrap();

        assert!(!cache.set("k", b"v2".to_vec(), Some(Duration::ZERO)).await.unwrap());
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let cache = client().await;
        cache.shutdown().await;
        cache.shutdown().await;
        assert!(cache.set("k", b"v".to_vec(), None).await.unwrap());
    }
}
