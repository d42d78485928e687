//! Local (L1) tier: an in-process map of cache entries.
//!
//! ## Expiration
//!
//! Expired entries are never returned. They are dropped lazily when a `get`
//! finds them and eagerly by a background sweep that runs every few tens of
//! milliseconds, so a key nobody reads still disappears shortly after its
//! deadline.
//!
//! ## Populate races
//!
//! A read that misses locally fetches from the distributed tier and then
//! stores the result. An invalidation (or a local write) landing between the
//! fetch and the store would otherwise be overwritten by the older value.
//!
//! Before the round trip the caller takes a [`KeyObservation`]. While any
//! observation of a key is alive, every mutation of that key bumps a per-key
//! version; prefix evictions and flushes bump a cache-wide epoch instead.
//! [`LocalCache::populate`] skips the store if either moved, and
//! [`LocalCache::write_through`] evicts instead of storing, so an invalidation
//! from a concurrent writer on another instance is never undone. Mutations of
//! other keys do not interfere. Version records exist only for keys with an
//! observation in flight.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::metrics;

/// A cached value. Wrapped in `Arc` so hits are cheap to hand out.
pub type CacheValue = Arc<Vec<u8>>;

/// An immutable cached value with an optional deadline.
///
/// Replacing a value or its expiration creates a new entry.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    value: CacheValue,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    /// Create an entry expiring `ttl` from now, or never when `ttl` is `None`.
    ///
    /// A `ttl` too large for the monotonic clock never expires.
    pub fn new(value: CacheValue, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.and_then(|ttl| Instant::now().checked_add(ttl)),
        }
    }

    /// Create an entry with an explicit deadline.
    pub fn with_deadline(value: CacheValue, expires_at: Option<Instant>) -> Self {
        Self { value, expires_at }
    }

    pub fn value(&self) -> &CacheValue {
        &self.value
    }

    pub fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }

    /// Check if this entry has expired.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Counters and size of a [`LocalCache`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalCacheStats {
    /// Number of entries currently stored (expired ones included until swept).
    pub size: usize,
    /// Number of lookups served from this tier.
    pub hits: u64,
    /// Number of lookups this tier could not serve.
    pub misses: u64,
    /// Number of entries dropped because their deadline passed.
    pub expirations: u64,
}

/// Mutation count of a key while at least one observation of it is alive.
#[derive(Debug, Default)]
struct KeyVersion {
    version: u64,
    observers: usize,
}

/// A key's mutation state captured before a round trip to the distributed
/// tier. Hand it back to [`LocalCache::populate`] or
/// [`LocalCache::write_through`]; dropping it releases the key's record.
#[must_use]
#[derive(Debug)]
pub struct KeyObservation<'a> {
    cache: &'a LocalCache,
    key: String,
    version: u64,
    epoch: u64,
}

impl KeyObservation<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyObservation<'_> {
    fn drop(&mut self) {
        self.cache.versions.remove_if_mut(&self.key, |_, state| {
            state.observers = state.observers.saturating_sub(1);
            state.observers == 0
        });
    }
}

/// In-process cache tier.
///
/// Thread-safe; shared between foreground calls, the expiration sweep and
/// the invalidation handler.
#[derive(Debug, Default)]
pub struct LocalCache {
    entries: DashMap<String, CacheEntry>,
    versions: DashMap<String, KeyVersion>,
    epoch: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    expirations: AtomicU64,
}

impl LocalCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a live value, removing it if it has expired.
    ///
    /// Updates the hit or miss counter.
    pub fn get(&self, key: &str) -> Option<CacheValue> {
        let now = Instant::now();

        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired(now) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(Arc::clone(&entry.value));
            }
            // Entry expired, remove it
            drop(entry);
            if self
                .entries
                .remove_if(key, |_, entry| entry.is_expired(now))
                .is_some()
            {
                self.expirations.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Returns `true` if a live entry exists. Does not touch the counters.
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries.get(key).is_some_and(|e| !e.is_expired(now))
    }

    /// Current deadline of a live entry.
    pub fn expires_at(&self, key: &str) -> Option<Instant> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|e| !e.is_expired(now))
            .and_then(|e| e.expires_at)
    }

    /// Insert or replace an entry unconditionally.
    pub fn set(&self, key: &str, value: CacheValue, ttl: Option<Duration>) {
        self.touch(key);
        self.entries.insert(key.to_string(), CacheEntry::new(value, ttl));
    }

    /// Capture the mutation state of `key` before fetching or writing it
    /// remotely.
    pub fn observe(&self, key: &str) -> KeyObservation<'_> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let version = {
            let mut state = self.versions.entry(key.to_string()).or_default();
            state.observers += 1;
            state.version
        };
        KeyObservation {
            cache: self,
            key: key.to_string(),
            version,
            epoch,
        }
    }

    /// Store a value fetched from the distributed tier.
    ///
    /// If the key was mutated, or a prefix eviction or flush ran, since the
    /// observation was taken, the fetched value may already be stale and is
    /// not stored. Returns `true` when the value was kept.
    pub fn populate(
        &self,
        observed: KeyObservation<'_>,
        value: CacheValue,
        ttl: Option<Duration>,
    ) -> bool {
        // Mutations bump the version before touching the entry, so checking
        // under the entry's shard lock orders this store against them.
        let entry = self.entries.entry(observed.key.clone());
        let current = self.epoch.load(Ordering::SeqCst) == observed.epoch
            && self
                .versions
                .get(&observed.key)
                .is_some_and(|state| state.version == observed.version);

        if !current {
            drop(entry);
            tracing::debug!(key = %observed.key, "dropped populate raced by invalidation");
            return false;
        }
        entry.insert(CacheEntry::new(value, ttl));
        true
    }

    /// Store a value just written to the distributed tier.
    ///
    /// Like [`populate`](Self::populate), but counts as a mutation of the key
    /// itself. If the key changed since the observation, an invalidation from
    /// another writer may have been applied in between and the key is
    /// evicted instead. Returns `true` when the value was kept.
    pub fn write_through(
        &self,
        observed: KeyObservation<'_>,
        value: CacheValue,
        ttl: Option<Duration>,
    ) -> bool {
        let entry = self.entries.entry(observed.key.clone());
        let unchanged_key = match self.versions.get_mut(&observed.key) {
            Some(mut state) => {
                let unchanged = state.version == observed.version;
                state.version += 1;
                unchanged
            }
            None => false,
        };
        let current = unchanged_key && self.epoch.load(Ordering::SeqCst) == observed.epoch;

        if current {
            entry.insert(CacheEntry::new(value, ttl));
            return true;
        }

        if let Entry::Occupied(occupied) = entry {
            occupied.remove();
        }
        tracing::debug!(key = %observed.key, "dropped write-through raced by invalidation");
        false
    }

    /// Replace the deadline of an existing entry. Returns `false` if the key
    /// is absent. A deadline in the past evicts the entry.
    pub fn set_expiration(&self, key: &str, expires_at: Option<Instant>) -> bool {
        let now = Instant::now();
        if expires_at.is_some_and(|at| at <= now) {
            return self.remove(key);
        }

        match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => {
                *entry = CacheEntry::with_deadline(Arc::clone(&entry.value), expires_at);
                true
            }
            _ => false,
        }
    }

    /// Remove a single key. Returns `true` if it was present.
    pub fn remove(&self, key: &str) -> bool {
        self.touch(key);
        self.entries.remove(key).is_some()
    }

    /// Remove the given keys, or clear everything when `keys` is `None`.
    ///
    /// Clearing everything also resets the hit/miss counters.
    pub fn remove_all(&self, keys: Option<&[String]>) -> usize {
        match keys {
            Some(keys) => keys.iter().filter(|k| self.remove(k)).count(),
            None => self.clear(),
        }
    }

    /// Remove every key starting with `prefix`.
    pub fn remove_by_prefix(&self, prefix: &str) -> usize {
        self.bump_epoch();
        let mut removed = 0;
        self.entries.retain(|key, _| {
            if key.starts_with(prefix) {
                removed += 1;
                false
            } else {
                true
            }
        });
        removed
    }

    /// Drop every entry and reset the counters.
    pub fn clear(&self) -> usize {
        let removed = self.evict_all();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.expirations.store(0, Ordering::Relaxed);
        removed
    }

    /// Drop every entry but keep the counters.
    pub fn evict_all(&self) -> usize {
        self.bump_epoch();
        let removed = self.entries.len();
        self.entries.clear();
        removed
    }

    /// Clean up expired entries.
    ///
    /// Called by the background sweep. Returns the number of entries removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;

        self.entries.retain(|_, entry| {
            if entry.is_expired(now) {
                removed += 1;
                false
            } else {
                true
            }
        });

        if removed > 0 {
            self.expirations
                .fetch_add(removed as u64, Ordering::Relaxed);
        }

        removed
    }

    /// Snapshot of the stored keys.
    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn miss_count(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> LocalCacheStats {
        LocalCacheStats {
            size: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }

    /// Record a mutation of `key` for any observation in flight.
    fn touch(&self, key: &str) {
        if let Some(mut state) = self.versions.get_mut(key) {
            state.version += 1;
        }
    }

    fn bump_epoch(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }
}

/// Start the background expiration sweep for `cache`.
///
/// The task stops when `token` is cancelled or the cache is dropped.
pub fn spawn_expiration_sweep(
    cache: &Arc<LocalCache>,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    let cache: Weak<LocalCache> = Arc::downgrade(cache);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(cache) = cache.upgrade() else {
                        break;
                    };
                    let removed = cache.cleanup_expired();
                    if removed > 0 {
                        tracing::debug!(removed, "expired local cache entries swept");
                        metrics::record_sweep_evictions(removed);
                    }
                    metrics::set_local_entries(cache.count());
                }
            }
        }

        tracing::debug!("local cache expiration sweep stopped");
    })
}
