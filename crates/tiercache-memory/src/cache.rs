//! In-memory implementation of the distributed-tier contract.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tiercache_core::{CacheError, DistributedCache, Result};

/// A stored value with an optional deadline. A ttl beyond the monotonic
/// clock's range is stored without one.
#[derive(Debug, Clone)]
struct StoredValue {
    data: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn new(data: Vec<u8>, ttl: Option<Duration>) -> Self {
        Self {
            data,
            expires_at: ttl.and_then(|ttl| Instant::now().checked_add(ttl)),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Process-local stand-in for a shared key-value server.
///
/// Expired keys are dropped lazily on access. [`set_available`] lets tests
/// simulate an unreachable backend.
///
/// [`set_available`]: InMemoryDistributedCache::set_available
#[derive(Debug, Default)]
pub struct InMemoryDistributedCache {
    entries: DashMap<String, StoredValue>,
    unavailable: AtomicBool,
}

impl InMemoryDistributedCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty cache wrapped in an Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Toggle simulated availability. While unavailable every call fails
    /// with `BackendUnavailable`.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Number of live (non-expired) keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    /// Returns `true` when no live keys are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CacheError::backend_unavailable(
                "in-memory backend marked unavailable",
            ));
        }
        Ok(())
    }

    /// Look up a live entry, evicting it if it has expired.
    fn live(&self, key: &str) -> Option<StoredValue> {
        let now = Instant::now();
        let entry = self.entries.get(key)?;
        if entry.is_expired(now) {
            drop(entry);
            self.entries.remove_if(key, |_, v| v.is_expired(now));
            return None;
        }
        Some(entry.clone())
    }
}

#[async_trait]
impl DistributedCache for InMemoryDistributedCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.ensure_available()?;
        Ok(self.live(key).map(|v| v.data))
    }

    async fn get_expiration(&self, key: &str) -> Result<Option<Duration>> {
        self.ensure_available()?;
        let now = Instant::now();
        Ok(self
            .live(key)
            .and_then(|v| v.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }

    async fn get_with_expiration(
        &self,
        key: &str,
    ) -> Result<Option<(Vec<u8>, Option<Duration>)>> {
        self.ensure_available()?;
        let now = Instant::now();
        Ok(self.live(key).map(|v| {
            let ttl = v.expires_at.map(|at| at.saturating_duration_since(now));
            (v.data, ttl)
        }))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<bool> {
        self.ensure_available()?;
        self.entries
            .insert(key.to_string(), StoredValue::new(value.to_vec(), ttl));
        Ok(true)
    }

    async fn add(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<bool> {
        self.ensure_available()?;
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(StoredValue::new(value.to_vec(), ttl));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredValue::new(value.to_vec(), ttl));
                Ok(true)
            }
        }
    }

    async fn replace(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<bool> {
        self.ensure_available()?;
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut existing) if !existing.is_expired(now) => {
                *existing = StoredValue::new(value.to_vec(), ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        self.ensure_available()?;
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, v)| !v.is_expired(now)))
    }

    async fn remove_all(&self, keys: Option<&[String]>) -> Result<u64> {
        self.ensure_available()?;
        let now = Instant::now();
        let removed = match keys {
            None => {
                let live = self.entries.iter().filter(|e| !e.is_expired(now)).count();
                self.entries.clear();
                live
            }
            Some(keys) => keys
                .iter()
                .filter(|k| {
                    self.entries
                        .remove(k.as_str())
                        .is_some_and(|(_, v)| !v.is_expired(now))
                })
                .count(),
        };
        Ok(removed as u64)
    }

    async fn remove_by_prefix(&self, prefix: &str) -> Result<u64> {
        self.ensure_available()?;
        let now = Instant::now();
        let mut removed = 0u64;
        self.entries.retain(|key, value| {
            if key.starts_with(prefix) {
                if !value.is_expired(now) {
                    removed += 1;
                }
                false
            } else {
                true
            }
        });
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.ensure_available()?;
        Ok(self.live(key).is_some())
    }

    async fn increment(&self, key: &str, amount: i64, ttl: Option<Duration>) -> Result<i64> {
        self.ensure_available()?;
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| StoredValue::new(b"0".to_vec(), None));

        if entry.is_expired(now) {
            *entry = StoredValue::new(b"0".to_vec(), None);
        }

        let current: i64 = std::str::from_utf8(&entry.data)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(|| {
                CacheError::serialization(format!("value at '{key}' is not an integer"))
            })?;

        let next = current.checked_add(amount).ok_or_else(|| {
            CacheError::serialization(format!("increment of '{key}' overflows i64"))
        })?;

        entry.data = next.to_string().into_bytes();
        if let Some(ttl) = ttl {
            entry.expires_at = now.checked_add(ttl);
        }
        Ok(next)
    }

    async fn set_expiration(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.ensure_available()?;
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut existing) if !existing.is_expired(now) => {
                existing.expires_at = now.checked_add(ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::block_on;

    #[tokio::test]
    async fn test_set_and_get() {
        let cache = InMemoryDistributedCache::new();
        assert!(cache.set("k", b"v", None).await.unwrap());
        assert_eq!(cache.get("k").await.unwrap(), Some(b"v".to_vec()));
        assert_eq!(cache.get_expiration("k").await.unwrap(), None);
        assert_eq!(cache.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unrepresentable_ttl_is_kept_without_deadline() {
        let cache = InMemoryDistributedCache::new();
        assert!(cache.set("k", b"v", Some(Duration::MAX)).await.unwrap());
        assert_eq!(cache.get("k").await.unwrap(), Some(b"v".to_vec()));
        assert_eq!(cache.get_expiration("k").await.unwrap(), None);

        assert!(cache.set_expiration("k", Duration::MAX).await.unwrap());
        assert_eq!(cache.increment("n", 1, Some(Duration::MAX)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let cache = InMemoryDistributedCache::new();
        cache
            .set("k", b"v", Some(Duration::from_millis(20)))
            .await
            .unwrap();

        let ttl = cache.get_expiration("k").await.unwrap().unwrap();
        assert!(ttl <= Duration::from_millis(20));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert!(!cache.exists("k").await.unwrap());
    }

    #[test]
    fn test_add_only_when_absent() {
        let cache = InMemoryDistributedCache::new();
        block_on(async {
            assert!(cache.add("k", b"1", None).await.unwrap());
            assert!(!cache.add("k", b"2", None).await.unwrap());
            assert_eq!(cache.get("k").await.unwrap(), Some(b"1".to_vec()));
        });
    }

    #[test]
    fn test_replace_only_when_present() {
        let cache = InMemoryDistributedCache::new();
        block_on(async {
            assert!(!cache.replace("k", b"1", None).await.unwrap());
            cache.set("k", b"1", None).await.unwrap();
            assert!(cache.replace("k", b"2", None).await.unwrap());
            assert_eq!(cache.get("k").await.unwrap(), Some(b"2".to_vec()));
        });
    }

    #[tokio::test]
    async fn test_remove_by_prefix() {
        let cache = InMemoryDistributedCache::new();
        cache.set("a:1", b"x", None).await.unwrap();
        cache.set("a:2", b"x", None).await.unwrap();
        cache.set("b:1", b"x", None).await.unwrap();

        assert_eq!(cache.remove_by_prefix("a:").await.unwrap(), 2);
        assert!(cache.exists("b:1").await.unwrap());
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_all_with_and_without_keys() {
        let cache = InMemoryDistributedCache::new();
        for key in ["a", "b", "c"] {
            cache.set(key, b"x", None).await.unwrap();
        }

        let keys = vec!["a".to_string(), "missing".to_string()];
        assert_eq!(cache.remove_all(Some(keys.as_slice())).await.unwrap(), 1);
        assert_eq!(cache.remove_all(None).await.unwrap(), 2);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_increment() {
        let cache = InMemoryDistributedCache::new();
        assert_eq!(cache.increment("n", 5, None).await.unwrap(), 5);
        assert_eq!(cache.increment("n", -2, None).await.unwrap(), 3);
        assert_eq!(cache.get("n").await.unwrap(), Some(b"3".to_vec()));

        cache.set("text", b"abc", None).await.unwrap();
        let err = cache.increment("text", 1, None).await.unwrap_err();
        assert!(err.is_serialization());
    }

    #[tokio::test]
    async fn test_set_expiration() {
        let cache = InMemoryDistributedCache::new();
        assert!(!cache.set_expiration("k", Duration::from_secs(1)).await.unwrap());
        cache.set("k", b"v", None).await.unwrap();
        assert!(cache.set_expiration("k", Duration::from_secs(10)).await.unwrap());
        assert!(cache.get_expiration("k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unavailable_backend() {
        let cache = InMemoryDistributedCache::new();
        cache.set_available(false);
        let err = cache.get("k").await.unwrap_err();
        assert!(err.is_backend_unavailable());

        cache.set_available(true);
        assert_eq!(cache.get("k").await.unwrap(), None);
    }
}
