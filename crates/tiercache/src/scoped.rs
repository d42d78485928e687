//! Scoped view over a hybrid cache.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tiercache_core::{KeyScope, Result};

use crate::client::CacheClient;
use crate::hybrid::HybridCacheClient;
use crate::local::CacheValue;

/// A [`HybridCacheClient`] seen through a key prefix.
///
/// Every key is stored as `scope<sep>key`, so two scopes over the same
/// backend never see each other's entries. `remove_all(None)` only clears
/// this scope.
#[derive(Debug, Clone)]
pub struct ScopedCache {
    client: HybridCacheClient,
    scope: KeyScope,
}

impl ScopedCache {
    pub fn new(client: HybridCacheClient, scope: KeyScope) -> Self {
        Self { client, scope }
    }

    pub fn scope(&self) -> &KeyScope {
        &self.scope
    }

    /// The underlying unscoped client.
    pub fn inner(&self) -> &HybridCacheClient {
        &self.client
    }

    /// A scope nested inside this one.
    pub fn scoped(&self, name: &str) -> ScopedCache {
        let scope = self.scope.nested(name, self.client.scope_separator());
        ScopedCache::new(self.client.clone(), scope)
    }

    fn scoped_keys(&self, keys: &[String]) -> Vec<String> {
        keys.iter().map(|key| self.scope.apply(key)).collect()
    }
}

#[async_trait]
impl CacheClient for ScopedCache {
    async fn get(&self, key: &str) -> Result<Option<CacheValue>> {
        self.client.get(&self.scope.apply(key)).await
    }

    async fn get_many(&self, keys: &[String]) -> Result<HashMap<String, Option<CacheValue>>> {
        let found = self.client.get_many(&self.scoped_keys(keys)).await?;
        Ok(found
            .into_iter()
            .filter_map(|(scoped, value)| {
                let key = self.scope.strip(&scoped)?;
                Some((key.to_string(), value))
            })
            .collect())
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<bool> {
        self.client.set(&self.scope.apply(key), value, ttl).await
    }

    async fn set_many(
        &self,
        entries: Vec<(String, Vec<u8>)>,
        ttl: Option<Duration>,
    ) -> Result<usize> {
        let entries = entries
            .into_iter()
            .map(|(key, value)| (self.scope.apply(&key), value))
            .collect();
        self.client.set_many(entries, ttl).await
    }

    async fn add(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<bool> {
        self.client.add(&self.scope.apply(key), value, ttl).await
    }

    async fn replace(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<bool> {
        self.client.replace(&self.scope.apply(key), value, ttl).await
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        self.client.remove(&self.scope.apply(key)).await
    }

    async fn remove_all(&self, keys: Option<&[String]>) -> Result<u64> {
        match keys {
            Some(keys) => self.client.remove_all(Some(&self.scoped_keys(keys))).await,
            None if self.scope.is_root() => self.client.remove_all(None).await,
            None => self.client.remove_by_prefix(self.scope.prefix()).await,
        }
    }

    async fn remove_by_prefix(&self, prefix: &str) -> Result<u64> {
        self.client
            .remove_by_prefix(&self.scope.apply(prefix))
            .await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.client.exists(&self.scope.apply(key)).await
    }

    async fn increment(&self, key: &str, amount: i64, ttl: Option<Duration>) -> Result<i64> {
        self.client
            .increment(&self.scope.apply(key), amount, ttl)
            .await
    }

    async fn get_expiration(&self, key: &str) -> Result<Option<Duration>> {
        self.client.get_expiration(&self.scope.apply(key)).await
    }

    async fn set_expiration(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.client
            .set_expiration(&self.scope.apply(key), ttl)
            .await
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

    #[tokio::test]
    async fn test_scopes_do_not_collide() {
        let cache = client().await;
        let users = cache.scoped("users");
        let orders = cache.scoped("orders");

        users.set("1", b"alice".to_vec(), None).await.unwrap();
        orders.set("1", b"order".to_vec(), None).await.unwrap();

        assert_eq!(users.get("1").await.unwrap().unwrap().as_slice(), b"alice");
        assert_eq!(orders.get("1").await.unwrap().unwrap().as_slice(), b"order");
        assert!(cache.local_cache().contains("users:1"));
    }

    #[tokio::test]
    async fn test_remove_all_only_clears_own_scope() {
        let cache = client().await;
        let users = cache.scoped("users");
        cache.set("plain", b"x".to_vec(), None).await.unwrap();
        users.set("1", b"a".to_vec(), None).await.unwrap();
        users.set("2", b"b".to_vec(), None).await.unwrap();

        assert_eq!(users.remove_all(None).await.unwrap(), 2);
        assert_eq!(users.get("1").await.unwrap(), None);
        assert!(cache.get("plain").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_nested_scope_and_get_many() {
        let cache = client().await;
        let tenant = cache.scoped("tenant-1");
        let orders = tenant.scoped("orders");
        assert_eq!(orders.scope().prefix(), "tenant-1:orders:");

        orders.set("42", b"x".to_vec(), None).await.unwrap();
        let keys = vec!["42".to_string(), "43".to_string()];
        let found = orders.get_many(&keys).await.unwrap();

        assert_eq!(found.len(), 2);
        assert!(found["42"].is_some());
        assert!(found["43"].is_none());
        assert!(cache.get("tenant-1:orders:42").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_get_many_returns_caller_keys() {
        let cache = client().await;
        let users = cache.scoped("users");
        users.set("a:b", b"1".to_vec(), None).await.unwrap();

        let keys = vec!["a:b".to_string(), "users:a:b".to_string()];
        let found = users.get_many(&keys).await.unwrap();

        let mut returned: Vec<_> = found.keys().cloned().collect();
        returned.sort();
        assert_eq!(returned, keys);
        assert_eq!(found["a:b"].as_deref().map(Vec::as_slice), Some(&b"1"[..]));
        assert!(found["users:a:b"].is_none());
    }
}
