//! The cache contract offered to applications.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tiercache_core::Result;

use crate::local::CacheValue;

/// Cache operations exposed by the hybrid cache and its scoped views.
///
/// A missing key is a normal result (`Ok(None)` / `Ok(false)`); errors mean
/// the distributed tier could not be reached or a payload was malformed.
#[async_trait]
pub trait CacheClient: Send + Sync {
    /// Reads a value.
    async fn get(&self, key: &str) -> Result<Option<CacheValue>>;

    /// Reads several values. Missing keys map to `None`.
    async fn get_many(&self, keys: &[String]) -> Result<HashMap<String, Option<CacheValue>>> {
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            found.insert(key.clone(), self.get(key).await?);
        }
        Ok(found)
    }

    /// Writes a value, replacing any previous one.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<bool>;

    /// Writes several values with one shared ttl. Returns how many were written.
    async fn set_many(&self, entries: Vec<(String, Vec<u8>)>, ttl: Option<Duration>)
    -> Result<usize>;

    /// Writes a value only if the key does not exist yet.
    async fn add(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<bool>;

    /// Writes a value only if the key already exists.
    async fn replace(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<bool>;

    /// Removes a key.
    async fn remove(&self, key: &str) -> Result<bool>;

    /// Removes the given keys, or every key when `keys` is `None`.
    async fn remove_all(&self, keys: Option<&[String]>) -> Result<u64>;

    /// Removes every key starting with `prefix`.
    async fn remove_by_prefix(&self, prefix: &str) -> Result<u64>;

    /// Checks whether a key exists in the distributed tier.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Adds `amount` to a numeric value and returns the new value.
    async fn increment(&self, key: &str, amount: i64, ttl: Option<Duration>) -> Result<i64>;

    /// Remaining time-to-live of a key, `None` if absent or non-expiring.
    async fn get_expiration(&self, key: &str) -> Result<Option<Duration>>;

    /// Resets the time-to-live of an existing key.
    async fn set_expiration(&self, key: &str, ttl: Duration) -> Result<bool>;
}

/// Typed helpers on top of [`CacheClient`], encoding values as JSON.
#[async_trait]
pub trait CacheClientExt: CacheClient {
    /// Reads and decodes a value.
    ///
    /// A value that does not decode as `T` is logged and treated as a miss.
    async fn get_json<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        let Some(bytes) = self.get(key).await? else {
            return Ok(None);
        };

        match serde_json::from_slice(&bytes) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "cached value failed to decode, treating as miss");
                Ok(None)
            }
        }
    }

    /// Encodes and writes a value.
    async fn set_json<T>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<bool>
    where
        T: Serialize + Sync + ?Sized,
    {
        let bytes = serde_json::to_vec(value)?;
        self.set(key, bytes, ttl).await
    }
}

impl<C: CacheClient + ?Sized> CacheClientExt for C {}
