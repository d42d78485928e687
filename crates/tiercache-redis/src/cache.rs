//! Redis-backed distributed tier.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Connection, Pool};
use redis::{AsyncCommands, ErrorKind, RedisError};
use tiercache_core::{CacheError, DistributedCache, Result};

/// Keys fetched per SCAN round trip during prefix removal.
const SCAN_BATCH: usize = 1000;

/// Redis rejects expirations whose absolute time overflows a signed 64-bit
/// millisecond clock. Longer ttls are capped here (about 146 million years).
const MAX_TTL_MILLIS: u64 = (i64::MAX / 2) as u64;

/// Distributed tier stored in Redis.
///
/// | Operation              | Command                       |
/// |------------------------|-------------------------------|
/// | get / get_expiration   | `GET` + `PTTL` (one pipeline) |
/// | set / add / replace    | `SET [PX ms] [NX \| XX]`      |
/// | remove / remove_all    | `DEL`, `FLUSHDB` for all keys |
/// | remove_by_prefix       | `SCAN MATCH prefix*` + `DEL`  |
/// | increment              | `INCRBY` + `PEXPIRE`          |
/// | set_expiration         | `PEXPIRE`                     |
///
/// Any transport or server failure maps to [`CacheError::BackendUnavailable`].
#[derive(Clone)]
pub struct RedisDistributedCache {
    pool: Pool,
}

impl RedisDistributedCache {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn conn(&self) -> Result<Connection> {
        self.pool.get().await.map_err(|e| {
            CacheError::backend_unavailable(format!("failed to get Redis connection: {e}"))
        })
    }

    async fn set_with(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
        condition: Option<&str>,
    ) -> Result<bool> {
        let mut conn = self.conn().await?;

        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        if let Some(condition) = condition {
            cmd.arg(condition);
        }

        // Conditional SET replies nil when the condition does not hold.
        let reply: Option<String> = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_error("SET", key, e))?;
        Ok(reply.is_some())
    }
}

impl std::fmt::Debug for RedisDistributedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = self.pool.status();
        f.debug_struct("RedisDistributedCache")
            .field("pool_size", &status.size)
            .field("pool_available", &status.available)
            .finish()
    }
}

#[async_trait]
impl DistributedCache for RedisDistributedCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn().await?;
        conn.get(key).await.map_err(|e| redis_error("GET", key, e))
    }

    async fn get_expiration(&self, key: &str) -> Result<Option<Duration>> {
        let mut conn = self.conn().await?;
        let pttl: i64 = redis::cmd("PTTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_error("PTTL", key, e))?;
        Ok(pttl_to_duration(pttl))
    }

    async fn get_with_expiration(
        &self,
        key: &str,
    ) -> Result<Option<(Vec<u8>, Option<Duration>)>> {
        let mut conn = self.conn().await?;
        let (data, pttl): (Option<Vec<u8>>, i64) = redis::pipe()
            .atomic()
            .cmd("GET")
            .arg(key)
            .cmd("PTTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_error("GET", key, e))?;

        Ok(data.map(|data| (data, pttl_to_duration(pttl))))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<bool> {
        let stored = self.set_with(key, value, ttl, None).await?;
        tracing::debug!(key = %key, ttl_ms = ?ttl.map(ttl_millis), "redis set");
        Ok(stored)
    }

    async fn add(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<bool> {
        self.set_with(key, value, ttl, Some("NX")).await
    }

    async fn replace(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<bool> {
        self.set_with(key, value, ttl, Some("XX")).await
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let removed: u64 = conn.del(key).await.map_err(|e| redis_error("DEL", key, e))?;
        Ok(removed > 0)
    }

    async fn remove_all(&self, keys: Option<&[String]>) -> Result<u64> {
        let mut conn = self.conn().await?;

        match keys {
            Some([]) => Ok(0),
            Some(keys) => conn
                .del(keys)
                .await
                .map_err(|e| redis_error("DEL", "<many>", e)),
            None => {
                let (size, ()): (u64, ()) = redis::pipe()
                    .atomic()
                    .cmd("DBSIZE")
                    .cmd("FLUSHDB")
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| redis_error("FLUSHDB", "*", e))?;
                tracing::info!(removed = size, "flushed redis database");
                Ok(size)
            }
        }
    }

    async fn remove_by_prefix(&self, prefix: &str) -> Result<u64> {
        if prefix.is_empty() {
            return self.remove_all(None).await;
        }

        let mut conn = self.conn().await?;
        let pattern = format!("{}*", escape_glob(prefix));
        let mut cursor: u64 = 0;
        let mut removed: u64 = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(|e| redis_error("SCAN", prefix, e))?;

            if !keys.is_empty() {
                let deleted: u64 = conn
                    .del(&keys)
                    .await
                    .map_err(|e| redis_error("DEL", prefix, e))?;
                removed += deleted;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        tracing::debug!(prefix = %prefix, removed, "redis prefix removal");
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        conn.exists(key)
            .await
            .map_err(|e| redis_error("EXISTS", key, e))
    }

    async fn increment(&self, key: &str, amount: i64, ttl: Option<Duration>) -> Result<i64> {
        let mut conn = self.conn().await?;

        let mut pipe = redis::pipe();
        pipe.atomic().cmd("INCRBY").arg(key).arg(amount);
        if let Some(ttl) = ttl {
            pipe.cmd("PEXPIRE").arg(key).arg(ttl_millis(ttl)).ignore();
        }

        let (value,): (i64,) = pipe.query_async(&mut conn).await.map_err(|e| {
            if e.kind() == ErrorKind::ResponseError {
                CacheError::serialization(format!("value at '{key}' is not an integer: {e}"))
            } else {
                redis_error("INCRBY", key, e)
            }
        })?;
        Ok(value)
    }

    async fn set_expiration(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn().await?;
        redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_error("PEXPIRE", key, e))
    }
}

fn redis_error(command: &str, key: &str, e: RedisError) -> CacheError {
    tracing::warn!(command, key = %key, error = %e, "redis command failed");
    CacheError::backend_unavailable(format!("Redis {command} failed: {e}"))
}

/// Redis rejects `PX 0`; sub-millisecond ttls round up and huge ones are
/// capped at [`MAX_TTL_MILLIS`].
fn ttl_millis(ttl: Duration) -> u64 {
    ttl.as_millis().clamp(1, u128::from(MAX_TTL_MILLIS)) as u64
}

/// `PTTL` replies -2 for a missing key and -1 for a key without expiry.
fn pttl_to_duration(pttl: i64) -> Option<Duration> {
    u64::try_from(pttl).ok().map(Duration::from_millis)
}

/// Escape the glob metacharacters understood by `SCAN MATCH`.
fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
