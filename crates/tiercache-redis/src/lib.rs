//! Redis backends for tiercache.
//!
//! - [`RedisDistributedCache`]: the shared, authoritative tier
//! - [`RedisMessageBus`]: pub/sub transport for invalidation messages
//!
//! [`create_redis_hybrid_cache`] wires both into a
//! [`HybridCacheClient`](tiercache::HybridCacheClient).

pub mod bus;
pub mod cache;

pub use bus::RedisMessageBus;
pub use cache::RedisDistributedCache;

use std::sync::Arc;

use deadpool_redis::{Pool, Runtime};
use tiercache::{HybridCacheClient, HybridCacheSettings, RedisConfig};
use tiercache_core::{CacheError, Result};

/// Create a connection pool and check that Redis answers.
pub async fn create_pool(config: &RedisConfig) -> Result<Pool> {
    config.validate()?;
    tracing::info!(url = %config.url, pool_size = config.pool_size, "Connecting to Redis");

    let mut redis_config = deadpool_redis::Config::from_url(&config.url);
    let mut pool_config = redis_config.get_pool_config();
    pool_config.max_size = config.pool_size;
    pool_config.timeouts.wait = Some(config.timeout());
    pool_config.timeouts.create = Some(config.timeout());
    pool_config.timeouts.recycle = Some(config.timeout());
    redis_config.pool = Some(pool_config);

    let pool = redis_config
        .create_pool(Some(Runtime::Tokio1))
        .map_err(|e| CacheError::configuration(format!("failed to create Redis pool: {e}")))?;

    // Test connection
    pool.get().await.map_err(|e| {
        CacheError::backend_unavailable(format!("failed to connect to Redis: {e}"))
    })?;
    tracing::info!("Connected to Redis");

    Ok(pool)
}

/// Build a hybrid cache whose distributed tier and bus both live in Redis.
///
/// Fails when Redis is unreachable; there is no local-only fallback, since a
/// hybrid cache without its shared tier would silently lose coherence.
pub async fn create_redis_hybrid_cache(settings: HybridCacheSettings) -> Result<HybridCacheClient> {
    settings.validate()?;

    let pool = create_pool(&settings.redis).await?;
    let distributed = Arc::new(RedisDistributedCache::new(pool.clone()));
    let bus = Arc::new(RedisMessageBus::new(pool, &settings.redis.url)?);

    HybridCacheClient::new(distributed, bus, settings).await
}
