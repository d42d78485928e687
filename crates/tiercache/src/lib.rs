//! Two-tier hybrid cache.
//!
//! A [`HybridCacheClient`] keeps a process-local copy of recently used entries
//! in front of a shared [`DistributedCache`]. Writes go to the distributed
//! tier first; every mutation then publishes an [`InvalidationMessage`] on a
//! [`MessageBus`] channel so that other instances drop their stale local copies.
//!
//! ```ignore
//! let cache = HybridCacheClient::new(distributed, bus, settings).await?;
//! cache.set("user:1", b"alice".to_vec(), Some(Duration::from_secs(60))).await?;
//! let value = cache.get("user:1").await?;
//! ```

pub mod channel;
pub mod client;
pub mod config;
pub mod hybrid;
pub mod local;
pub mod message;
pub mod metrics;
pub mod observability;
pub mod scoped;

pub use channel::InvalidationChannel;
pub use client::{CacheClient, CacheClientExt};
pub use config::{HybridCacheSettings, LoggingConfig, RedisConfig};
pub use hybrid::{HybridCacheClient, HybridCacheStats};
pub use local::{CacheEntry, CacheValue, KeyObservation, LocalCache, LocalCacheStats};
pub use message::InvalidationMessage;
pub use scoped::ScopedCache;

pub use tiercache_core::{
    CacheError, DistributedCache, DynDistributedCache, DynMessageBus, KeyScope, MessageBus,
    MessageHandler, Result, Subscription, with_cancellation,
};
