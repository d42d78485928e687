//! In-memory backends for tiercache.
//!
//! This crate provides process-local implementations of the
//! `DistributedCache` and `MessageBus` contracts from `tiercache-core`.
//! Several hybrid cache instances sharing one [`InMemoryDistributedCache`] and
//! one [`InMemoryMessageBus`] behave like several processes sharing a Redis
//! server, which makes them the natural substitute in tests.
//!
//! # Example
//!
//! ```ignore
//! use tiercache_memory::{InMemoryDistributedCache, InMemoryMessageBus};
//!
//! let backend = InMemoryDistributedCache::new_shared();
//! let bus = InMemoryMessageBus::new_shared();
//! ```

pub mod bus;
pub mod cache;

pub use bus::InMemoryMessageBus;
pub use cache::InMemoryDistributedCache;

// Re-export the contracts for convenience
pub use tiercache_core::{CacheError, DistributedCache, MessageBus};
