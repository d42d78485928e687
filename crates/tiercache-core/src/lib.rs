//! Core contracts for the tiercache hybrid cache.
//!
//! This crate holds what every tier agrees on: the error type, key scoping,
//! and the two external contracts the hybrid cache consumes:
//!
//! - [`DistributedCache`]: the shared, authoritative key-value tier
//! - [`MessageBus`]: the publish/subscribe transport for invalidations
//!
//! Backends live in sibling crates (`tiercache-memory`, `tiercache-redis`).

pub mod cancel;
pub mod error;
pub mod key;
pub mod traits;

pub use cancel::with_cancellation;
pub use error::{CacheError, Result};
pub use key::{DEFAULT_SCOPE_SEPARATOR, KeyScope};
pub use traits::{DistributedCache, MessageBus, MessageHandler, Subscription};

/// Type alias for a shareable distributed cache.
pub type DynDistributedCache = std::sync::Arc<dyn DistributedCache>;

/// Type alias for a shareable message bus.
pub type DynMessageBus = std::sync::Arc<dyn MessageBus>;
