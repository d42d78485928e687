//! Metrics for the hybrid cache.
//!
//! Everything is recorded through the `metrics` facade. The library installs
//! no recorder; an application that wants Prometheus output installs one at
//! startup and these counters show up there.
//!
//! - Local/remote hit and miss rates
//! - Local entry gauge and sweep evictions
//! - Invalidation traffic and publish failures

use metrics::{counter, gauge};

/// Metric names as constants for consistency.
pub mod names {
    // Lookup metrics
    pub const CACHE_HITS_TOTAL: &str = "tiercache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "tiercache_misses_total";
    pub const CACHE_ENTRIES: &str = "tiercache_local_entries";

    // Expiration
    pub const SWEEP_EVICTIONS_TOTAL: &str = "tiercache_sweep_evictions_total";

    // Invalidation channel
    pub const INVALIDATIONS_RECEIVED_TOTAL: &str = "tiercache_invalidations_received_total";
    pub const INVALIDATIONS_IGNORED_TOTAL: &str = "tiercache_invalidations_ignored_total";
    pub const INVALIDATIONS_MALFORMED_TOTAL: &str = "tiercache_invalidations_malformed_total";
    pub const PUBLISH_FAILURES_TOTAL: &str = "tiercache_publish_failures_total";
}

/// Tier label for the in-process cache.
pub const TIER_LOCAL: &str = "local";

/// Tier label for the distributed cache.
pub const TIER_REMOTE: &str = "remote";

/// Record a cache hit.
pub fn record_cache_hit(tier: &str) {
    counter!(names::CACHE_HITS_TOTAL, "tier" => tier.to_string()).increment(1);
}

/// Record a cache miss.
pub fn record_cache_miss(tier: &str) {
    counter!(names::CACHE_MISSES_TOTAL, "tier" => tier.to_string()).increment(1);
}

/// Set the number of local cache entries.
pub fn set_local_entries(count: usize) {
    gauge!(names::CACHE_ENTRIES).set(count as f64);
}

/// Record entries evicted by the expiration sweep.
pub fn record_sweep_evictions(count: usize) {
    counter!(names::SWEEP_EVICTIONS_TOTAL).increment(count as u64);
}

/// Record an applied invalidation message.
pub fn record_invalidation_received(kind: &'static str) {
    counter!(names::INVALIDATIONS_RECEIVED_TOTAL, "kind" => kind).increment(1);
}

/// Record a self-originated invalidation that was skipped.
pub fn record_invalidation_ignored() {
    counter!(names::INVALIDATIONS_IGNORED_TOTAL).increment(1);
}

/// Record an invalidation payload that failed to decode.
pub fn record_invalidation_malformed() {
    counter!(names::INVALIDATIONS_MALFORMED_TOTAL).increment(1);
}

/// Record a swallowed publish failure.
pub fn record_publish_failure() {
    counter!(names::PUBLISH_FAILURES_TOTAL).increment(1);
}
