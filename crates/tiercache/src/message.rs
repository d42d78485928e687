//! Wire format of invalidation messages.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Notice that local copies of some keys are stale.
///
/// - `flush_local`, or no keys and no prefixes: every local entry is evicted.
/// - `prefixes`: every local key starting with one of them is evicted.
/// - `keys` with `renew = false`: the named keys are evicted.
/// - `keys` with `renew = true`: the named keys keep their value and take
///   `expires_at` as their new deadline.
///
/// Applying a message twice leaves the same state as applying it once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationMessage {
    /// Identifier of the hybrid cache instance that published the message.
    pub cache_id: String,

    #[serde(default)]
    pub keys: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prefixes: Vec<String>,

    #[serde(default)]
    pub flush_local: bool,

    /// Absolute deadline as unix milliseconds (UTC).
    #[serde(default)]
    pub expires_at: Option<i64>,

    #[serde(default)]
    pub renew: bool,
}

impl InvalidationMessage {
    fn empty(cache_id: &str) -> Self {
        Self {
            cache_id: cache_id.to_string(),
            keys: Vec::new(),
            prefixes: Vec::new(),
            flush_local: false,
            expires_at: None,
            renew: false,
        }
    }

    /// Evict the given keys.
    pub fn for_keys<I, S>(cache_id: &str, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
            ..Self::empty(cache_id)
        }
    }

    /// Evict every key starting with `prefix`.
    pub fn for_prefix(cache_id: &str, prefix: &str) -> Self {
        Self {
            prefixes: vec![prefix.to_string()],
            ..Self::empty(cache_id)
        }
    }

    /// Evict everything.
    pub fn flush(cache_id: &str) -> Self {
        Self {
            flush_local: true,
            ..Self::empty(cache_id)
        }
    }

    /// Move the deadline of the given key to `ttl` from now.
    pub fn renewal(cache_id: &str, key: &str, ttl: Duration) -> Self {
        Self {
            keys: vec![key.to_string()],
            renew: true,
            ..Self::empty(cache_id)
        }
        .with_ttl(Some(ttl))
    }

    /// Stamp the absolute deadline derived from `ttl`.
    ///
    /// A deadline past the representable calendar range is left unset, which
    /// receivers treat as no expiry.
    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.expires_at = ttl.and_then(|ttl| {
            let ttl = time::Duration::try_from(ttl).ok()?;
            let deadline = OffsetDateTime::now_utc().checked_add(ttl)?;
            i64::try_from(deadline.unix_timestamp_nanos() / 1_000_000).ok()
        });
        self
    }

    /// Whether receivers must drop every local entry.
    pub fn is_flush(&self) -> bool {
        self.flush_local || (self.keys.is_empty() && self.prefixes.is_empty())
    }

    /// Label used for logs and metrics.
    pub fn kind(&self) -> &'static str {
        if self.is_flush() {
            "flush"
        } else if self.renew {
            "renew"
        } else if !self.prefixes.is_empty() {
            "prefix"
        } else {
            "keys"
        }
    }

    /// Convert `expires_at` into a deadline on this process's monotonic
    /// clock. A deadline that already passed maps to `now`; one beyond the
    /// clock's range maps to `None`.
    pub fn local_deadline(&self) -> Option<Instant> {
        let expires_at = self.expires_at?;
        let now_ms = (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64;
        let remaining = expires_at.saturating_sub(now_ms).max(0) as u64;
        Instant::now().checked_add(Duration::from_millis(remaining))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_field_names() {
        let msg = InvalidationMessage::for_keys("abc", ["k1"]);
        let json: serde_json::Value = serde_json::from_slice(&msg.to_bytes().unwrap()).unwrap();

        assert_eq!(json["cacheId"], "abc");
        assert_eq!(json["keys"], serde_json::json!(["k1"]));
        assert_eq!(json["flushLocal"], false);
        assert!(json["expiresAt"].is_null());
        assert!(json.get("prefixes").is_none());
    }

    #[test]
    fn test_decodes_minimal_payload() {
        let msg = InvalidationMessage::from_bytes(br#"{"cacheId":"x","keys":["a"]}"#).unwrap();
        assert_eq!(msg.keys, vec!["a".to_string()]);
        assert!(!msg.renew);
        assert!(!msg.is_flush());
        assert_eq!(msg.kind(), "keys");
    }

    #[test]
    fn test_rejects_malformed_payload() {
        assert!(InvalidationMessage::from_bytes(b"not json").is_err());
        assert!(InvalidationMessage::from_bytes(br#"{"keys":["a"]}"#).is_err());
    }

    #[test]
    fn test_empty_keys_mean_flush() {
        let msg = InvalidationMessage::for_keys("x", Vec::<String>::new());
        assert!(msg.is_flush());
        assert!(InvalidationMessage::flush("x").is_flush());
        assert!(!InvalidationMessage::for_prefix("x", "p:").is_flush());
    }

    #[test]
    fn test_local_deadline_tracks_ttl() {
        let msg = InvalidationMessage::renewal("x", "k", Duration::from_secs(10));
        assert_eq!(msg.kind(), "renew");

        let deadline = msg.local_deadline().unwrap();
        let remaining = deadline.saturating_duration_since(Instant::now());
        assert!(remaining > Duration::from_secs(9));
        assert!(remaining <= Duration::from_secs(10));
    }

    #[test]
    fn test_huge_ttl_leaves_deadline_unset() {
        let msg = InvalidationMessage::for_keys("x", ["k"])
            .with_ttl(Some(Duration::from_secs(u64::MAX / 2)));
        assert_eq!(msg.expires_at, None);

        let msg = InvalidationMessage::renewal("x", "k", Duration::MAX);
        assert_eq!(msg.expires_at, None);
        assert_eq!(msg.local_deadline(), None);
    }

    #[test]
    fn test_far_deadline_from_peer_is_accepted() {
        let mut msg = InvalidationMessage::for_keys("x", ["k"]);
        msg.expires_at = Some(i64::MAX);
        // Either representable or treated as no expiry; never a panic.
        let _ = msg.local_deadline();
    }

    #[test]
    fn test_past_deadline_maps_to_now() {
        let mut msg = InvalidationMessage::for_keys("x", ["k"]);
        msg.expires_at = Some(0);
        let deadline = msg.local_deadline().unwrap();
        assert!(deadline <= Instant::now());
    }
}
