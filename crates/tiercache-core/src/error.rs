//! Error types shared by every tier of the hybrid cache.
//!
//! A missing key is never an error: lookups return `Ok(None)` and removals
//! return `Ok(false)`. Only transport, payload and cancellation problems are
//! surfaced through [`CacheError`].

use thiserror::Error;

/// Errors that can occur during cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The distributed tier (or the bus transport) could not be reached.
    #[error("Backend unavailable: {message}")]
    BackendUnavailable {
        /// Description of the transport failure.
        message: String,
    },

    /// A stored value or an invalidation message could not be decoded.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Description of the decoding failure.
        message: String,
    },

    /// Publishing an invalidation message failed.
    #[error("Channel publish failure: {message}")]
    ChannelPublish {
        /// Description of the publish failure.
        message: String,
    },

    /// The caller's cancellation token fired before the operation finished.
    #[error("Operation cancelled")]
    Cancelled,

    /// The cache was configured with invalid settings.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },
}

impl CacheError {
    /// Creates a new `BackendUnavailable` error.
    #[must_use]
    pub fn backend_unavailable(message: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            message: message.into(),
        }
    }

    /// Creates a new `Serialization` error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Creates a new `ChannelPublish` error.
    #[must_use]
    pub fn channel_publish(message: impl Into<String>) -> Self {
        Self::ChannelPublish {
            message: message.into(),
        }
    }

    /// Creates a new `Configuration` error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Returns `true` if the distributed tier could not be reached.
    #[must_use]
    pub fn is_backend_unavailable(&self) -> bool {
        matches!(self, Self::BackendUnavailable { .. })
    }

    /// Returns `true` if the operation was cancelled by the caller.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns `true` if a payload failed to decode.
    #[must_use]
    pub fn is_serialization(&self) -> bool {
        matches!(self, Self::Serialization { .. })
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CacheError::backend_unavailable("connection refused");
        assert_eq!(err.to_string(), "Backend unavailable: connection refused");

        let err = CacheError::channel_publish("bus closed");
        assert_eq!(err.to_string(), "Channel publish failure: bus closed");

        assert_eq!(CacheError::Cancelled.to_string(), "Operation cancelled");
    }

    #[test]
    fn test_error_predicates() {
        assert!(CacheError::backend_unavailable("x").is_backend_unavailable());
        assert!(!CacheError::serialization("x").is_backend_unavailable());
        assert!(CacheError::Cancelled.is_cancelled());
        assert!(CacheError::serialization("x").is_serialization());
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i64>("not a number").unwrap_err();
        let err: CacheError = json_err.into();
        assert!(err.is_serialization());
    }
}
